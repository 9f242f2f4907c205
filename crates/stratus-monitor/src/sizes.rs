// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Size (flavor) reconciliation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument};

use stratus_core::error::CoreError;
use stratus_core::persistence::{NewSize, SizeRecord};
use stratus_core::persistence::sqlite::SIZE_ALIAS_SENTINEL;

use crate::MonitorContext;
use crate::error::Result;

/// Fan out a size pass to every active provider.
pub async fn monitor_sizes(ctx: Arc<MonitorContext>) -> Result<Vec<i64>> {
    let providers = ctx.store.list_active_providers().await?;
    let mut dispatched = Vec::with_capacity(providers.len());
    for provider in providers {
        dispatched.push(provider.id);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor_sizes_for(&ctx, provider.id).await {
                error!(
                    provider_id = provider.id,
                    error = %err,
                    "Size monitor failed"
                );
            }
        });
    }
    Ok(dispatched)
}

/// Reconcile one provider's sizes.
///
/// Sizes reported by the cloud are upserted (renames and attribute
/// changes converge in place); store sizes the cloud no longer lists are
/// end-dated. Placeholder "Unknown Size" records left behind by instance
/// monitoring are repaired by individual lookup: a 404 means the size is
/// truly gone, any other failure fails this unit.
#[instrument(skip(ctx))]
pub async fn monitor_sizes_for(ctx: &MonitorContext, provider_id: i64) -> Result<Vec<SizeRecord>> {
    let provider = ctx
        .store
        .get_provider(provider_id)
        .await?
        .ok_or(CoreError::ProviderNotFound { provider_id })?;
    info!(provider = %provider.name, "Starting size monitor");

    let db_sizes = ctx.store.list_current_sizes(provider_id).await?;
    let cloud_sizes = ctx.snapshots.list_all_sizes(provider_id).await?;

    let mut seen = Vec::with_capacity(cloud_sizes.len());
    for cloud_size in &cloud_sizes {
        let record = ctx
            .store
            .upsert_size(
                provider_id,
                &NewSize {
                    alias: cloud_size.id.clone(),
                    name: cloud_size.name.clone(),
                    cpu: cloud_size.cpu,
                    mem: cloud_size.mem,
                    disk: cloud_size.disk,
                },
            )
            .await?;
        seen.push(record);
    }
    let mut seen_aliases: HashSet<String> =
        seen.iter().map(|size| size.alias.clone()).collect();

    // Find a home for placeholder sizes created while an instance's
    // flavor was unresolvable. Lookup sizes may not show up in the bulk
    // listing; a size confirmed by individual lookup counts as seen so
    // the diff below leaves it current.
    for unknown in ctx.store.list_unknown_sizes(provider_id).await? {
        if unknown.alias == SIZE_ALIAS_SENTINEL || seen_aliases.contains(&unknown.alias) {
            continue;
        }
        match ctx.snapshots.get_size(provider_id, &unknown.alias).await {
            Ok(Some(cloud_size)) => {
                info!(alias = %unknown.alias, "Repairing unknown size from lookup");
                let record = ctx
                    .store
                    .upsert_size(
                        provider_id,
                        &NewSize {
                            alias: cloud_size.id.clone(),
                            name: cloud_size.name.clone(),
                            cpu: cloud_size.cpu,
                            mem: cloud_size.mem,
                            disk: cloud_size.disk,
                        },
                    )
                    .await?;
                seen_aliases.insert(record.alias.clone());
                seen.push(record);
            }
            Ok(None) => {
                // Truly deleted cloud-side; the diff below end-dates it.
                debug!(alias = %unknown.alias, "Unknown size no longer exists");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let now = Utc::now();
    for size in &db_sizes {
        if seen_aliases.contains(size.alias.as_str()) || size.alias == SIZE_ALIAS_SENTINEL {
            continue;
        }
        debug!(alias = %size.alias, "End dating inactive size");
        ctx.store.end_date_size(size.id, now).await?;
    }

    Ok(seen)
}
