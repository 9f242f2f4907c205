// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume reconciliation.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument};

use stratus_core::error::CoreError;
use stratus_core::persistence::NewVolume;

use crate::MonitorContext;
use crate::cache::SnapshotCache;
use crate::error::Result;

/// Fan out a volume pass to every active provider.
pub async fn monitor_volumes(ctx: Arc<MonitorContext>) -> Result<Vec<i64>> {
    let providers = ctx.store.list_active_providers().await?;
    let mut dispatched = Vec::with_capacity(providers.len());
    for provider in providers {
        dispatched.push(provider.id);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor_volumes_for(&ctx, provider.id).await {
                error!(
                    provider_id = provider.id,
                    error = %err,
                    "Volume monitor failed"
                );
            }
        });
    }
    Ok(dispatched)
}

/// Reconcile one provider's volumes.
///
/// Cloud volumes are registered under the identity owning their project;
/// a volume whose project has no identity is skipped at info level.
/// Store volumes the cloud no longer reports are end-dated.
/// Returns the identifiers of the volumes seen.
#[instrument(skip(ctx))]
pub async fn monitor_volumes_for(ctx: &MonitorContext, provider_id: i64) -> Result<Vec<String>> {
    let provider = ctx
        .store
        .get_provider(provider_id)
        .await?
        .ok_or(CoreError::ProviderNotFound { provider_id })?;
    info!(provider = %provider.name, "Starting volume monitor");

    let mut cache = SnapshotCache::new();
    let db_volumes = ctx.store.list_current_volumes(provider_id).await?;
    let cloud_volumes = ctx.snapshots.list_all_volumes(provider_id).await?;
    let tenant_map = cache
        .tenant_name_map(ctx.snapshots.as_ref(), provider_id)
        .await?;

    let mut seen = Vec::new();
    for cloud_volume in &cloud_volumes {
        let tenant_name = cloud_volume
            .owner_project_id
            .as_ref()
            .and_then(|project_id| tenant_map.get(project_id))
            .cloned()
            .or_else(|| cloud_volume.owner_project_id.clone());
        let Some(tenant_name) = tenant_name else {
            info!(
                volume_id = %cloud_volume.id,
                "Skipping volume with no owning project reported"
            );
            continue;
        };

        let identity = ctx
            .store
            .find_identity_by_project_name(provider_id, &tenant_name)
            .await?;
        let Some(identity) = identity else {
            info!(
                volume_id = %cloud_volume.id,
                provider = %provider.name,
                project = %tenant_name,
                "Skipping volume: no identity for project"
            );
            continue;
        };

        let (record, created) = ctx
            .store
            .ensure_volume(
                provider_id,
                &NewVolume {
                    identifier: cloud_volume.id.clone(),
                    name: cloud_volume.name.clone(),
                    size_gb: cloud_volume.size_gb,
                    created_by: identity.created_by,
                },
            )
            .await?;
        if created {
            info!(identifier = %record.identifier, "Registered new volume");
        }
        seen.push(record.identifier);
    }

    let now = Utc::now();
    let seen_set: HashSet<&str> = seen.iter().map(String::as_str).collect();
    for volume in &db_volumes {
        if seen_set.contains(volume.identifier.as_str()) {
            continue;
        }
        debug!(identifier = %volume.identifier, "End dating inactive volume");
        ctx.store.end_date_volume(volume.id, now).await?;
    }

    Ok(seen)
}
