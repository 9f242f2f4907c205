// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance reconciliation and status-history repair.
//!
//! Builds the tenant -> running-instances owner map from the provider
//! snapshot, registers running instances, end-dates store instances that
//! are no longer reported, and repairs instances left with more than one
//! open history row.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use stratus_core::error::CoreError;
use stratus_core::persistence::{NewHistory, NewInstance, NewSize};
use stratus_core::persistence::sqlite::UNKNOWN_SIZE_NAME;

use crate::MonitorContext;
use crate::cache::SnapshotCache;
use crate::error::Result;
use crate::snapshot::CloudInstance;

/// Counts from one instance reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSummary {
    /// Running instances seen (registered or already known).
    pub seen: usize,
    /// Store instances end-dated because the cloud stopped reporting them.
    pub end_dated: usize,
    /// Instances whose history chain held multiple open rows and was
    /// reset.
    pub repaired: usize,
}

/// Fan out an instance pass to every active provider.
pub async fn monitor_instances(ctx: Arc<MonitorContext>) -> Result<Vec<i64>> {
    let providers = ctx.store.list_active_providers().await?;
    let mut dispatched = Vec::with_capacity(providers.len());
    for provider in providers {
        dispatched.push(provider.id);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor_instances_for(&ctx, provider.id, None).await {
                error!(
                    provider_id = provider.id,
                    error = %err,
                    "Instance monitor failed"
                );
            }
        });
    }
    Ok(dispatched)
}

/// Reconcile one provider's instances, optionally restricted to the
/// given tenant/user names.
///
/// Identities with zero running instances are included in the owner map
/// so their leftover store instances get end-dated.
#[instrument(skip(ctx, users))]
pub async fn monitor_instances_for(
    ctx: &MonitorContext,
    provider_id: i64,
    users: Option<&[String]>,
) -> Result<InstanceSummary> {
    let provider = ctx
        .store
        .get_provider(provider_id)
        .await?
        .ok_or(CoreError::ProviderNotFound { provider_id })?;
    info!(provider = %provider.name, "Starting instance monitor");
    if !ctx.settings.enforcing {
        debug!("Settings dictate allocations are NOT enforced");
    }

    let mut cache = SnapshotCache::new();
    let tenant_map = cache
        .tenant_name_map(ctx.snapshots.as_ref(), provider_id)
        .await?;
    let cloud_instances = ctx.snapshots.list_all_instances(provider_id).await?;

    // Owner map: tenant name -> running instances, tenant ids translated
    // to names up front. Sorted so runs are reproducible.
    let mut owner_map: BTreeMap<String, Vec<CloudInstance>> = BTreeMap::new();
    for instance in cloud_instances {
        let tenant_name = tenant_map
            .get(&instance.owner_project_id)
            .cloned()
            .unwrap_or_else(|| instance.owner_project_id.clone());
        if let Some(users) = users
            && !users.contains(&tenant_name)
        {
            continue;
        }
        owner_map.entry(tenant_name).or_default().push(instance);
    }

    // Identities with zero instances still need their leftovers cleaned.
    for identity in ctx.store.list_identities_for_provider(provider_id).await? {
        if let Some(users) = users
            && !users.contains(&identity.project_name)
        {
            continue;
        }
        owner_map.entry(identity.project_name).or_default();
    }

    // Size aliases resolve through the current size table; anything
    // unresolved gets a placeholder for the size pass to repair later.
    let mut size_ids: HashMap<String, i64> = ctx
        .store
        .list_current_sizes(provider_id)
        .await?
        .into_iter()
        .map(|size| (size.alias.clone(), size.id))
        .collect();

    let mut summary = InstanceSummary::default();
    let now = Utc::now();

    for (tenant_name, running) in &owner_map {
        let identity = ctx
            .store
            .find_identity_by_project_name(provider_id, tenant_name)
            .await?;
        let Some(identity) = identity else {
            if !running.is_empty() {
                warn!(
                    project = %tenant_name,
                    count = running.len(),
                    "Running instances for a project with no identity, skipping"
                );
            }
            continue;
        };

        let mut running_ids: HashSet<&str> = HashSet::new();
        for instance in running {
            running_ids.insert(instance.id.as_str());
            let size_id =
                resolve_size_id(ctx, provider_id, &mut size_ids, &instance.size_alias).await?;
            let (record, created) = ctx
                .store
                .ensure_instance(
                    provider_id,
                    &NewInstance {
                        provider_alias: instance.id.clone(),
                        identity_id: identity.id,
                        status_name: instance.status.clone(),
                        size_id,
                        activity: instance.activity.clone(),
                    },
                )
                .await?;
            if created {
                info!(alias = %record.provider_alias, "Registered new instance");
            }
            summary.seen += 1;
        }

        // Using the known list of running instances, clean up the store.
        let db_active = ctx
            .store
            .list_active_instances_for_identity(identity.id)
            .await?;
        for db_instance in db_active {
            if !running_ids.contains(db_instance.provider_alias.as_str()) {
                info!(alias = %db_instance.provider_alias, "End dating missing instance");
                ctx.store
                    .end_date_instance_and_history(db_instance.id, now)
                    .await?;
                summary.end_dated += 1;
                continue;
            }

            // The instance is running. Its chain must hold exactly one
            // open row; more than one means a conflicted transition.
            let open = ctx.store.list_open_histories(db_instance.id).await?;
            if open.len() <= 1 {
                continue;
            }
            let statuses: Vec<&str> = open.iter().map(|row| row.status.as_str()).collect();
            let Some(cloud_instance) = running
                .iter()
                .find(|instance| instance.id == db_instance.provider_alias)
            else {
                continue;
            };
            let size_id =
                resolve_size_id(ctx, provider_id, &mut size_ids, &cloud_instance.size_alias)
                    .await?;
            ctx.store.close_open_histories(db_instance.id, now).await?;
            let fresh = ctx
                .store
                .insert_history(&NewHistory {
                    instance_id: db_instance.id,
                    status_name: cloud_instance.status.clone(),
                    size_id,
                    activity: cloud_instance.activity.clone(),
                    extra: None,
                    start_date: now,
                    end_date: None,
                })
                .await?;
            warn!(
                alias = %db_instance.provider_alias,
                open_rows = statuses.len(),
                ?statuses,
                new_status = %fresh.status,
                "Instance held multiple open history rows; chain reset"
            );
            summary.repaired += 1;
        }
    }

    info!(
        provider = %provider.name,
        seen = summary.seen,
        end_dated = summary.end_dated,
        repaired = summary.repaired,
        "Instance monitor completed"
    );
    Ok(summary)
}

/// Resolve a cloud size alias to a store size id, creating an
/// "Unknown Size" placeholder when the alias is unresolved.
async fn resolve_size_id(
    ctx: &MonitorContext,
    provider_id: i64,
    size_ids: &mut HashMap<String, i64>,
    alias: &str,
) -> Result<i64> {
    if let Some(id) = size_ids.get(alias) {
        return Ok(*id);
    }
    let placeholder = ctx
        .store
        .upsert_size(
            provider_id,
            &NewSize {
                alias: alias.to_string(),
                name: UNKNOWN_SIZE_NAME.to_string(),
                cpu: 0,
                mem: 0,
                disk: 0,
            },
        )
        .await?;
    size_ids.insert(alias.to_string(), placeholder.id);
    Ok(placeholder.id)
}
