// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Machine reconciliation: the prune and monitor passes.
//!
//! Pruning end-dates store machines the cloud no longer reports, with the
//! lifecycle cascade (machine -> version -> application), then runs the
//! safety-net sweeps and the membership integrity check. Monitoring
//! registers cloud images into the store hierarchy and reconciles their
//! access lists.
//!
//! Step order inside one provider's prune pass is fixed: end-date orphans,
//! sweep versions, sweep applications, repair drift, clean memberships.
//! Later steps assume the earlier steps' invariants already hold.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use stratus_core::error::CoreError;
use stratus_core::persistence::{MachineRecord, NewMachineImage};

use crate::MonitorContext;
use crate::cache::SnapshotCache;
use crate::error::Result;
use crate::membership;

/// Options for the prune pass.
#[derive(Debug, Clone)]
pub struct PruneOptions {
    /// Log intended end-dates without writing them.
    pub dry_run: bool,
    /// Proceed even when the cloud snapshot is empty. Without this, an
    /// empty snapshot aborts the pass: it is indistinguishable from a
    /// listing failure, and acting on it would end-date every machine.
    pub forced_removal: bool,
    /// Filter the snapshot through the machine validation strategy.
    pub validate: bool,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            forced_removal: false,
            validate: true,
        }
    }
}

/// Options for the monitor pass.
#[derive(Debug, Clone)]
pub struct MonitorMachineOptions {
    /// When non-empty, restrict the pass to these image identifiers.
    pub limit_machines: Vec<String>,
    /// Filter the snapshot through the machine validation strategy.
    pub validate: bool,
}

impl Default for MonitorMachineOptions {
    fn default() -> Self {
        Self {
            limit_machines: Vec::new(),
            validate: true,
        }
    }
}

/// Counts of records end-dated by one prune pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneSummary {
    /// Machines end-dated because the cloud no longer reports them.
    pub machines: usize,
    /// Versions swept for never having a machine.
    pub versions: usize,
    /// Applications swept for never having a version, plus drift repairs.
    pub applications: usize,
    /// Membership rows removed by the integrity check.
    pub memberships_removed: u64,
}

/// How far up the hierarchy one machine end-date cascaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeLevel {
    /// Only the machine was end-dated; siblings keep the version current.
    Machine,
    /// The version lost its last machine and was end-dated too.
    Version,
    /// The application lost its last version and was end-dated too.
    Application,
}

/// Fan out a prune pass to every active provider.
///
/// Each provider runs as an independently spawned unit; a failure in one
/// is logged and never aborts the others. Returns the provider ids
/// dispatched.
pub async fn prune_machines(ctx: Arc<MonitorContext>) -> Result<Vec<i64>> {
    let providers = ctx.store.list_active_providers().await?;
    let mut dispatched = Vec::with_capacity(providers.len());
    for provider in providers {
        dispatched.push(provider.id);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) =
                prune_machines_for(&ctx, provider.id, &PruneOptions::default()).await
            {
                error!(
                    provider_id = provider.id,
                    error = %err,
                    "Machine prune failed"
                );
            }
        });
    }
    Ok(dispatched)
}

/// Prune one provider's machines against its cloud snapshot.
///
/// Any machine in the store that the cloud no longer reports is
/// end-dated, cascading up the hierarchy. The pass is idempotent: a
/// second run against an unchanged snapshot finds no orphans and
/// changes nothing.
#[instrument(skip(ctx, opts))]
pub async fn prune_machines_for(
    ctx: &MonitorContext,
    provider_id: i64,
    opts: &PruneOptions,
) -> Result<PruneSummary> {
    let provider = ctx
        .store
        .get_provider(provider_id)
        .await?
        .ok_or(CoreError::ProviderNotFound { provider_id })?;
    let now = Utc::now();
    info!(provider = %provider.name, %now, "Starting machine prune");

    let db_machines = ctx.store.list_current_machines(provider_id).await?;
    let mut cloud_images = if provider.active {
        ctx.snapshots.list_all_images(provider_id).await?
    } else {
        // An inactive provider reports nothing; its machines only go away
        // under forced removal.
        Vec::new()
    };
    if opts.validate {
        cloud_images.retain(|image| ctx.validator.machine_is_valid(image));
    }

    if cloud_images.is_empty() && !opts.forced_removal {
        info!(
            provider = %provider.name,
            "Cloud snapshot is empty and forced_removal is off; nothing pruned"
        );
        return Ok(PruneSummary::default());
    }

    let mut summary = PruneSummary::default();

    // Loop 1: end-date machines the cloud no longer reports. Matching by
    // identifier is the sole driver of destructive action.
    let cloud_ids: HashSet<&str> = cloud_images.iter().map(|image| image.id.as_str()).collect();
    for machine in &db_machines {
        if cloud_ids.contains(machine.identifier.as_str()) {
            continue;
        }
        remove_machine(ctx, machine, now, opts.dry_run).await?;
        summary.machines += 1;
    }

    // Loops 2 and 3: sweep versions with no machines ever attached, and
    // applications with no versions ever attached. Safety nets for data
    // created inconsistently by other paths, not normal cascade output.
    for version in ctx.store.list_versions_without_machines().await? {
        info!(version = %version.name, "End dating version with no machines");
        ctx.store.end_date_version(version.id, now).await?;
        summary.versions += 1;
    }
    for application in ctx.store.list_applications_without_versions().await? {
        info!(application = %application.name, "End dating application with no versions");
        ctx.store.end_date_application(application.id, now).await?;
        summary.applications += 1;
    }

    // Loop 4: applications whose versions are all inactive but which were
    // never end-dated themselves. Repairs drift from incomplete cascades.
    for application in ctx.store.list_drifted_applications().await? {
        info!(
            application = %application.name,
            "End dating application whose versions are all inactive"
        );
        ctx.store.end_date_application(application.id, now).await?;
        summary.applications += 1;
    }

    // Loop 5: reset any membership set that grew past the limit.
    summary.memberships_removed = membership::clean_memberships(ctx, &db_machines).await?;

    info!(
        provider = %provider.name,
        machines = summary.machines,
        versions = summary.versions,
        applications = summary.applications,
        "Machine prune completed"
    );
    Ok(summary)
}

/// End-date a machine, cascading to its version and application while
/// each level is left with no current children. The cascade stops at the
/// first level that still has one.
pub async fn remove_machine(
    ctx: &MonitorContext,
    machine: &MachineRecord,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<CascadeLevel> {
    info!(identifier = %machine.identifier, "End dating machine");
    if !dry_run {
        ctx.store.end_date_machine(machine.id, now).await?;
    }

    if ctx
        .store
        .count_current_machines_in_version(machine.version_id, now)
        .await?
        != 0
    {
        // Other machines keep the version current; no cascade.
        return Ok(CascadeLevel::Machine);
    }
    info!(version_id = machine.version_id, "End dating version");
    if !dry_run {
        ctx.store.end_date_version(machine.version_id, now).await?;
    }

    if ctx
        .store
        .count_current_versions_in_application(machine.application_id, now)
        .await?
        != 0
    {
        return Ok(CascadeLevel::Version);
    }
    info!(application_id = machine.application_id, "End dating application");
    if !dry_run {
        ctx.store
            .end_date_application(machine.application_id, now)
            .await?;
    }
    Ok(CascadeLevel::Application)
}

/// Fan out a monitor pass to every active provider.
pub async fn monitor_machines(ctx: Arc<MonitorContext>) -> Result<Vec<i64>> {
    let providers = ctx.store.list_active_providers().await?;
    let mut dispatched = Vec::with_capacity(providers.len());
    for provider in providers {
        dispatched.push(provider.id);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) =
                monitor_machines_for(&ctx, provider.id, &MonitorMachineOptions::default()).await
            {
                error!(
                    provider_id = provider.id,
                    error = %err,
                    "Machine monitor failed"
                );
            }
        });
    }
    Ok(dispatched)
}

/// Register one provider's cloud images into the store hierarchy and
/// reconcile their membership.
///
/// Assumes every non-end-dated machine in the store can be found in the
/// cloud; when that does not hold, run the prune pass first. Membership
/// is never removed here, and an application's public/private flag is
/// never downgraded.
#[instrument(skip(ctx, opts))]
pub async fn monitor_machines_for(
    ctx: &MonitorContext,
    provider_id: i64,
    opts: &MonitorMachineOptions,
) -> Result<Vec<MachineRecord>> {
    let provider = ctx
        .store
        .get_provider(provider_id)
        .await?
        .ok_or(CoreError::ProviderNotFound { provider_id })?;
    info!(provider = %provider.name, "Starting machine monitor");

    let mut cache = SnapshotCache::new();
    let mut cloud_images = ctx.snapshots.list_all_images(provider_id).await?;
    if !opts.limit_machines.is_empty() {
        cloud_images.retain(|image| opts.limit_machines.contains(&image.id));
    }

    let tenant_map = cache
        .tenant_name_map(ctx.snapshots.as_ref(), provider_id)
        .await?;

    let mut db_machines = Vec::new();
    for image in cloud_images {
        if opts.validate && !ctx.validator.machine_is_valid(&image) {
            continue;
        }

        let owner = image.owner_username.clone().or_else(|| {
            image
                .owner_project_id
                .as_ref()
                .and_then(|project_id| tenant_map.get(project_id).cloned())
        });
        let Some(owner) = owner else {
            info!(image_id = %image.id, "Skipping image with no resolvable owner");
            continue;
        };

        // Step 1: the application, version, and machine registered in the
        // store.
        let (machine, created) = ctx
            .store
            .ensure_machine_hierarchy(
                provider_id,
                &NewMachineImage {
                    identifier: image.id.clone(),
                    name: image.name.clone(),
                    version_name: image.version_name(),
                    owner_username: owner,
                    private: !image.is_public(),
                },
            )
            .await?;
        if created {
            info!(
                identifier = %machine.identifier,
                application_id = machine.application_id,
                "Registered new machine"
            );
        }

        // Step 2: fold the cloud's shared-access view into the membership
        // tables (additive only).
        membership::update_image_membership(ctx, &mut cache, &machine, &image).await?;

        // Step 3: when enforcing, redistribute grants known to the store
        // but missing cloud-side. Removals are done explicitly, elsewhere.
        if ctx.settings.enforcing {
            membership::distribute_image_membership(ctx, &mut cache, &machine, &image).await?;
        }

        db_machines.push(machine);
    }

    if db_machines.is_empty() {
        warn!(provider = %provider.name, "Machine monitor registered no machines");
    }
    Ok(db_machines)
}
