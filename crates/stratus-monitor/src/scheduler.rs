// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic monitor loop.
//!
//! Each tick fans the resource passes out per active provider and runs
//! the allocation enforcement evaluation. Per-provider units run as
//! independent tasks; a tick never fails the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::allocation::{self, EnforcementContext};
use crate::error::Result;
use crate::instances::{self, InstanceSummary};
use crate::machines::{self, MonitorMachineOptions};
use crate::sizes;
use crate::volumes;
use crate::MonitorContext;

/// Outcome of one provider's full resource pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceSummary {
    /// Sizes seen in the snapshot.
    pub sizes: usize,
    /// Volumes seen in the snapshot.
    pub volumes: usize,
    /// Machines registered or confirmed.
    pub machines: usize,
    /// Instance pass counters.
    pub instances: InstanceSummary,
}

/// Run every resource pass for one provider, in the fixed order sizes,
/// volumes, machines, instances (instances resolve against the sizes the
/// first pass just reconciled).
pub async fn monitor_resources_for(
    ctx: &MonitorContext,
    provider_id: i64,
    users: Option<&[String]>,
) -> Result<ResourceSummary> {
    let sizes = sizes::monitor_sizes_for(ctx, provider_id).await?;
    let volumes = volumes::monitor_volumes_for(ctx, provider_id).await?;
    let machines =
        machines::monitor_machines_for(ctx, provider_id, &MonitorMachineOptions::default())
            .await?;
    let instances = instances::monitor_instances_for(ctx, provider_id, users).await?;
    Ok(ResourceSummary {
        sizes: sizes.len(),
        volumes: volumes.len(),
        machines: machines.len(),
        instances,
    })
}

/// Fan out the full resource pass to every active provider. Returns the
/// provider ids dispatched.
pub async fn monitor_resources(ctx: Arc<MonitorContext>) -> Result<Vec<i64>> {
    let providers = ctx.store.list_active_providers().await?;
    let mut dispatched = Vec::with_capacity(providers.len());
    for provider in providers {
        dispatched.push(provider.id);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match monitor_resources_for(&ctx, provider.id, None).await {
                Ok(summary) => info!(
                    provider_id = provider.id,
                    sizes = summary.sizes,
                    volumes = summary.volumes,
                    machines = summary.machines,
                    instances_seen = summary.instances.seen,
                    "Resource pass completed"
                ),
                Err(err) => error!(
                    provider_id = provider.id,
                    error = %err,
                    "Resource pass failed"
                ),
            }
        });
    }
    Ok(dispatched)
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to start a monitoring tick.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
        }
    }
}

/// Periodic monitor that runs as a background task.
pub struct MonitorScheduler {
    ctx: Arc<MonitorContext>,
    enforcement: Arc<EnforcementContext>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl MonitorScheduler {
    /// Create a new scheduler.
    pub fn new(
        ctx: Arc<MonitorContext>,
        enforcement: Arc<EnforcementContext>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx,
            enforcement,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until shut down.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Monitor scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Monitor scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        // Prune before monitoring: the monitor pass assumes every
        // non-end-dated machine can still be found in the cloud.
        match machines::prune_machines(self.ctx.clone()).await {
            Ok(dispatched) => {
                info!(providers = dispatched.len(), "Dispatched prune passes")
            }
            Err(err) => error!(error = %err, "Failed to dispatch prune passes"),
        }

        match monitor_resources(self.ctx.clone()).await {
            Ok(dispatched) => {
                info!(providers = dispatched.len(), "Dispatched resource passes")
            }
            Err(err) => error!(error = %err, "Failed to dispatch resource passes"),
        }

        match allocation::monitor_allocation_sources(self.enforcement.clone(), &[]).await {
            Ok(dispatched) => info!(
                pairs = dispatched.len(),
                "Dispatched enforcement units"
            ),
            Err(err) => error!(error = %err, "Failed to evaluate allocation sources"),
        }
    }
}
