// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Monitor - Reconciliation and Allocation Enforcement Engines
//!
//! This crate reconciles the lifecycle store's view of cloud resources
//! against the live state reported by each provider, and enforces
//! allocation overage policy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      MonitorScheduler                               │
//! │        (periodic tick, fan-out per active provider)                 │
//! └─────────────────────────────────────────────────────────────────────┘
//!        │ tokio::spawn per provider          │ tokio::spawn per (source, user)
//!        ▼                                    ▼
//! ┌───────────────────────┐        ┌─────────────────────────────┐
//! │ Reconciliation passes │        │  Allocation Enforcement     │
//! │  machines / volumes   │        │  (override policy, per-     │
//! │  sizes / instances    │        │   identity enforcement)     │
//! └───────────────────────┘        └─────────────────────────────┘
//!        │ Persistence                        │ InstanceEnforcer
//!        ▼                                    ▼
//! ┌───────────────────────┐        ┌─────────────────────────────┐
//! │     stratus-core      │        │      Cloud Providers        │
//! └───────────────────────┘        └─────────────────────────────┘
//! ```
//!
//! # Reconciliation passes
//!
//! | Pass | Diff driver | Destructive action |
//! |------|-------------|--------------------|
//! | [`machines::prune_machines_for`] | image identifier | end-date + cascade up the hierarchy |
//! | [`machines::monitor_machines_for`] | image identifier | none (additive membership only) |
//! | [`volumes::monitor_volumes_for`] | volume identifier | end-date missing volumes |
//! | [`sizes::monitor_sizes_for`] | size alias | end-date missing sizes |
//! | [`instances::monitor_instances_for`] | instance alias | end-date unreported instances |
//!
//! Every pass is idempotent: matching orphaned records by identifier is
//! the sole driver of destructive action, so a second run against an
//! unchanged snapshot is a no-op. Passes for different providers are
//! independent; one provider's outage never aborts another's pass.
//!
//! # Modules
//!
//! - [`allocation`]: Allocation enforcement engine and override policy
//! - [`cache`]: Per-run snapshot caches
//! - [`error`]: Error types
//! - [`instances`]: Instance reconciliation and history repair
//! - [`machines`]: Machine pruning, monitoring, lifecycle cascade
//! - [`membership`]: Image access-list reconciliation
//! - [`scheduler`]: Periodic background loop
//! - [`sizes`]: Size reconciliation and unknown-size repair
//! - [`snapshot`]: Cloud snapshot capability trait and mock
//! - [`timeutil`]: Duration/timestamp formatting
//! - [`validation`]: Machine and user validation strategies
//! - [`volumes`]: Volume reconciliation

#![deny(missing_docs)]

use std::sync::Arc;

use stratus_core::config::Config;
use stratus_core::persistence::Persistence;

/// Allocation enforcement engine.
pub mod allocation;

/// Per-run snapshot caches.
pub mod cache;

/// Error types for monitor operations.
pub mod error;

/// Instance reconciliation.
pub mod instances;

/// Machine reconciliation and lifecycle cascade.
pub mod machines;

/// Image access-list reconciliation.
pub mod membership;

/// Periodic scheduler loop.
pub mod scheduler;

/// Size reconciliation.
pub mod sizes;

/// Cloud snapshot capability.
pub mod snapshot;

/// Duration and timestamp formatting.
pub mod timeutil;

/// Machine and user validation strategies.
pub mod validation;

/// Volume reconciliation.
pub mod volumes;

/// Settings consumed by the reconciliation passes.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Gates cloud-side ACL push-back (and enforcement dispatch).
    pub enforcing: bool,
    /// Shared-access count above which a membership set is treated as
    /// corrupted.
    pub membership_limit: i64,
    /// Status names the ledger counts as active.
    pub active_status_names: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enforcing: false,
            membership_limit: 128,
            active_status_names: stratus_core::history::DEFAULT_ACTIVE_STATUS_NAMES
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

impl From<&Config> for MonitorSettings {
    fn from(config: &Config) -> Self {
        Self {
            enforcing: config.enforcing,
            membership_limit: config.membership_limit,
            active_status_names: config.active_status_names.clone(),
        }
    }
}

/// Shared state for the reconciliation passes.
///
/// Holds the store, the snapshot capability, and the machine validation
/// strategy shared across all per-provider units.
pub struct MonitorContext {
    /// Lifecycle store.
    pub store: Arc<dyn Persistence>,
    /// Cloud snapshot capability.
    pub snapshots: Arc<dyn snapshot::ResourceSnapshotSource>,
    /// Machine validation strategy.
    pub validator: Arc<dyn validation::MachineValidator>,
    /// Pass settings.
    pub settings: MonitorSettings,
}

impl MonitorContext {
    /// Create a new context.
    pub fn new(
        store: Arc<dyn Persistence>,
        snapshots: Arc<dyn snapshot::ResourceSnapshotSource>,
        validator: Arc<dyn validation::MachineValidator>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            snapshots,
            validator,
            settings,
        }
    }
}
