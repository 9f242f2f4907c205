// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Core - Lifecycle Store and Status History Ledger
//!
//! This crate persists the hierarchy of cloud resources that the monitor
//! engines reconcile against live provider state, and the append-only
//! status-history chain used for time accounting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        stratus-monitor                              │
//! │     (Reconciliation Engine, Allocation Enforcement, Scheduler)      │
//! └─────────────────────────────────────────────────────────────────────┘
//!                │ Persistence trait                │ capability traits
//!                ▼                                  ▼
//! ┌───────────────────────┐            ┌─────────────────────────────┐
//! │    stratus-core       │            │      Cloud Providers        │
//! │  (This Crate)         │            │  (ResourceSnapshotSource)   │
//! │  Lifecycle Store      │            │                             │
//! │  Status History       │            └─────────────────────────────┘
//! └───────────────────────┘
//!            │
//!            ▼
//! ┌───────────────────────┐
//! │        SQLite         │
//! │  (Durable Storage)    │
//! └───────────────────────┘
//! ```
//!
//! # Lifecycle Hierarchy
//!
//! | Entity | Parent | End-dated when |
//! |--------|--------|----------------|
//! | `ProviderMachine` | `ApplicationVersion` | its image vanishes from the cloud |
//! | `ApplicationVersion` | `Application` | its last current machine is end-dated |
//! | `Application` | — | its last current version is end-dated |
//! | `Volume` / `Size` | — | absent from the provider snapshot |
//! | `Instance` | — | no longer reported running for its identity |
//!
//! Nothing is ever physically deleted: removal is setting `end_date`, and
//! an `end_date`, once set, is never cleared. "Current" always means
//! `end_date IS NULL`.
//!
//! # Status History Chain
//!
//! ```text
//!   row 1                row 2                row 3 (open)
//! ┌───────────────┐    ┌───────────────┐    ┌───────────────┐
//! │ start: t0     │    │ start: t1     │    │ start: t2     │
//! │ end:   t1 ────┼───▶│ end:   t2 ────┼───▶│ end:   NULL   │
//! │ status: build │    │ status: active│    │ status: susp. │
//! └───────────────┘    └───────────────┘    └───────────────┘
//! ```
//!
//! Consecutive rows are linked by timestamp equality: each row's
//! `end_date` equals the next row's `start_date`. The final row is open
//! (instance still active) or closed at the instance's own end date.
//! [`history`] walks and accounts this chain; the atomic close-and-open
//! transition is [`persistence::Persistence::record_status_transition`].
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STRATUS_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `STRATUS_ENFORCING` | No | `false` | Gate ACL push-back + enforcement |
//! | `STRATUS_DEBUG` | No | `false` | Verbose ad-hoc logging |
//! | `STRATUS_MEMBERSHIP_LIMIT` | No | `128` | Corrupted-membership threshold |
//! | `STRATUS_ACTIVE_STATUS_NAMES` | No | `active,running` | Ledger "active" set |
//! | `STRATUS_POLL_INTERVAL_SECS` | No | `300` | Scheduler tick |
//! | `STRATUS_MACHINE_VALIDATOR` | No | `basic` | Validation strategy |
//! | `STRATUS_VALIDATION_TIMEOUT_SECS` | No | `5` | Remote validation bound |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types with error-code mapping
//! - [`history`]: Status history traversal and active-time accounting
//! - [`migrations`]: Embedded schema migrations
//! - [`persistence`]: Record types, the `Persistence` trait, SQLite backend

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for store and engine operations.
pub mod error;

/// Status history ledger traversal and time accounting.
pub mod history;

/// Embedded database migrations.
pub mod migrations;

/// Record types, the store trait, and backends.
pub mod persistence;
