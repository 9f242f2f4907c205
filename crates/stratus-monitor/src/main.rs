// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Monitor - Reconciliation and Enforcement Service
//!
//! Wires configuration, the lifecycle store, and the engines together,
//! then runs the periodic scheduler until ctrl-c. Cloud provider clients
//! are deployment-specific; until one is registered this binary runs
//! against the in-memory mock source, which makes it useful for local
//! smoke runs and nothing else.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

use stratus_core::config::Config;
use stratus_core::migrations;
use stratus_core::persistence::{IdentityRecord, SqlitePersistence, UserRecord};

use stratus_monitor::allocation::{EnforcementContext, InstanceEnforcer, NoOverridePolicy};
use stratus_monitor::scheduler::{MonitorScheduler, SchedulerConfig};
use stratus_monitor::snapshot::mock::MockSnapshotSource;
use stratus_monitor::validation::validator_for;
use stratus_monitor::{MonitorContext, MonitorSettings};

/// Placeholder enforcement collaborator: records the decision in the log
/// and touches nothing.
struct LogOnlyEnforcer;

#[async_trait]
impl InstanceEnforcer for LogOnlyEnforcer {
    async fn enforce(
        &self,
        user: &UserRecord,
        identity: &IdentityRecord,
        action: &str,
    ) -> stratus_monitor::error::Result<Vec<String>> {
        warn!(
            username = %user.username,
            identity = %identity.uuid,
            action,
            "No cloud enforcer registered; logging only"
        );
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Configuration first so the debug flag can shape logging.
    let config = Config::from_env()?;

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("stratus_monitor={}", default_level).parse().unwrap())
                .add_directive(format!("stratus_core={}", default_level).parse().unwrap()),
        )
        .init();

    info!("Starting Stratus Monitor");
    info!(
        enforcing = config.enforcing,
        membership_limit = config.membership_limit,
        poll_interval_secs = config.poll_interval.as_secs(),
        validator = %config.machine_validator,
        "Configuration loaded"
    );

    // Connect to the database and apply migrations.
    info!("Connecting to database...");
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    info!("Running database migrations...");
    migrations::run_sqlite(&pool).await?;
    let store = Arc::new(SqlitePersistence::new(pool.clone()));

    let validator = validator_for(&config)?;
    let snapshots = Arc::new(MockSnapshotSource::new());
    warn!("No cloud snapshot source registered; using the in-memory mock");

    let ctx = Arc::new(MonitorContext::new(
        store.clone(),
        snapshots,
        validator,
        MonitorSettings::from(&config),
    ));
    let enforcement = Arc::new(EnforcementContext {
        store: store.clone(),
        policy: Arc::new(NoOverridePolicy),
        enforcer: Arc::new(LogOnlyEnforcer),
        enforcing: config.enforcing,
    });

    let scheduler = MonitorScheduler::new(
        ctx,
        enforcement,
        SchedulerConfig {
            poll_interval: config.poll_interval,
        },
    );
    let shutdown = scheduler.shutdown_handle();
    let scheduler_handle = tokio::spawn(scheduler.run());

    info!("Stratus Monitor initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.notify_one();
    let _ = scheduler_handle.await;

    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
