// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for stratus-core.
//!
//! This module exposes embedded migrations that can be run programmatically.
//! Deployments embedding stratus-core call these functions to set up the
//! database schema.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use stratus_core::migrations;
//!
//! let pool = SqlitePool::connect(&database_url).await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all core migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
