// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-monitor.

use thiserror::Error;

/// Monitor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] stratus_core::config::ConfigError),

    /// Lifecycle store operation failed.
    #[error("Core error: {0}")]
    Core(#[from] stratus_core::error::CoreError),

    /// Cloud snapshot source failed.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No validation strategy is registered under the configured name.
    #[error("Unknown machine validator: {0}")]
    UnknownValidator(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type defaulting to the monitor Error.
pub type Result<T, E = Error> = std::result::Result<T, E>;
