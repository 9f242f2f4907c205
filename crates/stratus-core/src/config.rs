// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Stratus configuration shared by the store and the monitor engines.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Gates cloud-side ACL push-back and allocation enforcement dispatch
    pub enforcing: bool,
    /// Gates verbose ad-hoc logging
    pub debug: bool,
    /// Shared-access count above which a membership set is treated as
    /// corrupted and reset to the last-known-good access list
    pub membership_limit: i64,
    /// Status names counted as "active" by the history ledger
    pub active_status_names: Vec<String>,
    /// Scheduler tick interval
    pub poll_interval: Duration,
    /// Machine validation strategy name (basic, blacklist, whitelist)
    pub machine_validator: String,
    /// Metadata key consulted by the blacklist validation strategy
    pub blacklist_metadata_key: String,
    /// Metadata key consulted by the whitelist validation strategy
    pub whitelist_metadata_key: String,
    /// Upper bound on remote user-validation calls before degrading to
    /// locally recorded allocation membership
    pub validation_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STRATUS_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `STRATUS_ENFORCING`: enable enforcement actions (default: false)
    /// - `STRATUS_DEBUG`: verbose logging (default: false)
    /// - `STRATUS_MEMBERSHIP_LIMIT`: corrupted-membership threshold (default: 128)
    /// - `STRATUS_ACTIVE_STATUS_NAMES`: comma list (default: "active,running")
    /// - `STRATUS_POLL_INTERVAL_SECS`: scheduler tick (default: 300)
    /// - `STRATUS_MACHINE_VALIDATOR`: strategy name (default: "basic")
    /// - `STRATUS_BLACKLIST_METADATA_KEY` (default: "image_exclude")
    /// - `STRATUS_WHITELIST_METADATA_KEY` (default: "image_include")
    /// - `STRATUS_VALIDATION_TIMEOUT_SECS` (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STRATUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STRATUS_DATABASE_URL"))?;

        let enforcing = parse_bool("STRATUS_ENFORCING", false)?;
        let debug = parse_bool("STRATUS_DEBUG", false)?;

        let membership_limit: i64 = std::env::var("STRATUS_MEMBERSHIP_LIMIT")
            .unwrap_or_else(|_| "128".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STRATUS_MEMBERSHIP_LIMIT", "must be a positive integer")
            })?;
        if membership_limit <= 0 {
            return Err(ConfigError::Invalid(
                "STRATUS_MEMBERSHIP_LIMIT",
                "must be a positive integer",
            ));
        }

        let active_status_names: Vec<String> = std::env::var("STRATUS_ACTIVE_STATUS_NAMES")
            .unwrap_or_else(|_| "active,running".to_string())
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if active_status_names.is_empty() {
            return Err(ConfigError::Invalid(
                "STRATUS_ACTIVE_STATUS_NAMES",
                "must name at least one status",
            ));
        }

        let poll_interval_secs: u64 = std::env::var("STRATUS_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("STRATUS_POLL_INTERVAL_SECS", "must be a positive integer")
            })?;

        let machine_validator =
            std::env::var("STRATUS_MACHINE_VALIDATOR").unwrap_or_else(|_| "basic".to_string());
        let blacklist_metadata_key = std::env::var("STRATUS_BLACKLIST_METADATA_KEY")
            .unwrap_or_else(|_| "image_exclude".to_string());
        let whitelist_metadata_key = std::env::var("STRATUS_WHITELIST_METADATA_KEY")
            .unwrap_or_else(|_| "image_include".to_string());

        let validation_timeout_secs: u64 = std::env::var("STRATUS_VALIDATION_TIMEOUT_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "STRATUS_VALIDATION_TIMEOUT_SECS",
                    "must be a positive integer",
                )
            })?;

        Ok(Self {
            database_url,
            enforcing,
            debug,
            membership_limit,
            active_status_names,
            poll_interval: Duration::from_secs(poll_interval_secs),
            machine_validator,
            blacklist_metadata_key,
            whitelist_metadata_key,
            validation_timeout: Duration::from_secs(validation_timeout_secs),
        })
    }
}

fn parse_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid(var, "must be a boolean")),
        },
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
