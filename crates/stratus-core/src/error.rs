// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-core.
//!
//! Provides a unified error type shared by the store and the engines that
//! consume it.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while operating on the lifecycle store.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Provider was not found in the database.
    ProviderNotFound {
        /// The provider id that was not found.
        provider_id: i64,
    },

    /// Instance was not found in the database.
    InstanceNotFound {
        /// The instance id that was not found.
        instance_id: i64,
    },

    /// No identity matches a cloud project name on a provider.
    IdentityNotFound {
        /// The provider searched.
        provider_id: i64,
        /// The cloud project name that could not be resolved.
        project_name: String,
    },

    /// A status-history transaction was invoked against an instance whose
    /// chain is not in the expected state. This indicates caller misuse,
    /// not environmental flakiness, and is never silently swallowed.
    HistoryContractViolation {
        /// The instance whose chain was touched.
        instance_id: i64,
        /// What the caller got wrong.
        reason: String,
    },

    /// The history chain itself is internally inconsistent (e.g. the
    /// instance has ended but its last row is still open).
    HistoryInconsistent {
        /// The instance whose chain is inconsistent.
        instance_id: i64,
        /// The detected inconsistency.
        reason: String,
    },

    /// A write transaction lost a lock race. Callers log and abandon the
    /// operation; the next scheduled run is the retry mechanism.
    LockConflict {
        /// The operation that was abandoned.
        operation: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProviderNotFound { .. } => "PROVIDER_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::IdentityNotFound { .. } => "IDENTITY_NOT_FOUND",
            Self::HistoryContractViolation { .. } => "HISTORY_CONTRACT_VIOLATION",
            Self::HistoryInconsistent { .. } => "HISTORY_INCONSISTENT",
            Self::LockConflict { .. } => "LOCK_CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error should abort only its own unit of work.
    ///
    /// Lock conflicts and contract violations are per-unit failures; the
    /// surrounding batch continues with its other units.
    pub fn is_unit_failure(&self) -> bool {
        matches!(
            self,
            Self::LockConflict { .. }
                | Self::HistoryContractViolation { .. }
                | Self::HistoryInconsistent { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderNotFound { provider_id } => {
                write!(f, "Provider '{}' not found", provider_id)
            }
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance '{}' not found", instance_id)
            }
            Self::IdentityNotFound {
                provider_id,
                project_name,
            } => {
                write!(
                    f,
                    "No identity for project '{}' on provider '{}'",
                    project_name, provider_id
                )
            }
            Self::HistoryContractViolation {
                instance_id,
                reason,
            } => {
                write!(
                    f,
                    "History transaction misuse for instance '{}': {}",
                    instance_id, reason
                )
            }
            Self::HistoryInconsistent {
                instance_id,
                reason,
            } => {
                write!(
                    f,
                    "History chain inconsistent for instance '{}': {}",
                    instance_id, reason
                )
            }
            Self::LockConflict { operation } => {
                write!(f, "Lock conflict during '{}', operation abandoned", operation)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            // SQLITE_BUSY / SQLITE_LOCKED surface as lock conflicts so
            // callers can abandon the unit instead of failing the batch.
            let message = db.message();
            if message.contains("database is locked") || message.contains("database table is locked")
            {
                return CoreError::LockConflict {
                    operation: "transaction".to_string(),
                };
            }
        }
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
