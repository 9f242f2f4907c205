// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status history ledger operations.
//!
//! An instance's status history is an append-only chain: each row's
//! `end_date` equals the next row's `start_date`, and the last row is
//! either open or closed at the instance's own end date. The rows form a
//! linked list keyed by timestamp equality; [`previous`] and [`next`]
//! walk it, and [`active_time`] accounts the time a row spent in an
//! "active" status.
//!
//! The atomic close-and-open transition itself lives on the store
//! ([`crate::persistence::Persistence::record_status_transition`]) so it
//! can run inside a single database transaction.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::persistence::{HistoryRecord, Persistence, StatusTransition};

/// Status names counted as "active" when no configuration overrides them.
/// `running` is the legacy spelling.
pub const DEFAULT_ACTIVE_STATUS_NAMES: &[&str] = &["active", "running"];

/// Whether a history row's status counts as active.
pub fn is_active_status(record: &HistoryRecord, active_names: &[String]) -> bool {
    active_names.iter().any(|name| name == &record.status)
}

/// Record a status transition, absorbing lock races.
///
/// A lost lock race is logged and abandoned with `Ok(None)`; the next
/// scheduled run is the retry mechanism. Contract violations (no open
/// row to close, or a stale `last_history_id`) still surface as hard
/// errors, because they indicate caller misuse rather than contention.
pub async fn try_status_transition(
    store: &dyn Persistence,
    transition: &StatusTransition,
) -> Result<Option<HistoryRecord>> {
    match store.record_status_transition(transition).await {
        Ok(record) => Ok(Some(record)),
        Err(CoreError::LockConflict { operation }) => {
            warn!(
                instance_id = transition.instance_id,
                operation = %operation,
                "Lock already held by another transaction; transition abandoned"
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Traverse one step backwards along an instance's history chain.
///
/// Returns `Ok(None)` when `record` is the first row (its start date
/// equals the instance's start date). A gap in the chain is an
/// internal-consistency error.
pub async fn previous(
    store: &dyn Persistence,
    record: &HistoryRecord,
) -> Result<Option<HistoryRecord>> {
    let instance = store
        .get_instance(record.instance_id)
        .await?
        .ok_or(CoreError::InstanceNotFound {
            instance_id: record.instance_id,
        })?;

    if instance.start_date == record.start_date {
        return Ok(None);
    }

    match store
        .find_history_ending_at(record.instance_id, record.start_date)
        .await?
    {
        Some(prior) if prior.id == record.id => Err(CoreError::HistoryInconsistent {
            instance_id: record.instance_id,
            reason: format!("row {} links to itself at {}", record.id, record.start_date),
        }),
        Some(prior) => Ok(Some(prior)),
        None => Err(CoreError::HistoryInconsistent {
            instance_id: record.instance_id,
            reason: format!("no row ends at {}", record.start_date),
        }),
    }
}

/// Traverse one step forwards along an instance's history chain.
///
/// Returns `Ok(None)` when `record` is the final row: it is open while
/// the instance is still active, or its end date matches the instance's
/// end date. An open row on an ended instance leaks time and is an
/// internal-consistency error.
pub async fn next(
    store: &dyn Persistence,
    record: &HistoryRecord,
) -> Result<Option<HistoryRecord>> {
    let instance = store
        .get_instance(record.instance_id)
        .await?
        .ok_or(CoreError::InstanceNotFound {
            instance_id: record.instance_id,
        })?;

    let end_date = match record.end_date {
        None => {
            if instance.end_date.is_some() {
                return Err(CoreError::HistoryInconsistent {
                    instance_id: record.instance_id,
                    reason: format!(
                        "instance ended but history row {} is still open",
                        record.id
                    ),
                });
            }
            // Still running; this is the current row.
            return Ok(None);
        }
        Some(end_date) => end_date,
    };

    if instance.end_date == Some(end_date) {
        return Ok(None);
    }

    match store
        .find_history_starting_at(record.instance_id, end_date)
        .await?
    {
        Some(following) if following.id == record.id => Err(CoreError::HistoryInconsistent {
            instance_id: record.instance_id,
            reason: format!("row {} links to itself at {}", record.id, end_date),
        }),
        Some(following) => Ok(Some(following)),
        None => {
            // The final row's end date can be "a little off" from the
            // instance's end date when the chain was closed by repair.
            let last = store.get_last_history(record.instance_id).await?;
            if last.as_ref().map(|row| row.id) == Some(record.id) {
                return Ok(None);
            }
            Err(CoreError::HistoryInconsistent {
                instance_id: record.instance_id,
                reason: format!("no row starts at {}", end_date),
            })
        }
    }
}

/// Compute the time a history row spent in an "active" status, clipped to
/// the optional `[earliest_time, latest_time]` window.
///
/// Returns `(duration, effective_start, effective_end)`. The duration is
/// zero when the row's status is not active or the row starts after the
/// window closes.
pub fn active_time(
    record: &HistoryRecord,
    active_names: &[String],
    earliest_time: Option<DateTime<Utc>>,
    latest_time: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (Duration, DateTime<Utc>, DateTime<Utc>) {
    // When to start counting
    let start_time = match earliest_time {
        Some(earliest) if record.start_date <= earliest => earliest,
        _ => record.start_date,
    };

    // When to stop counting; the open row counts up to now.
    let final_time = match (latest_time, record.end_date) {
        (Some(latest), None) => latest,
        (Some(latest), Some(end)) if end >= latest => latest,
        (Some(_), Some(end)) => end,
        (None, Some(end)) => end,
        (None, None) => now,
    };

    // Inactive states are not counted against you.
    if !is_active_status(record, active_names) {
        return (Duration::zero(), start_time, final_time);
    }
    if record.start_date > final_time {
        return (Duration::zero(), start_time, final_time);
    }
    (final_time - start_time, start_time, final_time)
}

/// Assemble the `extra` diagnostic payload for a status transition.
///
/// Only error-carrying statuses get a payload. A fault that is not an
/// object, or a deploy fault with only one of its two fields, is dropped
/// with a warning rather than failing the transition.
pub fn build_fault_extra(
    status_name: &str,
    fault: Option<&Value>,
    deploy_fault_message: Option<&str>,
    deploy_fault_trace: Option<&str>,
) -> Option<Value> {
    if status_name != "active" && status_name != "deploy_error" {
        return None;
    }

    let mut extra = serde_json::Map::new();
    if let Some(fault) = fault {
        match fault.as_object() {
            Some(map) => {
                if let Some(message) = map.get("message") {
                    extra.insert("display_error".to_string(), message.clone());
                }
                if let Some(details) = map.get("details") {
                    extra.insert("traceback".to_string(), details.clone());
                }
            }
            None => {
                warn!(?fault, "Invalid fault payload, expected an object");
            }
        }
    }

    match (deploy_fault_message, deploy_fault_trace) {
        (Some(message), Some(trace)) => {
            extra.insert("display_error".to_string(), json!(message));
            extra.insert("traceback".to_string(), json!(trace));
        }
        (Some(_), None) | (None, Some(_)) => {
            warn!(
                deploy_fault_message,
                deploy_fault_trace,
                "Expected both deploy fault message and trace, received only one"
            );
        }
        (None, None) => {}
    }

    if extra.is_empty() {
        None
    } else {
        Some(Value::Object(extra))
    }
}
