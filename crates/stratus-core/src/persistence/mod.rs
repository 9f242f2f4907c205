//! Persistence interfaces and backends for stratus-core.
//!
//! This module defines the lifecycle-store abstraction and backend
//! implementations. Every mutation is logical: records are end-dated,
//! never deleted, and membership join rows are additive-only.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use crate::error::CoreError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

/// Provider record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderRecord {
    /// Database primary key.
    pub id: i64,
    /// Public identifier.
    pub uuid: String,
    /// Display name (e.g. one cloud region).
    pub name: String,
    /// Whether the provider is currently monitored.
    pub active: bool,
    /// Enforcement action taken on overage for identities on this
    /// provider (Suspend, Stop, Shelve, Terminate). None = do nothing.
    pub over_allocation_action: Option<String>,
}

/// User record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    /// Database primary key.
    pub id: i64,
    /// Unique username.
    pub username: String,
    /// Contact email, if recorded.
    pub email: Option<String>,
}

/// Sharing group record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRecord {
    /// Database primary key.
    pub id: i64,
    /// Public identifier.
    pub uuid: String,
    /// Unique group name.
    pub name: String,
}

/// A user's credential binding to one provider.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdentityRecord {
    /// Database primary key.
    pub id: i64,
    /// Public identifier.
    pub uuid: String,
    /// Provider this identity is scoped to.
    pub provider_id: i64,
    /// Owning user.
    pub created_by: i64,
    /// Cloud project/tenant the identity operates in.
    pub project_name: String,
}

/// Machine image record joined across its instance source and version.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MachineRecord {
    /// Database primary key of the provider machine.
    pub id: i64,
    /// Underlying instance source row.
    pub source_id: i64,
    /// Cloud-side image identifier.
    pub identifier: String,
    /// Owning provider.
    pub provider_id: i64,
    /// Owning user.
    pub created_by: i64,
    /// Parent application version.
    pub version_id: i64,
    /// Grandparent application.
    pub application_id: i64,
    /// When the machine became current.
    pub start_date: DateTime<Utc>,
    /// When the machine stopped being current (None while active).
    pub end_date: Option<DateTime<Utc>>,
}

impl MachineRecord {
    /// Whether the machine is still current.
    pub fn is_current(&self) -> bool {
        self.end_date.is_none()
    }
}

/// Application version record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VersionRecord {
    /// Database primary key.
    pub id: i64,
    /// Parent application.
    pub application_id: i64,
    /// Version name.
    pub name: String,
    /// When the version became current.
    pub start_date: DateTime<Utc>,
    /// When the version stopped being current (None while active).
    pub end_date: Option<DateTime<Utc>>,
}

/// Application (logical image family) record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApplicationRecord {
    /// Database primary key.
    pub id: i64,
    /// Public identifier.
    pub uuid: String,
    /// Application name.
    pub name: String,
    /// Whether the image family is private (membership-gated).
    pub private: bool,
    /// Owning user.
    pub created_by: i64,
    /// When the application became current.
    pub start_date: DateTime<Utc>,
    /// When the application stopped being current (None while active).
    pub end_date: Option<DateTime<Utc>>,
}

/// Volume record joined across its instance source.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VolumeRecord {
    /// Database primary key of the volume.
    pub id: i64,
    /// Underlying instance source row.
    pub source_id: i64,
    /// Cloud-side volume identifier.
    pub identifier: String,
    /// Owning provider.
    pub provider_id: i64,
    /// Owning user.
    pub created_by: i64,
    /// Volume display name.
    pub name: String,
    /// Capacity in GB as last reported.
    pub size_gb: i64,
    /// When the volume became current.
    pub start_date: DateTime<Utc>,
    /// When the volume stopped being current (None while active).
    pub end_date: Option<DateTime<Utc>>,
}

/// Machine size (flavor) record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SizeRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning provider.
    pub provider_id: i64,
    /// Cloud-side size identifier.
    pub alias: String,
    /// Size display name.
    pub name: String,
    /// Virtual CPU count.
    pub cpu: i64,
    /// Memory in MB.
    pub mem: i64,
    /// Disk in GB.
    pub disk: i64,
    /// When the size became current.
    pub start_date: DateTime<Utc>,
    /// When the size stopped being current (None while active).
    pub end_date: Option<DateTime<Utc>>,
}

/// Instance record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Database primary key.
    pub id: i64,
    /// Cloud-side instance identifier.
    pub provider_alias: String,
    /// Owning provider.
    pub provider_id: i64,
    /// Owning user.
    pub created_by: i64,
    /// Identity the instance was launched under.
    pub created_by_identity: i64,
    /// Allocation source the instance burns against, if assigned.
    pub allocation_source_id: Option<i64>,
    /// When the instance was first seen.
    pub start_date: DateTime<Utc>,
    /// When the instance was end-dated (None while active).
    pub end_date: Option<DateTime<Utc>>,
}

/// Record of an image-build/share request; its access list is the
/// last-known-good membership reference for the resulting machine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MachineRequestRecord {
    /// Database primary key.
    pub id: i64,
    /// The machine produced by this request.
    pub new_machine_id: i64,
    /// Request status (pending, completed, failed, ...).
    pub status: String,
    /// JSON array of project names intended to have access.
    pub access_list: String,
    /// When the request was recorded.
    pub created_at: DateTime<Utc>,
}

impl MachineRequestRecord {
    /// Parse the stored access list, trimming surrounding whitespace from
    /// each name. A malformed payload yields an empty list with a warning
    /// rather than failing the pass.
    pub fn access_list(&self) -> Vec<String> {
        match serde_json::from_str::<Vec<String>>(&self.access_list) {
            Ok(names) => names
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            Err(err) => {
                warn!(
                    machine_request_id = self.id,
                    error = %err,
                    "Malformed access_list payload, treating as empty"
                );
                Vec::new()
            }
        }
    }
}

/// An access-list pattern attached to an application.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PatternMatchRecord {
    /// Database primary key.
    pub id: i64,
    /// The pattern string: a name, a comma-separated list, or a `*` wildcard.
    pub pattern: String,
    /// Field the pattern applies to: `username` or `email`.
    pub match_type: String,
    /// Whether a match grants (true) or denies (false) access.
    pub allow_access: bool,
}

/// One node of an instance's status-history chain.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRecord {
    /// Database primary key.
    pub id: i64,
    /// Public identifier.
    pub uuid: String,
    /// Owning instance.
    pub instance_id: i64,
    /// Size of the instance at the time of this status.
    pub size_id: i64,
    /// Status name (active, suspended, error, ...).
    pub status: String,
    /// Free-text sub-state (e.g. "deploying").
    pub activity: Option<String>,
    /// When this status began.
    pub start_date: DateTime<Utc>,
    /// When this status ended; None for the open row.
    pub end_date: Option<DateTime<Utc>>,
    /// JSON fault/diagnostic payload, if any.
    pub extra: Option<String>,
}

impl HistoryRecord {
    /// Parse the `extra` payload. Consumers must tolerate missing keys; a
    /// malformed payload is skipped with a warning, never fatal.
    pub fn extra_json(&self) -> Option<serde_json::Value> {
        let raw = self.extra.as_deref()?;
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    history_id = self.id,
                    error = %err,
                    "Malformed extra payload on history row, skipping"
                );
                None
            }
        }
    }
}

/// Allocation source record (a bounded compute budget shared by users).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AllocationSourceRecord {
    /// Database primary key.
    pub id: i64,
    /// Public identifier.
    pub uuid: String,
    /// Unique source name.
    pub name: String,
    /// Compute hours consumed, as last evaluated.
    pub compute_used: f64,
    /// Compute hours granted.
    pub compute_allowed: f64,
    /// Renewal strategy name.
    pub renewal_strategy: String,
}

impl AllocationSourceRecord {
    /// Whether the source has consumed its full budget. Exactly-at-budget
    /// counts as over.
    pub fn is_over_allocation(&self) -> bool {
        self.compute_used >= self.compute_allowed
    }
}

/// A cloud image as presented to the store for hierarchy upsert.
#[derive(Debug, Clone)]
pub struct NewMachineImage {
    /// Cloud-side image identifier.
    pub identifier: String,
    /// Application name the image belongs to.
    pub name: String,
    /// Version name within the application.
    pub version_name: String,
    /// Username of the image owner.
    pub owner_username: String,
    /// Whether the image family is private.
    pub private: bool,
}

/// A cloud volume as presented to the store for upsert.
#[derive(Debug, Clone)]
pub struct NewVolume {
    /// Cloud-side volume identifier.
    pub identifier: String,
    /// Volume display name.
    pub name: String,
    /// Capacity in GB.
    pub size_gb: i64,
    /// Owning user id.
    pub created_by: i64,
}

/// A cloud size as presented to the store for upsert.
#[derive(Debug, Clone)]
pub struct NewSize {
    /// Cloud-side size identifier.
    pub alias: String,
    /// Size display name.
    pub name: String,
    /// Virtual CPU count.
    pub cpu: i64,
    /// Memory in MB.
    pub mem: i64,
    /// Disk in GB.
    pub disk: i64,
}

/// A cloud instance as presented to the store for upsert.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Cloud-side instance identifier.
    pub provider_alias: String,
    /// Identity the instance runs under.
    pub identity_id: i64,
    /// Status reported by the cloud.
    pub status_name: String,
    /// Size of the instance at first sighting.
    pub size_id: i64,
    /// Free-text sub-state, if reported.
    pub activity: Option<String>,
}

/// A new history row to append (without closing a prior one).
#[derive(Debug, Clone)]
pub struct NewHistory {
    /// Owning instance.
    pub instance_id: i64,
    /// Status name; unseen names are created on first use.
    pub status_name: String,
    /// Size of the instance at the time of this status.
    pub size_id: i64,
    /// Free-text sub-state.
    pub activity: Option<String>,
    /// JSON fault/diagnostic payload.
    pub extra: Option<serde_json::Value>,
    /// When this status began.
    pub start_date: DateTime<Utc>,
    /// When this status ended, if already known.
    pub end_date: Option<DateTime<Utc>>,
}

/// An atomic close-and-open status transition on an instance's chain.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    /// Owning instance.
    pub instance_id: i64,
    /// Status name for the new row.
    pub status_name: String,
    /// Free-text sub-state for the new row.
    pub activity: Option<String>,
    /// Size of the instance at transition time.
    pub size_id: i64,
    /// JSON fault/diagnostic payload for the new row.
    pub extra: Option<serde_json::Value>,
    /// Transition instant: end of the prior row, start of the new one.
    pub start_time: DateTime<Utc>,
    /// The row expected to be open, if the caller already holds it.
    /// When None, the chain's last row is looked up inside the transaction.
    pub last_history_id: Option<i64>,
}

/// Lifecycle-store interface used by the reconciliation and enforcement
/// engines. All queries are provider-scoped where a provider id is taken,
/// so passes for different providers never observe each other's rows.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Providers
    // ------------------------------------------------------------------

    async fn list_active_providers(&self) -> Result<Vec<ProviderRecord>, CoreError>;

    async fn get_provider(&self, provider_id: i64) -> Result<Option<ProviderRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Machines and the application hierarchy
    // ------------------------------------------------------------------

    /// List machines on a provider whose instance source is not end-dated.
    async fn list_current_machines(
        &self,
        provider_id: i64,
    ) -> Result<Vec<MachineRecord>, CoreError>;

    async fn get_machine_by_identifier(
        &self,
        provider_id: i64,
        identifier: &str,
    ) -> Result<Option<MachineRecord>, CoreError>;

    /// Upsert the application -> version -> machine hierarchy for a cloud
    /// image. Returns the machine and whether it was newly created.
    async fn ensure_machine_hierarchy(
        &self,
        provider_id: i64,
        image: &NewMachineImage,
    ) -> Result<(MachineRecord, bool), CoreError>;

    async fn end_date_machine(
        &self,
        machine_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Count machines in a version still current at `at` (end date null or
    /// later than `at`).
    async fn count_current_machines_in_version(
        &self,
        version_id: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    async fn end_date_version(
        &self,
        version_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn count_current_versions_in_application(
        &self,
        application_id: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    async fn end_date_application(
        &self,
        application_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn get_application(
        &self,
        application_id: i64,
    ) -> Result<Option<ApplicationRecord>, CoreError>;

    /// Versions never associated with any machine and not yet end-dated.
    async fn list_versions_without_machines(&self) -> Result<Vec<VersionRecord>, CoreError>;

    /// Applications never associated with any version and not yet end-dated.
    async fn list_applications_without_versions(&self)
    -> Result<Vec<ApplicationRecord>, CoreError>;

    /// Applications still current whose versions are all end-dated; these
    /// are drift from incomplete cascades.
    async fn list_drifted_applications(&self) -> Result<Vec<ApplicationRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Memberships (additive-only joins)
    // ------------------------------------------------------------------

    /// Create a machine membership if absent. Returns true when a row was
    /// inserted. Duplicate inserts are a no-op (unique constraint).
    async fn add_machine_membership(&self, machine_id: i64, group_id: i64)
    -> Result<bool, CoreError>;

    async fn add_version_membership(
        &self,
        version_id: i64,
        group_id: i64,
    ) -> Result<bool, CoreError>;

    async fn add_application_membership(
        &self,
        application_id: i64,
        group_id: i64,
    ) -> Result<bool, CoreError>;

    async fn count_machine_memberships(&self, machine_id: i64) -> Result<i64, CoreError>;

    async fn count_version_memberships(&self, version_id: i64) -> Result<i64, CoreError>;

    async fn count_application_memberships(&self, application_id: i64) -> Result<i64, CoreError>;

    async fn list_machine_membership_groups(
        &self,
        machine_id: i64,
    ) -> Result<Vec<GroupRecord>, CoreError>;

    /// Remove membership rows at all three granularities (machine, its
    /// version, its application) for groups NOT in `keep_group_ids`.
    /// This is the documented exception to membership monotonicity, used
    /// only by the corrupted-set repair path. Returns rows removed.
    async fn reset_memberships_to(
        &self,
        machine: &MachineRecord,
        keep_group_ids: &[i64],
    ) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Groups and cloud project mapping
    // ------------------------------------------------------------------

    /// Resolve cloud project names to groups through the explicit
    /// group <-> project mapping for a provider. Unknown names are
    /// silently absent from the result.
    async fn groups_for_project_names(
        &self,
        provider_id: i64,
        project_names: &[String],
    ) -> Result<Vec<GroupRecord>, CoreError>;

    /// The cloud project names a group maps to on a provider.
    async fn project_names_for_group(
        &self,
        provider_id: i64,
        group_id: i64,
    ) -> Result<Vec<String>, CoreError>;

    // ------------------------------------------------------------------
    // Machine requests, pattern matches, users
    // ------------------------------------------------------------------

    /// The most recent completed machine request that produced the image
    /// with this identifier, if any.
    async fn last_completed_machine_request(
        &self,
        identifier: &str,
    ) -> Result<Option<MachineRequestRecord>, CoreError>;

    async fn list_application_pattern_matches(
        &self,
        application_id: i64,
    ) -> Result<Vec<PatternMatchRecord>, CoreError>;

    async fn list_users(&self) -> Result<Vec<UserRecord>, CoreError>;

    async fn get_user_by_username(&self, username: &str)
    -> Result<Option<UserRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    async fn list_current_volumes(&self, provider_id: i64)
    -> Result<Vec<VolumeRecord>, CoreError>;

    async fn ensure_volume(
        &self,
        provider_id: i64,
        volume: &NewVolume,
    ) -> Result<(VolumeRecord, bool), CoreError>;

    async fn end_date_volume(
        &self,
        volume_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Identities
    // ------------------------------------------------------------------

    async fn find_identity_by_project_name(
        &self,
        provider_id: i64,
        project_name: &str,
    ) -> Result<Option<IdentityRecord>, CoreError>;

    async fn list_identities_for_provider(
        &self,
        provider_id: i64,
    ) -> Result<Vec<IdentityRecord>, CoreError>;

    async fn list_identities_for_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<IdentityRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Sizes
    // ------------------------------------------------------------------

    async fn list_current_sizes(&self, provider_id: i64) -> Result<Vec<SizeRecord>, CoreError>;

    /// Insert a size or update the attributes of the current row with the
    /// same alias. An end-dated size that reappears gets a fresh row; end
    /// dates, once set, are never cleared.
    async fn upsert_size(&self, provider_id: i64, size: &NewSize)
    -> Result<SizeRecord, CoreError>;

    async fn end_date_size(&self, size_id: i64, end_date: DateTime<Utc>)
    -> Result<(), CoreError>;

    /// Current sizes whose name marks them as unresolved placeholders.
    async fn list_unknown_sizes(&self, provider_id: i64) -> Result<Vec<SizeRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    async fn get_instance(&self, instance_id: i64) -> Result<Option<InstanceRecord>, CoreError>;

    /// Instances for an identity that are active: not end-dated, or still
    /// holding an open history row.
    async fn list_active_instances_for_identity(
        &self,
        identity_id: i64,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Upsert an instance. A newly created instance gets its first history
    /// row in the same transaction.
    async fn ensure_instance(
        &self,
        provider_id: i64,
        instance: &NewInstance,
    ) -> Result<(InstanceRecord, bool), CoreError>;

    /// End-date an instance and close all of its open history rows at the
    /// same instant, atomically.
    async fn end_date_instance_and_history(
        &self,
        instance_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Status history ledger
    // ------------------------------------------------------------------

    /// The chronologically last history row for an instance.
    async fn get_last_history(&self, instance_id: i64)
    -> Result<Option<HistoryRecord>, CoreError>;

    async fn list_open_histories(&self, instance_id: i64)
    -> Result<Vec<HistoryRecord>, CoreError>;

    async fn find_history_starting_at(
        &self,
        instance_id: i64,
        start_date: DateTime<Utc>,
    ) -> Result<Option<HistoryRecord>, CoreError>;

    async fn find_history_ending_at(
        &self,
        instance_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<Option<HistoryRecord>, CoreError>;

    /// Append a history row without touching the rest of the chain.
    async fn insert_history(&self, entry: &NewHistory) -> Result<HistoryRecord, CoreError>;

    /// Close every open history row for an instance at `end_date`.
    /// Used by the conflict-repair path. Returns rows closed.
    async fn close_open_histories(
        &self,
        instance_id: i64,
        end_date: DateTime<Utc>,
    ) -> Result<u64, CoreError>;

    /// Atomically close the instance's open history row and open the next
    /// one at `start_time`. All-or-nothing:
    ///
    /// - no open row to close, or the supplied `last_history_id` is
    ///   already closed -> `HistoryContractViolation`, nothing written
    /// - lock/busy conflict -> `LockConflict`, nothing written; callers
    ///   log and abandon (the next scheduled run retries)
    async fn record_status_transition(
        &self,
        transition: &StatusTransition,
    ) -> Result<HistoryRecord, CoreError>;

    // ------------------------------------------------------------------
    // Allocation sources
    // ------------------------------------------------------------------

    /// All allocation sources, ordered by name for reproducible runs.
    async fn list_allocation_sources(&self) -> Result<Vec<AllocationSourceRecord>, CoreError>;

    /// Users attached to a source, ordered by username.
    async fn list_users_for_allocation_source(
        &self,
        source_id: i64,
    ) -> Result<Vec<UserRecord>, CoreError>;

    /// Count of a user's allocation memberships that are not end-dated.
    async fn count_current_user_allocations(&self, user_id: i64) -> Result<i64, CoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
