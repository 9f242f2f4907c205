// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The cloud snapshot capability consumed by the reconciliation engine.
//!
//! A [`ResourceSnapshotSource`] returns the authoritative cloud-side view
//! of a provider's images, volumes, sizes, and instances. Concrete cloud
//! clients implement it out of tree; [`mock`] ships a configurable
//! in-memory implementation for tests and local runs.

pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a snapshot source.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// The remote call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The requested resource does not exist on the cloud.
    #[error("not found: {0}")]
    NotFound(String),

    /// The cloud rejected a mutation that was already satisfied or is
    /// contested (e.g. a member already associated with an image).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The cloud refused the operation outright.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Any other remote failure.
    #[error("remote error ({status}): {message}")]
    Remote {
        /// HTTP-like status code reported by the cloud.
        status: u16,
        /// Remote error message.
        message: String,
    },
}

impl SnapshotError {
    /// Whether this error means "the resource no longer exists" rather
    /// than a transient failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || matches!(self, Self::Remote { status: 404, .. })
    }
}

/// A machine image as reported by the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudImage {
    /// Cloud-side identifier.
    pub id: String,
    /// Image name.
    pub name: String,
    /// Imaging status (only `active` images enter the catalog).
    pub status: String,
    /// Visibility: `public`, `private`, or `shared`.
    pub visibility: String,
    /// Project id of the owning tenant, when reported.
    pub owner_project_id: Option<String>,
    /// Username of the image author, when reported.
    pub owner_username: Option<String>,
    /// `image` or `snapshot`.
    pub image_type: String,
    /// Container format (`ari`/`aki` marks kernel/ramdisk blobs).
    pub container_format: String,
    /// Disk format (`ari`/`aki` marks kernel/ramdisk blobs).
    pub disk_format: String,
    /// Free-form metadata attached to the image.
    pub metadata: HashMap<String, String>,
}

impl CloudImage {
    /// Whether the image is publicly visible.
    pub fn is_public(&self) -> bool {
        self.visibility.eq_ignore_ascii_case("public")
    }

    /// Fetch a metadata value by key.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// The version name the image declares, defaulting to "1.0".
    pub fn version_name(&self) -> String {
        self.metadata
            .get("application_version")
            .cloned()
            .unwrap_or_else(|| "1.0".to_string())
    }
}

/// A block storage volume as reported by the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudVolume {
    /// Cloud-side identifier.
    pub id: String,
    /// Volume name.
    pub name: String,
    /// Capacity in GB.
    pub size_gb: i64,
    /// Project id of the owning tenant.
    pub owner_project_id: Option<String>,
}

/// A machine size (flavor) as reported by the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSize {
    /// Cloud-side identifier.
    pub id: String,
    /// Size name.
    pub name: String,
    /// Virtual CPU count.
    pub cpu: i64,
    /// Memory in MB.
    pub mem: i64,
    /// Disk in GB.
    pub disk: i64,
}

/// A running instance as reported by the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInstance {
    /// Cloud-side identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Reported status (active, suspended, ...).
    pub status: String,
    /// Free-text sub-state, if reported.
    pub activity: Option<String>,
    /// Project id of the owning tenant.
    pub owner_project_id: String,
    /// Size identifier the instance runs at.
    pub size_alias: String,
}

/// A cloud project/tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProject {
    /// Cloud-side identifier.
    pub id: String,
    /// Project name.
    pub name: String,
}

/// Authoritative resource listings for one provider.
///
/// Every call is a potentially blocking network operation; the engines
/// treat per-call failures as per-unit failures and never let one
/// provider's outage abort another provider's pass.
#[async_trait]
pub trait ResourceSnapshotSource: Send + Sync {
    /// All images visible to the administrative account.
    async fn list_all_images(&self, provider_id: i64) -> Result<Vec<CloudImage>, SnapshotError>;

    /// All volumes across tenants.
    async fn list_all_volumes(&self, provider_id: i64)
    -> Result<Vec<CloudVolume>, SnapshotError>;

    /// All sizes (flavors).
    async fn list_all_sizes(&self, provider_id: i64) -> Result<Vec<CloudSize>, SnapshotError>;

    /// All running instances across tenants.
    async fn list_all_instances(
        &self,
        provider_id: i64,
    ) -> Result<Vec<CloudInstance>, SnapshotError>;

    /// All projects/tenants.
    async fn list_projects(&self, provider_id: i64) -> Result<Vec<CloudProject>, SnapshotError>;

    /// Look up a single image. `Ok(None)` means it no longer exists.
    async fn get_image(
        &self,
        provider_id: i64,
        image_id: &str,
    ) -> Result<Option<CloudImage>, SnapshotError>;

    /// Project ids granted member access to an image.
    async fn get_image_members(
        &self,
        provider_id: i64,
        image_id: &str,
    ) -> Result<Vec<String>, SnapshotError>;

    /// Grant a project member access to an image.
    async fn share_image(
        &self,
        provider_id: i64,
        image_id: &str,
        project_name: &str,
    ) -> Result<(), SnapshotError>;

    /// Look up a single size by identifier. `Ok(None)` means the size was
    /// truly deleted (a remote 404); any other failure is an error.
    async fn get_size(
        &self,
        provider_id: i64,
        alias: &str,
    ) -> Result<Option<CloudSize>, SnapshotError>;
}
