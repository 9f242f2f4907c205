// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Validation strategies at the engine's boundaries.
//!
//! Machine validation filters cloud snapshots before they are diffed
//! against the store; user validation checks a remote account source
//! under a bounded timeout and degrades to locally recorded allocation
//! membership when the remote is slow or failing.
//!
//! Strategies are selected by name at startup through [`validator_for`];
//! there is no ambient plugin registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use stratus_core::config::Config;
use stratus_core::persistence::{Persistence, UserRecord};

use crate::error::{Error, Result};
use crate::snapshot::{CloudImage, SnapshotError};

/// Decides whether a cloud image belongs in the catalog.
pub trait MachineValidator: Send + Sync {
    /// Return true if the image should be included; false to skip it.
    fn machine_is_valid(&self, image: &CloudImage) -> bool;
}

/// The sanity checks every strategy applies before adding an image to the
/// catalog: the image must be active, not a kernel/ramdisk blob, and not
/// a snapshot.
fn sanity_check(image: &CloudImage) -> bool {
    if image.status != "active" {
        info!(
            image_id = %image.id,
            status = %image.status,
            "Skipping cloud image, imaging status is not 'active'"
        );
        return false;
    }
    if is_kernel_or_ramdisk(image) {
        info!(image_id = %image.id, "Skipping cloud image, kernel/ramdisk found");
        return false;
    }
    if image.image_type == "snapshot" {
        info!(image_id = %image.id, "Skipping cloud image, snapshot found");
        return false;
    }
    true
}

fn is_kernel_or_ramdisk(image: &CloudImage) -> bool {
    let blob_formats = ["ari", "aki"];
    blob_formats.contains(&image.image_type.as_str())
        || blob_formats.contains(&image.container_format.as_str())
        || blob_formats.contains(&image.disk_format.as_str())
}

/// Truthiness test for exclusion/inclusion metadata values.
fn metadata_truthy(image: &CloudImage, key: &str) -> bool {
    let Some(raw) = image.metadata_value(key) else {
        return false;
    };
    match raw.to_lowercase().as_str() {
        "yes" | "true" => true,
        "no" | "false" => false,
        other => {
            info!(
                metadata_key = key,
                metadata_value = other,
                "Encountered unexpected (not-truthy) metadata value"
            );
            false
        }
    }
}

/// The minimal checks required to include a new image in the catalog.
pub struct BasicValidation;

impl MachineValidator for BasicValidation {
    fn machine_is_valid(&self, image: &CloudImage) -> bool {
        sanity_check(image)
    }
}

/// Skip images that carry the exclusion metadata key.
pub struct BlacklistValidation {
    metadata_key: String,
}

impl BlacklistValidation {
    /// Build with the metadata key to treat as an exclusion marker.
    pub fn new(metadata_key: impl Into<String>) -> Self {
        Self {
            metadata_key: metadata_key.into(),
        }
    }
}

impl MachineValidator for BlacklistValidation {
    fn machine_is_valid(&self, image: &CloudImage) -> bool {
        if !sanity_check(image) {
            return false;
        }
        if metadata_truthy(image, &self.metadata_key) {
            info!(
                image_id = %image.id,
                metadata_key = %self.metadata_key,
                "Skipping cloud image, exclusion metadata present"
            );
            return false;
        }
        true
    }
}

/// Include only images that carry the inclusion metadata key.
pub struct WhitelistValidation {
    metadata_key: String,
}

impl WhitelistValidation {
    /// Build with the metadata key required for inclusion.
    pub fn new(metadata_key: impl Into<String>) -> Self {
        Self {
            metadata_key: metadata_key.into(),
        }
    }
}

impl MachineValidator for WhitelistValidation {
    fn machine_is_valid(&self, image: &CloudImage) -> bool {
        if !sanity_check(image) {
            return false;
        }
        if !metadata_truthy(image, &self.metadata_key) {
            info!(
                image_id = %image.id,
                metadata_key = %self.metadata_key,
                "Skipping cloud image, inclusion metadata missing"
            );
            return false;
        }
        true
    }
}

/// Resolve a validation strategy by configured name.
pub fn validator_for(config: &Config) -> Result<Arc<dyn MachineValidator>> {
    match config.machine_validator.as_str() {
        "basic" => Ok(Arc::new(BasicValidation)),
        "blacklist" => Ok(Arc::new(BlacklistValidation::new(
            config.blacklist_metadata_key.clone(),
        ))),
        "whitelist" => Ok(Arc::new(WhitelistValidation::new(
            config.whitelist_metadata_key.clone(),
        ))),
        other => Err(Error::UnknownValidator(other.to_string())),
    }
}

/// A remote authority on user accounts (e.g. an allocation service).
#[async_trait]
pub trait RemoteAccountSource: Send + Sync {
    /// Whether the user currently holds at least one active allocation.
    ///
    /// `NotFound` means the remote has no account for the user at all.
    async fn has_active_allocations(&self, username: &str) -> Result<bool, SnapshotError>;
}

/// Validate a user against the remote account source, degrading to local
/// truth on a slow or failing remote.
///
/// - remote answers in time: its verdict stands
/// - remote has no account for the user: invalid
/// - remote times out or errors: fall back to locally recorded
///   allocation membership
pub async fn user_is_valid(
    store: &dyn Persistence,
    remote: &dyn RemoteAccountSource,
    timeout: Duration,
    user: &UserRecord,
) -> bool {
    match tokio::time::timeout(timeout, remote.has_active_allocations(&user.username)).await {
        Ok(Ok(valid)) => valid,
        Ok(Err(err)) if err.is_not_found() => {
            info!(username = %user.username, "User has no account on the remote source");
            false
        }
        Ok(Err(err)) => {
            warn!(
                username = %user.username,
                error = %err,
                "Remote validation failed, falling back to local allocations"
            );
            local_allocation_fallback(store, user).await
        }
        Err(_) => {
            warn!(
                username = %user.username,
                timeout_secs = timeout.as_secs(),
                "Remote validation timed out, falling back to local allocations"
            );
            local_allocation_fallback(store, user).await
        }
    }
}

async fn local_allocation_fallback(store: &dyn Persistence, user: &UserRecord) -> bool {
    match store.count_current_user_allocations(user.id).await {
        Ok(count) => count > 0,
        Err(err) => {
            warn!(
                username = %user.username,
                error = %err,
                "Local allocation lookup failed during validation fallback"
            );
            false
        }
    }
}
