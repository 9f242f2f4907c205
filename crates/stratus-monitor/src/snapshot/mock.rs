// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configurable in-memory snapshot source.
//!
//! Backs the integration suites and local dry runs: tests stage a cloud's
//! view per provider, point the engines at it, then flip resources in and
//! out to exercise the diff paths. Failure injection covers the
//! per-provider isolation requirements.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CloudImage, CloudInstance, CloudProject, CloudSize, CloudVolume, ResourceSnapshotSource,
    SnapshotError,
};

#[derive(Default)]
struct ProviderState {
    images: Vec<CloudImage>,
    volumes: Vec<CloudVolume>,
    sizes: Vec<CloudSize>,
    /// Sizes resolvable only by individual lookup, not the bulk listing.
    lookup_sizes: Vec<CloudSize>,
    instances: Vec<CloudInstance>,
    projects: Vec<CloudProject>,
    /// image id -> project ids with member access
    image_members: HashMap<String, Vec<String>>,
    /// (image id, project name) pairs granted through share_image
    shares: Vec<(String, String)>,
    /// When set, every call for this provider fails with a remote error.
    failing: bool,
    /// When set, get_size returns this error instead of a listing miss.
    size_lookup_error: Option<SnapshotError>,
}

/// In-memory [`ResourceSnapshotSource`] with per-provider staged state.
#[derive(Default)]
pub struct MockSnapshotSource {
    state: Mutex<HashMap<i64, ProviderState>>,
}

impl MockSnapshotSource {
    /// Create an empty mock cloud.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_provider<R>(&self, provider_id: i64, f: impl FnOnce(&mut ProviderState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(state.entry(provider_id).or_default())
    }

    fn check_failing(&self, provider_id: i64) -> Result<(), SnapshotError> {
        let failing = self.with_provider(provider_id, |p| p.failing);
        if failing {
            return Err(SnapshotError::Remote {
                status: 500,
                message: "mock provider outage".to_string(),
            });
        }
        Ok(())
    }

    /// Make every call for a provider fail with a remote error.
    pub fn set_failing(&self, provider_id: i64, failing: bool) {
        self.with_provider(provider_id, |p| p.failing = failing);
    }

    /// Make individual size lookups fail with the given error.
    pub fn set_size_lookup_error(&self, provider_id: i64, error: Option<SnapshotError>) {
        self.with_provider(provider_id, |p| p.size_lookup_error = error);
    }

    /// Stage an image.
    pub fn add_image(&self, provider_id: i64, image: CloudImage) {
        self.with_provider(provider_id, |p| p.images.push(image));
    }

    /// Remove an image, as if it were deleted cloud-side.
    pub fn remove_image(&self, provider_id: i64, image_id: &str) {
        self.with_provider(provider_id, |p| {
            p.images.retain(|image| image.id != image_id);
        });
    }

    /// Replace the member list for an image.
    pub fn set_image_members(&self, provider_id: i64, image_id: &str, member_ids: &[&str]) {
        self.with_provider(provider_id, |p| {
            p.image_members.insert(
                image_id.to_string(),
                member_ids.iter().map(|id| id.to_string()).collect(),
            );
        });
    }

    /// Stage a volume.
    pub fn add_volume(&self, provider_id: i64, volume: CloudVolume) {
        self.with_provider(provider_id, |p| p.volumes.push(volume));
    }

    /// Remove a volume.
    pub fn remove_volume(&self, provider_id: i64, volume_id: &str) {
        self.with_provider(provider_id, |p| {
            p.volumes.retain(|volume| volume.id != volume_id);
        });
    }

    /// Stage a size.
    pub fn add_size(&self, provider_id: i64, size: CloudSize) {
        self.with_provider(provider_id, |p| p.sizes.push(size));
    }

    /// Remove a size.
    pub fn remove_size(&self, provider_id: i64, alias: &str) {
        self.with_provider(provider_id, |p| p.sizes.retain(|size| size.id != alias));
    }

    /// Stage a size only resolvable by individual lookup.
    pub fn add_lookup_size(&self, provider_id: i64, size: CloudSize) {
        self.with_provider(provider_id, |p| p.lookup_sizes.push(size));
    }

    /// Stage an instance.
    pub fn add_instance(&self, provider_id: i64, instance: CloudInstance) {
        self.with_provider(provider_id, |p| p.instances.push(instance));
    }

    /// Remove an instance.
    pub fn remove_instance(&self, provider_id: i64, instance_id: &str) {
        self.with_provider(provider_id, |p| {
            p.instances.retain(|instance| instance.id != instance_id);
        });
    }

    /// Stage a project.
    pub fn add_project(&self, provider_id: i64, id: &str, name: &str) {
        self.with_provider(provider_id, |p| {
            p.projects.push(CloudProject {
                id: id.to_string(),
                name: name.to_string(),
            });
        });
    }

    /// Shares granted through [`ResourceSnapshotSource::share_image`],
    /// in call order.
    pub fn shares_recorded(&self, provider_id: i64) -> Vec<(String, String)> {
        self.with_provider(provider_id, |p| p.shares.clone())
    }

    /// A private, active image with no special metadata.
    pub fn image(id: &str, name: &str) -> CloudImage {
        CloudImage {
            id: id.to_string(),
            name: name.to_string(),
            status: "active".to_string(),
            visibility: "private".to_string(),
            owner_project_id: None,
            owner_username: Some("imaging-admin".to_string()),
            image_type: "image".to_string(),
            container_format: "bare".to_string(),
            disk_format: "qcow2".to_string(),
            metadata: HashMap::new(),
        }
    }

    /// A volume owned by a project.
    pub fn volume(id: &str, name: &str, size_gb: i64, owner_project_id: &str) -> CloudVolume {
        CloudVolume {
            id: id.to_string(),
            name: name.to_string(),
            size_gb,
            owner_project_id: Some(owner_project_id.to_string()),
        }
    }

    /// A size with fixed attributes.
    pub fn size(alias: &str, name: &str, cpu: i64, mem: i64, disk: i64) -> CloudSize {
        CloudSize {
            id: alias.to_string(),
            name: name.to_string(),
            cpu,
            mem,
            disk,
        }
    }

    /// An active instance owned by a project.
    pub fn instance(id: &str, name: &str, owner_project_id: &str, size_alias: &str) -> CloudInstance {
        CloudInstance {
            id: id.to_string(),
            name: name.to_string(),
            status: "active".to_string(),
            activity: None,
            owner_project_id: owner_project_id.to_string(),
            size_alias: size_alias.to_string(),
        }
    }
}

#[async_trait]
impl ResourceSnapshotSource for MockSnapshotSource {
    async fn list_all_images(&self, provider_id: i64) -> Result<Vec<CloudImage>, SnapshotError> {
        self.check_failing(provider_id)?;
        Ok(self.with_provider(provider_id, |p| p.images.clone()))
    }

    async fn list_all_volumes(
        &self,
        provider_id: i64,
    ) -> Result<Vec<CloudVolume>, SnapshotError> {
        self.check_failing(provider_id)?;
        Ok(self.with_provider(provider_id, |p| p.volumes.clone()))
    }

    async fn list_all_sizes(&self, provider_id: i64) -> Result<Vec<CloudSize>, SnapshotError> {
        self.check_failing(provider_id)?;
        Ok(self.with_provider(provider_id, |p| p.sizes.clone()))
    }

    async fn list_all_instances(
        &self,
        provider_id: i64,
    ) -> Result<Vec<CloudInstance>, SnapshotError> {
        self.check_failing(provider_id)?;
        Ok(self.with_provider(provider_id, |p| p.instances.clone()))
    }

    async fn list_projects(&self, provider_id: i64) -> Result<Vec<CloudProject>, SnapshotError> {
        self.check_failing(provider_id)?;
        Ok(self.with_provider(provider_id, |p| p.projects.clone()))
    }

    async fn get_image(
        &self,
        provider_id: i64,
        image_id: &str,
    ) -> Result<Option<CloudImage>, SnapshotError> {
        self.check_failing(provider_id)?;
        Ok(self.with_provider(provider_id, |p| {
            p.images.iter().find(|image| image.id == image_id).cloned()
        }))
    }

    async fn get_image_members(
        &self,
        provider_id: i64,
        image_id: &str,
    ) -> Result<Vec<String>, SnapshotError> {
        self.check_failing(provider_id)?;
        Ok(self.with_provider(provider_id, |p| {
            p.image_members.get(image_id).cloned().unwrap_or_default()
        }))
    }

    async fn share_image(
        &self,
        provider_id: i64,
        image_id: &str,
        project_name: &str,
    ) -> Result<(), SnapshotError> {
        self.check_failing(provider_id)?;
        self.with_provider(provider_id, |p| {
            let image = p
                .images
                .iter()
                .find(|image| image.id == image_id)
                .cloned()
                .ok_or_else(|| SnapshotError::NotFound(image_id.to_string()))?;
            if image.is_public() {
                return Err(SnapshotError::Forbidden(
                    "Public images do not have members".to_string(),
                ));
            }
            let project_id = p
                .projects
                .iter()
                .find(|project| project.name == project_name)
                .map(|project| project.id.clone())
                .ok_or_else(|| SnapshotError::NotFound(project_name.to_string()))?;

            let members = p.image_members.entry(image_id.to_string()).or_default();
            if members.contains(&project_id) {
                return Err(SnapshotError::Conflict(format!(
                    "member {} already associated with image {}",
                    project_id, image_id
                )));
            }
            members.push(project_id);
            p.shares
                .push((image_id.to_string(), project_name.to_string()));
            Ok(())
        })
    }

    async fn get_size(
        &self,
        provider_id: i64,
        alias: &str,
    ) -> Result<Option<CloudSize>, SnapshotError> {
        self.check_failing(provider_id)?;
        let injected = self.with_provider(provider_id, |p| p.size_lookup_error.clone());
        if let Some(error) = injected {
            if error.is_not_found() {
                return Ok(None);
            }
            return Err(error);
        }
        Ok(self.with_provider(provider_id, |p| {
            p.sizes
                .iter()
                .chain(p.lookup_sizes.iter())
                .find(|size| size.id == alias)
                .cloned()
        }))
    }
}
