// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run snapshot caches.
//!
//! Image lookups and tenant-name maps are fetched once per reconciliation
//! run and reused across records. The cache is owned by the run that
//! created it; it never outlives a pass, so entries cannot go stale
//! between scheduler ticks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::snapshot::{CloudImage, ResourceSnapshotSource, SnapshotError};

/// Caches scoped to a single reconciliation run.
#[derive(Default)]
pub struct SnapshotCache {
    images: HashMap<(i64, String), Option<CloudImage>>,
    tenant_names: HashMap<i64, Arc<HashMap<String, String>>>,
}

impl SnapshotCache {
    /// Create an empty cache for one run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an image, remembering the answer (including "gone").
    pub async fn image(
        &mut self,
        source: &dyn ResourceSnapshotSource,
        provider_id: i64,
        image_id: &str,
    ) -> Result<Option<CloudImage>, SnapshotError> {
        let key = (provider_id, image_id.to_string());
        if let Some(cached) = self.images.get(&key) {
            return Ok(cached.clone());
        }
        let image = source.get_image(provider_id, image_id).await?;
        self.images.insert(key, image.clone());
        Ok(image)
    }

    /// The provider's project id -> name map, fetched once per run.
    pub async fn tenant_name_map(
        &mut self,
        source: &dyn ResourceSnapshotSource,
        provider_id: i64,
    ) -> Result<Arc<HashMap<String, String>>, SnapshotError> {
        if let Some(map) = self.tenant_names.get(&provider_id) {
            return Ok(map.clone());
        }
        let projects = source.list_projects(provider_id).await?;
        let map: HashMap<String, String> = projects
            .into_iter()
            .map(|project| (project.id, project.name))
            .collect();
        let map = Arc::new(map);
        self.tenant_names.insert(provider_id, map.clone());
        Ok(map)
    }
}
