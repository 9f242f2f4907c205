// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-monitor integration tests.
//!
//! Stages an in-memory store plus a mock cloud, and hands out engine
//! contexts wired to both.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use stratus_core::persistence::SqlitePersistence;
use stratus_monitor::snapshot::mock::MockSnapshotSource;
use stratus_monitor::validation::BasicValidation;
use stratus_monitor::{MonitorContext, MonitorSettings};

/// Test context pairing the in-memory store with the mock cloud.
pub struct TestContext {
    pub store: Arc<SqlitePersistence>,
    pub cloud: Arc<MockSnapshotSource>,
}

impl TestContext {
    pub async fn new() -> Self {
        let store = SqlitePersistence::in_memory()
            .await
            .expect("Failed to open in-memory store");
        Self {
            store: Arc::new(store),
            cloud: Arc::new(MockSnapshotSource::new()),
        }
    }

    /// A monitor context with default settings.
    pub fn monitor_ctx(&self) -> Arc<MonitorContext> {
        self.monitor_ctx_with(MonitorSettings::default())
    }

    /// A monitor context with explicit settings.
    pub fn monitor_ctx_with(&self, settings: MonitorSettings) -> Arc<MonitorContext> {
        Arc::new(MonitorContext::new(
            self.store.clone(),
            self.cloud.clone(),
            Arc::new(BasicValidation),
            settings,
        ))
    }

    pub async fn create_provider(
        &self,
        name: &str,
        active: bool,
        over_allocation_action: Option<&str>,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO providers (uuid, name, active, over_allocation_action) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(active)
        .bind(over_allocation_action)
        .execute(self.store.pool())
        .await
        .expect("Failed to create provider")
        .last_insert_rowid()
    }

    pub async fn create_user(&self, username: &str) -> i64 {
        sqlx::query("INSERT INTO users (username) VALUES (?)")
            .bind(username)
            .execute(self.store.pool())
            .await
            .expect("Failed to create user")
            .last_insert_rowid()
    }

    /// Create a group mapped to a cloud project of the same name.
    pub async fn create_group(&self, name: &str, provider_id: i64) -> i64 {
        let group_id = sqlx::query("INSERT INTO groups (uuid, name) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(name)
            .execute(self.store.pool())
            .await
            .expect("Failed to create group")
            .last_insert_rowid();
        sqlx::query(
            "INSERT INTO group_cloud_projects (group_id, provider_id, project_name) VALUES (?, ?, ?)",
        )
        .bind(group_id)
        .bind(provider_id)
        .bind(name)
        .execute(self.store.pool())
        .await
        .expect("Failed to map group to project");
        group_id
    }

    pub async fn create_identity(
        &self,
        provider_id: i64,
        user_id: i64,
        project_name: &str,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO identities (uuid, provider_id, created_by, project_name) VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(provider_id)
        .bind(user_id)
        .bind(project_name)
        .execute(self.store.pool())
        .await
        .expect("Failed to create identity")
        .last_insert_rowid()
    }

    pub async fn create_allocation_source(
        &self,
        name: &str,
        compute_used: f64,
        compute_allowed: f64,
    ) -> i64 {
        sqlx::query(
            r#"
            INSERT INTO allocation_sources (uuid, name, compute_used, compute_allowed)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(compute_used)
        .bind(compute_allowed)
        .execute(self.store.pool())
        .await
        .expect("Failed to create allocation source")
        .last_insert_rowid()
    }

    pub async fn attach_user_allocation(&self, user_id: i64, source_id: i64) {
        sqlx::query(
            "INSERT INTO user_allocation_sources (user_id, allocation_source_id) VALUES (?, ?)",
        )
        .bind(user_id)
        .bind(source_id)
        .execute(self.store.pool())
        .await
        .expect("Failed to attach allocation");
    }

    pub async fn create_machine_request(
        &self,
        machine_id: i64,
        status: &str,
        access_list: &[&str],
    ) -> i64 {
        let payload = serde_json::to_string(access_list).unwrap();
        sqlx::query(
            "INSERT INTO machine_requests (new_machine_id, status, access_list, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(machine_id)
        .bind(status)
        .bind(payload)
        .bind(Utc::now())
        .execute(self.store.pool())
        .await
        .expect("Failed to create machine request")
        .last_insert_rowid()
    }

    pub async fn create_pattern_match(
        &self,
        application_id: i64,
        pattern: &str,
        match_type: &str,
        allow_access: bool,
    ) {
        let pattern_id = sqlx::query(
            "INSERT INTO pattern_matches (pattern, match_type, allow_access) VALUES (?, ?, ?)",
        )
        .bind(pattern)
        .bind(match_type)
        .bind(allow_access)
        .execute(self.store.pool())
        .await
        .expect("Failed to create pattern match")
        .last_insert_rowid();
        sqlx::query(
            "INSERT INTO application_pattern_matches (application_id, pattern_match_id) VALUES (?, ?)",
        )
        .bind(application_id)
        .bind(pattern_id)
        .execute(self.store.pool())
        .await
        .expect("Failed to attach pattern match");
    }

    /// Count all end-dating mutations visible for a provider's machines,
    /// versions, and applications. Used by the idempotence checks.
    pub async fn lifecycle_fingerprint(&self, provider_id: i64) -> (i64, i64, i64) {
        let (machines,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM provider_machines pm
            JOIN instance_sources src ON src.id = pm.source_id
            WHERE src.provider_id = ? AND src.end_date IS NOT NULL
            "#,
        )
        .bind(provider_id)
        .fetch_one(self.store.pool())
        .await
        .unwrap();
        let (versions,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM application_versions WHERE end_date IS NOT NULL",
        )
        .fetch_one(self.store.pool())
        .await
        .unwrap();
        let (applications,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM applications WHERE end_date IS NOT NULL")
                .fetch_one(self.store.pool())
                .await
                .unwrap();
        (machines, versions, applications)
    }

    /// Set of end dates currently recorded for a provider's machines.
    pub async fn machine_end_dates(&self, provider_id: i64) -> Vec<Option<String>> {
        let rows: Vec<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT src.end_date
            FROM provider_machines pm
            JOIN instance_sources src ON src.id = pm.source_id
            WHERE src.provider_id = ?
            ORDER BY src.identifier
            "#,
        )
        .bind(provider_id)
        .fetch_all(self.store.pool())
        .await
        .unwrap();
        rows.into_iter().map(|(end,)| end).collect()
    }
}
