// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-core integration tests.
//!
//! Provides a TestContext around an in-memory store with seed helpers.

#![allow(dead_code)]

use chrono::Utc;
use uuid::Uuid;

use stratus_core::persistence::{NewSize, Persistence, SqlitePersistence};

/// Test context wrapping an in-memory SQLite store.
pub struct TestContext {
    pub store: SqlitePersistence,
}

impl TestContext {
    /// Create a fresh in-memory store with the schema applied.
    pub async fn new() -> Self {
        let store = SqlitePersistence::in_memory()
            .await
            .expect("Failed to open in-memory store");
        Self { store }
    }

    /// Create a provider, returning its id.
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

    /// Create a user, returning its id.
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

    /// Create an identity for a user on a provider.
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

    /// Create a size through the store's upsert path, returning its id.
    pub async fn create_size(&self, provider_id: i64, alias: &str, name: &str) -> i64 {
        self.store
            .upsert_size(
                provider_id,
                &NewSize {
                    alias: alias.to_string(),
                    name: name.to_string(),
                    cpu: 2,
                    mem: 4096,
                    disk: 40,
                },
            )
            .await
            .expect("Failed to upsert size")
            .id
    }

    /// Create an allocation source, returning its id.
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

    /// Attach a user to an allocation source.
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

    /// Record a machine request for a machine with the given access list.
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

    /// Attach an access-list pattern to an application.
    pub async fn create_pattern_match(
        &self,
        application_id: i64,
        pattern: &str,
        match_type: &str,
        allow_access: bool,
    ) -> i64 {
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
        pattern_id
    }
}
