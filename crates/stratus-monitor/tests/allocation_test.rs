// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocation enforcement: dispatch decisions and per-identity isolation.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::TestContext;

use stratus_core::persistence::{
    AllocationSourceRecord, IdentityRecord, Persistence, UserRecord,
};
use stratus_monitor::allocation::{
    AllocationOverridePolicy, EnforcementContext, EnforcementOverride, InstanceEnforcer,
    monitor_allocation_sources, overage_enforcement_for_user,
};
use stratus_monitor::error::Error;

/// Policy scripted per username.
struct MapPolicy {
    overrides: HashMap<String, EnforcementOverride>,
}

#[async_trait]
impl AllocationOverridePolicy for MapPolicy {
    async fn get_override(
        &self,
        user: &UserRecord,
        _source: &AllocationSourceRecord,
    ) -> EnforcementOverride {
        self.overrides
            .get(&user.username)
            .copied()
            .unwrap_or(EnforcementOverride::NoOverride)
    }
}

/// Enforcer that records calls and can fail for one identity.
#[derive(Default)]
struct RecordingEnforcer {
    calls: Mutex<Vec<(String, String, String)>>,
    fail_identity: Mutex<Option<i64>>,
}

impl RecordingEnforcer {
    fn calls(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn fail_for(&self, identity_id: i64) {
        *self.fail_identity.lock().unwrap() = Some(identity_id);
    }
}

#[async_trait]
impl InstanceEnforcer for RecordingEnforcer {
    async fn enforce(
        &self,
        user: &UserRecord,
        identity: &IdentityRecord,
        action: &str,
    ) -> stratus_monitor::error::Result<Vec<String>> {
        if *self.fail_identity.lock().unwrap() == Some(identity.id) {
            return Err(Error::Other("invalid credentials".to_string()));
        }
        self.calls.lock().unwrap().push((
            user.username.clone(),
            identity.project_name.clone(),
            action.to_string(),
        ));
        Ok(vec![format!("inst-{}", identity.id)])
    }
}

fn enforcement_ctx(
    ctx: &TestContext,
    overrides: HashMap<String, EnforcementOverride>,
    enforcer: Arc<RecordingEnforcer>,
    enforcing: bool,
) -> Arc<EnforcementContext> {
    Arc::new(EnforcementContext {
        store: ctx.store.clone(),
        policy: Arc::new(MapPolicy { overrides }),
        enforcer,
        enforcing,
    })
}

#[tokio::test]
async fn test_dispatch_decision_matrix() {
    let ctx = TestContext::new().await;

    // One over-allocation source and one under-allocation source, with a
    // user per override choice on each.
    let over = ctx.create_allocation_source("TG-OVER", 100.0, 100.0).await;
    let under = ctx.create_allocation_source("TG-UNDER", 10.0, 100.0).await;
    let mut overrides = HashMap::new();
    for (name, choice) in [
        ("none", EnforcementOverride::NoOverride),
        ("always", EnforcementOverride::AlwaysEnforce),
        ("never", EnforcementOverride::NeverEnforce),
    ] {
        let user = ctx.create_user(name).await;
        ctx.attach_user_allocation(user, over).await;
        ctx.attach_user_allocation(user, under).await;
        overrides.insert(name.to_string(), choice);
    }

    let enforcer = Arc::new(RecordingEnforcer::default());
    let enforcement = enforcement_ctx(&ctx, overrides, enforcer, true);
    let dispatched = monitor_allocation_sources(enforcement, &[]).await.unwrap();

    // Deterministic order: source name, then username.
    assert_eq!(
        dispatched,
        vec![
            ("TG-OVER".to_string(), "always".to_string()),
            ("TG-OVER".to_string(), "none".to_string()),
            ("TG-UNDER".to_string(), "always".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_over_allocation_with_never_enforce_is_skipped() {
    // AllocationSource TG-001 with compute_used == compute_allowed (over)
    // for alice, override NEVER_ENFORCE: no enforcement dispatched.
    let ctx = TestContext::new().await;
    let source = ctx.create_allocation_source("TG-001", 100.0, 100.0).await;
    let alice = ctx.create_user("alice").await;
    ctx.attach_user_allocation(alice, source).await;

    let mut overrides = HashMap::new();
    overrides.insert("alice".to_string(), EnforcementOverride::NeverEnforce);

    let enforcer = Arc::new(RecordingEnforcer::default());
    let enforcement = enforcement_ctx(&ctx, overrides, enforcer.clone(), true);
    let dispatched = monitor_allocation_sources(enforcement, &[]).await.unwrap();
    assert!(dispatched.is_empty());
    assert!(enforcer.calls().is_empty());
}

#[tokio::test]
async fn test_username_filter_limits_evaluation() {
    let ctx = TestContext::new().await;
    let source = ctx.create_allocation_source("TG-001", 100.0, 100.0).await;
    for name in ["alice", "bob"] {
        let user = ctx.create_user(name).await;
        ctx.attach_user_allocation(user, source).await;
    }

    let enforcer = Arc::new(RecordingEnforcer::default());
    let enforcement = enforcement_ctx(&ctx, HashMap::new(), enforcer, true);
    let dispatched =
        monitor_allocation_sources(enforcement, &["bob".to_string()]).await.unwrap();
    assert_eq!(dispatched, vec![("TG-001".to_string(), "bob".to_string())]);
}

#[tokio::test]
async fn test_per_identity_failure_is_isolated_and_aggregated() {
    let ctx = TestContext::new().await;
    let provider_east = ctx
        .create_provider("cumulus-east", true, Some("Suspend"))
        .await;
    let provider_west = ctx
        .create_provider("cumulus-west", true, Some("Suspend"))
        .await;
    let source_id = ctx.create_allocation_source("TG-001", 100.0, 100.0).await;
    let alice = ctx.create_user("alice").await;
    ctx.attach_user_allocation(alice, source_id).await;
    let east_identity = ctx.create_identity(provider_east, alice, "alice").await;
    let west_identity = ctx.create_identity(provider_west, alice, "alice-west").await;

    let enforcer = Arc::new(RecordingEnforcer::default());
    enforcer.fail_for(east_identity);
    let enforcement = enforcement_ctx(&ctx, HashMap::new(), enforcer.clone(), true);

    let sources = ctx.store.list_allocation_sources().await.unwrap();
    let users = ctx
        .store
        .list_users_for_allocation_source(sources[0].id)
        .await
        .unwrap();

    let affected = overage_enforcement_for_user(&enforcement, &sources[0], &users[0]).await;

    // The failing identity contributes nothing; the healthy one's
    // affected instances are aggregated.
    assert_eq!(affected, vec![format!("inst-{}", west_identity)]);
    let calls = enforcer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "alice-west");
    assert_eq!(calls[0].2, "Suspend");
}

#[tokio::test]
async fn test_enforcing_gate_short_circuits() {
    let ctx = TestContext::new().await;
    let provider = ctx
        .create_provider("cumulus-east", true, Some("Suspend"))
        .await;
    let source_id = ctx.create_allocation_source("TG-001", 100.0, 100.0).await;
    let alice = ctx.create_user("alice").await;
    ctx.attach_user_allocation(alice, source_id).await;
    ctx.create_identity(provider, alice, "alice").await;

    let enforcer = Arc::new(RecordingEnforcer::default());
    let enforcement = enforcement_ctx(&ctx, HashMap::new(), enforcer.clone(), false);

    let sources = ctx.store.list_allocation_sources().await.unwrap();
    let users = ctx
        .store
        .list_users_for_allocation_source(sources[0].id)
        .await
        .unwrap();
    let affected = overage_enforcement_for_user(&enforcement, &sources[0], &users[0]).await;
    assert!(affected.is_empty());
    assert!(enforcer.calls().is_empty());
}

#[tokio::test]
async fn test_provider_without_action_does_nothing() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    let source_id = ctx.create_allocation_source("TG-001", 100.0, 100.0).await;
    let alice = ctx.create_user("alice").await;
    ctx.attach_user_allocation(alice, source_id).await;
    ctx.create_identity(provider, alice, "alice").await;

    let enforcer = Arc::new(RecordingEnforcer::default());
    let enforcement = enforcement_ctx(&ctx, HashMap::new(), enforcer.clone(), true);

    let sources = ctx.store.list_allocation_sources().await.unwrap();
    let users = ctx
        .store
        .list_users_for_allocation_source(sources[0].id)
        .await
        .unwrap();
    let affected = overage_enforcement_for_user(&enforcement, &sources[0], &users[0]).await;
    assert!(affected.is_empty());
    assert!(enforcer.calls().is_empty());
}
