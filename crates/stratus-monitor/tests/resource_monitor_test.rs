// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Volume, size, and instance reconciliation passes.

mod common;

use chrono::Utc;
use common::TestContext;
use stratus_core::persistence::{NewHistory, Persistence};
use stratus_monitor::instances::monitor_instances_for;
use stratus_monitor::sizes::monitor_sizes_for;
use stratus_monitor::snapshot::SnapshotError;
use stratus_monitor::snapshot::mock::MockSnapshotSource;
use stratus_monitor::volumes::monitor_volumes_for;

// ---------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_volume_registration_and_end_dating() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    let alice = ctx.create_user("alice").await;
    ctx.create_identity(provider, alice, "alice").await;
    ctx.cloud.add_project(provider, "t-alice", "alice");
    ctx.cloud
        .add_volume(provider, MockSnapshotSource::volume("vol-1", "scratch", 100, "t-alice"));

    let monitor = ctx.monitor_ctx();
    let seen = monitor_volumes_for(&monitor, provider).await.unwrap();
    assert_eq!(seen, vec!["vol-1"]);
    assert_eq!(ctx.store.list_current_volumes(provider).await.unwrap().len(), 1);

    // Second run with an unchanged snapshot changes nothing.
    let seen = monitor_volumes_for(&monitor, provider).await.unwrap();
    assert_eq!(seen, vec!["vol-1"]);

    // The volume disappears cloud-side: end-dated.
    ctx.cloud.remove_volume(provider, "vol-1");
    let seen = monitor_volumes_for(&monitor, provider).await.unwrap();
    assert!(seen.is_empty());
    assert!(ctx.store.list_current_volumes(provider).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_volume_without_identity_is_skipped() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    ctx.cloud.add_project(provider, "t-ghost", "ghost-project");
    ctx.cloud
        .add_volume(provider, MockSnapshotSource::volume("vol-ghost", "orphan", 10, "t-ghost"));

    let monitor = ctx.monitor_ctx();
    let seen = monitor_volumes_for(&monitor, provider).await.unwrap();
    assert!(seen.is_empty());
    assert!(ctx.store.list_current_volumes(provider).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_size_diff_and_rename() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    ctx.cloud
        .add_size(provider, MockSnapshotSource::size("m1.small", "m1.small", 1, 2048, 20));
    ctx.cloud
        .add_size(provider, MockSnapshotSource::size("m1.large", "m1.large", 4, 8192, 80));

    let monitor = ctx.monitor_ctx();
    let seen = monitor_sizes_for(&monitor, provider).await.unwrap();
    assert_eq!(seen.len(), 2);

    // One size retires, the other is renamed; both converge in place.
    ctx.cloud.remove_size(provider, "m1.large");
    ctx.cloud.remove_size(provider, "m1.small");
    ctx.cloud
        .add_size(provider, MockSnapshotSource::size("m1.small", "m1.small.v2", 1, 2048, 20));

    let seen = monitor_sizes_for(&monitor, provider).await.unwrap();
    assert_eq!(seen.len(), 1);
    let current = ctx.store.list_current_sizes(provider).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].alias, "m1.small");
    assert_eq!(current[0].name, "m1.small.v2");
}

#[tokio::test]
async fn test_unknown_size_repaired_by_lookup() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;

    // A placeholder left behind by instance monitoring; the cloud only
    // resolves it by individual lookup.
    ctx.store
        .upsert_size(
            provider,
            &stratus_core::persistence::NewSize {
                alias: "m9.hidden".to_string(),
                name: "Unknown Size 0".to_string(),
                cpu: 0,
                mem: 0,
                disk: 0,
            },
        )
        .await
        .unwrap();
    ctx.cloud
        .add_lookup_size(provider, MockSnapshotSource::size("m9.hidden", "m9.hidden", 8, 16384, 160));

    let monitor = ctx.monitor_ctx();
    monitor_sizes_for(&monitor, provider).await.unwrap();

    let current = ctx.store.list_current_sizes(provider).await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].name, "m9.hidden");
    assert_eq!(current[0].cpu, 8);
    assert!(ctx.store.list_unknown_sizes(provider).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_size_404_is_end_dated_quietly() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    ctx.store
        .upsert_size(
            provider,
            &stratus_core::persistence::NewSize {
                alias: "m9.gone".to_string(),
                name: "Unknown Size 0".to_string(),
                cpu: 0,
                mem: 0,
                disk: 0,
            },
        )
        .await
        .unwrap();
    ctx.cloud
        .set_size_lookup_error(provider, Some(SnapshotError::NotFound("m9.gone".to_string())));

    let monitor = ctx.monitor_ctx();
    monitor_sizes_for(&monitor, provider).await.unwrap();
    assert!(ctx.store.list_current_sizes(provider).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_size_lookup_failure_fails_the_unit() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    ctx.store
        .upsert_size(
            provider,
            &stratus_core::persistence::NewSize {
                alias: "m9.flaky".to_string(),
                name: "Unknown Size 0".to_string(),
                cpu: 0,
                mem: 0,
                disk: 0,
            },
        )
        .await
        .unwrap();
    ctx.cloud.set_size_lookup_error(
        provider,
        Some(SnapshotError::Remote {
            status: 503,
            message: "try later".to_string(),
        }),
    );

    let monitor = ctx.monitor_ctx();
    assert!(monitor_sizes_for(&monitor, provider).await.is_err());

    // The size is untouched; the next scheduled run retries.
    assert_eq!(ctx.store.list_current_sizes(provider).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_instance_registration_and_cleanup() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    let alice = ctx.create_user("alice").await;
    let identity = ctx.create_identity(provider, alice, "alice").await;
    ctx.cloud.add_project(provider, "t-alice", "alice");
    ctx.cloud
        .add_size(provider, MockSnapshotSource::size("m1.small", "m1.small", 1, 2048, 20));
    ctx.cloud
        .add_instance(provider, MockSnapshotSource::instance("inst-1", "bastion", "t-alice", "m1.small"));

    let monitor = ctx.monitor_ctx();
    monitor_sizes_for(&monitor, provider).await.unwrap();
    let summary = monitor_instances_for(&monitor, provider, None).await.unwrap();
    assert_eq!(summary.seen, 1);
    assert_eq!(summary.end_dated, 0);

    let active = ctx
        .store
        .list_active_instances_for_identity(identity)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    let open = ctx.store.list_open_histories(active[0].id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, "active");

    // The cloud stops reporting the instance; even with zero running
    // instances the identity is still swept.
    ctx.cloud.remove_instance(provider, "inst-1");
    let summary = monitor_instances_for(&monitor, provider, None).await.unwrap();
    assert_eq!(summary.seen, 0);
    assert_eq!(summary.end_dated, 1);
    assert!(
        ctx.store
            .list_active_instances_for_identity(identity)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_instance_history_conflict_is_repaired() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    let alice = ctx.create_user("alice").await;
    let identity = ctx.create_identity(provider, alice, "alice").await;
    ctx.cloud.add_project(provider, "t-alice", "alice");
    ctx.cloud
        .add_size(provider, MockSnapshotSource::size("m1.small", "m1.small", 1, 2048, 20));
    ctx.cloud
        .add_instance(provider, MockSnapshotSource::instance("inst-1", "bastion", "t-alice", "m1.small"));

    let monitor = ctx.monitor_ctx();
    monitor_sizes_for(&monitor, provider).await.unwrap();
    monitor_instances_for(&monitor, provider, None).await.unwrap();

    let active = ctx
        .store
        .list_active_instances_for_identity(identity)
        .await
        .unwrap();
    let instance = &active[0];
    let size = &ctx.store.list_current_sizes(provider).await.unwrap()[0];

    // A conflicting writer leaves a second open row.
    ctx.store
        .insert_history(&NewHistory {
            instance_id: instance.id,
            status_name: "suspended".to_string(),
            size_id: size.id,
            activity: None,
            extra: None,
            start_date: Utc::now(),
            end_date: None,
        })
        .await
        .unwrap();
    assert_eq!(ctx.store.list_open_histories(instance.id).await.unwrap().len(), 2);

    let summary = monitor_instances_for(&monitor, provider, None).await.unwrap();
    assert_eq!(summary.repaired, 1);

    // Exactly one open row remains, reflecting the cloud-reported status.
    let open = ctx.store.list_open_histories(instance.id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, "active");
}

#[tokio::test]
async fn test_instance_with_unresolved_size_gets_placeholder() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    let alice = ctx.create_user("alice").await;
    ctx.create_identity(provider, alice, "alice").await;
    ctx.cloud.add_project(provider, "t-alice", "alice");
    ctx.cloud
        .add_instance(provider, MockSnapshotSource::instance("inst-1", "bastion", "t-alice", "m1.mystery"));

    let monitor = ctx.monitor_ctx();
    let summary = monitor_instances_for(&monitor, provider, None).await.unwrap();
    assert_eq!(summary.seen, 1);

    let unknown = ctx.store.list_unknown_sizes(provider).await.unwrap();
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].alias, "m1.mystery");
}

#[tokio::test]
async fn test_instance_users_filter() {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    let alice = ctx.create_user("alice").await;
    let identity = ctx.create_identity(provider, alice, "alice").await;
    ctx.cloud.add_project(provider, "t-alice", "alice");
    ctx.cloud
        .add_size(provider, MockSnapshotSource::size("m1.small", "m1.small", 1, 2048, 20));
    ctx.cloud
        .add_instance(provider, MockSnapshotSource::instance("inst-1", "bastion", "t-alice", "m1.small"));

    let monitor = ctx.monitor_ctx();
    monitor_sizes_for(&monitor, provider).await.unwrap();
    monitor_instances_for(&monitor, provider, None).await.unwrap();
    ctx.cloud.remove_instance(provider, "inst-1");

    // A pass restricted to another tenant leaves alice alone.
    let summary = monitor_instances_for(&monitor, provider, Some(&["bob".to_string()]))
        .await
        .unwrap();
    assert_eq!(summary.end_dated, 0);
    assert_eq!(
        ctx.store
            .list_active_instances_for_identity(identity)
            .await
            .unwrap()
            .len(),
        1
    );
}
