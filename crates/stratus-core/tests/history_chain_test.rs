// Copyright (C) 2026 Stratus Cloud Services
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status history chain: contiguity, traversal, transition contract.

mod common;

use chrono::{Duration, Utc};
use common::TestContext;
use stratus_core::error::CoreError;
use stratus_core::history;
use stratus_core::persistence::{NewInstance, Persistence, StatusTransition};

struct Fixture {
    ctx: TestContext,
    instance_id: i64,
    size_id: i64,
}

async fn fixture() -> Fixture {
    let ctx = TestContext::new().await;
    let provider = ctx.create_provider("cumulus-east", true, None).await;
    let user = ctx.create_user("alice").await;
    let identity = ctx.create_identity(provider, user, "alice").await;
    let size_id = ctx.create_size(provider, "m1.small", "m1.small").await;

    let (instance, created) = ctx
        .store
        .ensure_instance(
            provider,
            &NewInstance {
                provider_alias: "inst-1".to_string(),
                identity_id: identity,
                status_name: "active".to_string(),
                size_id,
                activity: None,
            },
        )
        .await
        .unwrap();
    assert!(created);

    Fixture {
        ctx,
        instance_id: instance.id,
        size_id,
    }
}

fn transition(
    fx: &Fixture,
    status: &str,
    start_time: chrono::DateTime<Utc>,
    last_history_id: Option<i64>,
) -> StatusTransition {
    StatusTransition {
        instance_id: fx.instance_id,
        status_name: status.to_string(),
        activity: None,
        size_id: fx.size_id,
        extra: None,
        start_time,
        last_history_id,
    }
}

#[tokio::test]
async fn test_chain_stays_contiguous_across_transitions() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    let first = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    let t1 = first.start_date + Duration::seconds(10);
    let t2 = first.start_date + Duration::seconds(25);

    store
        .record_status_transition(&transition(&fx, "suspended", t1, None))
        .await
        .unwrap();
    store
        .record_status_transition(&transition(&fx, "active", t2, None))
        .await
        .unwrap();

    // Walk the chain forward from the first row; every row's end_date must
    // equal the next row's start_date, and the last row must be open.
    let mut row = store
        .find_history_starting_at(fx.instance_id, first.start_date)
        .await
        .unwrap()
        .unwrap();
    let mut seen = vec![row.status.clone()];
    while let Some(following) = history::next(store, &row).await.unwrap() {
        assert_eq!(row.end_date, Some(following.start_date));
        seen.push(following.status.clone());
        row = following;
    }
    assert_eq!(seen, vec!["active", "suspended", "active"]);
    assert!(row.end_date.is_none());

    // And back again.
    let mut back = vec![row.status.clone()];
    while let Some(prior) = history::previous(store, &row).await.unwrap() {
        back.push(prior.status.clone());
        row = prior;
    }
    assert_eq!(back, vec!["active", "suspended", "active"]);
}

#[tokio::test]
async fn test_transition_requires_an_open_row() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    let now = Utc::now();
    store.close_open_histories(fx.instance_id, now).await.unwrap();

    let err = store
        .record_status_transition(&transition(&fx, "suspended", now, None))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::HistoryContractViolation { .. }));

    // Nothing was written: the chain still has exactly one (closed) row.
    let open = store.list_open_histories(fx.instance_id).await.unwrap();
    assert!(open.is_empty());
}

#[tokio::test]
async fn test_transition_rejects_already_closed_last_history() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    let first = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    let t1 = first.start_date + Duration::seconds(10);
    let second = store
        .record_status_transition(&transition(&fx, "suspended", t1, None))
        .await
        .unwrap();

    // Passing the now-closed first row is caller misuse.
    let err = store
        .record_status_transition(&transition(
            &fx,
            "active",
            t1 + Duration::seconds(5),
            Some(first.id),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::HistoryContractViolation { .. }));

    // The open row is untouched.
    let last = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(last.id, second.id);
    assert!(last.end_date.is_none());
}

#[tokio::test]
async fn test_try_transition_passes_success_and_misuse_through() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    let first = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    let t1 = first.start_date + Duration::seconds(10);

    let recorded = history::try_status_transition(store, &transition(&fx, "suspended", t1, None))
        .await
        .unwrap();
    assert_eq!(recorded.unwrap().status, "suspended");

    // Caller misuse is not absorbed.
    let err = history::try_status_transition(
        store,
        &transition(&fx, "active", t1 + Duration::seconds(5), Some(first.id)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CoreError::HistoryContractViolation { .. }));
}

#[tokio::test]
async fn test_previous_signals_boundary_on_first_row() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    let first = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    assert!(history::previous(store, &first).await.unwrap().is_none());
}

#[tokio::test]
async fn test_next_flags_open_row_on_ended_instance() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    // End-date the instance behind the ledger's back, leaving the history
    // row open. That leaks time and must surface as an inconsistency.
    sqlx::query("UPDATE instances SET end_date = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(fx.instance_id)
        .execute(store.pool())
        .await
        .unwrap();

    let open = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    let err = history::next(store, &open).await.unwrap_err();
    assert!(matches!(err, CoreError::HistoryInconsistent { .. }));
}

#[tokio::test]
async fn test_next_signals_boundary_when_closed_at_instance_end() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    let end = Utc::now();
    store
        .end_date_instance_and_history(fx.instance_id, end)
        .await
        .unwrap();

    let last = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    assert_eq!(last.end_date, Some(end));
    assert!(history::next(store, &last).await.unwrap().is_none());
}

#[tokio::test]
async fn test_active_time_for_recorded_rows() {
    let fx = fixture().await;
    let store = &fx.ctx.store;

    let first = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    let t1 = first.start_date + Duration::seconds(10);
    store
        .record_status_transition(&transition(&fx, "suspended", t1, None))
        .await
        .unwrap();

    let names: Vec<String> = history::DEFAULT_ACTIVE_STATUS_NAMES
        .iter()
        .map(|name| name.to_string())
        .collect();

    // Closed active row: exactly its span.
    let first = store
        .find_history_starting_at(fx.instance_id, first.start_date)
        .await
        .unwrap()
        .unwrap();
    let now = t1 + Duration::seconds(100);
    let (duration, _, _) = history::active_time(&first, &names, None, None, now);
    assert_eq!(duration, Duration::seconds(10));

    // Open suspended row: zero, regardless of window.
    let open = store.get_last_history(fx.instance_id).await.unwrap().unwrap();
    let (duration, _, _) = history::active_time(&open, &names, None, None, now);
    assert_eq!(duration, Duration::zero());
}
