//! Postgres store tests.
//!
//! Run with `--features postgres-tests` against a database named by
//! `DATABASE_URL`. Each test gets a fresh migrated database.

#![cfg(feature = "postgres-tests")]
// Test code is allowed to use expect/unwrap for assertions
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

use chrono::Utc;
use common::types::{CreatorId, FanId, JobId, SessionId, TenantId};
use session_controller::models::{
    ForwardStatus, JobStatus, NewJob, NewSession, SessionStatus, UsageEvent, UsageMetric,
};
use session_controller::repositories::PgStore;
use session_controller::store::{
    AccountDirectory, JobQueue, LeaseOutcome, MinutesOutcome, SessionStore, StoreHealth,
    TransitionOutcome, UsageLedger,
};
use sqlx::PgPool;
use std::time::Duration;

async fn seed_creator(pool: &PgPool, tenant_id: TenantId) -> CreatorId {
    let creator_id = CreatorId::new();
    sqlx::query("INSERT INTO creators (creator_id, tenant_id, display_name) VALUES ($1, $2, $3)")
        .bind(creator_id.0)
        .bind(tenant_id.0)
        .bind("Test Persona")
        .execute(pool)
        .await
        .unwrap();
    creator_id
}

async fn seed_session(store: &PgStore) -> (SessionId, TenantId) {
    let tenant_id = TenantId::new();
    let creator_id = seed_creator(store.pool(), tenant_id).await;
    let id = SessionId::new();
    store
        .insert_session(NewSession {
            id,
            tenant_id,
            creator_id,
            fan_id: FanId::new(),
            room_id: format!("session-{}", id.0.simple()),
            billing_customer_ref: "cus_test".to_string(),
            metadata: serde_json::json!({ "topic": "pg" }),
        })
        .await
        .unwrap();
    (id, tenant_id)
}

fn event(session_id: SessionId, tenant_id: TenantId, quantity: f64) -> UsageEvent {
    UsageEvent {
        session_id,
        tenant_id,
        customer_ref: "cus_test".to_string(),
        metric: UsageMetric::Minutes,
        meter_event: "live_minutes".to_string(),
        quantity,
        recorded_at: Utc::now(),
    }
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_ping(pool: PgPool) {
    PgStore::new(pool).ping().await.unwrap();
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_creator_and_billing_customer(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId::new();
    let creator_id = seed_creator(store.pool(), tenant_id).await;

    let creator = store.find_creator(creator_id).await.unwrap().unwrap();
    assert_eq!(creator.tenant_id, tenant_id);
    assert!(store.find_creator(CreatorId::new()).await.unwrap().is_none());

    let fan_id = FanId::new();
    assert!(store
        .billing_customer_for(tenant_id, fan_id)
        .await
        .unwrap()
        .is_none());
    store
        .set_billing_customer(tenant_id, fan_id, "cus_123")
        .await
        .unwrap();
    assert_eq!(
        store
            .billing_customer_for(tenant_id, fan_id)
            .await
            .unwrap()
            .as_deref(),
        Some("cus_123")
    );
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_minutes_activate_and_accumulate(pool: PgPool) {
    let store = PgStore::new(pool);
    let (id, _) = seed_session(&store).await;

    match store.add_minutes(id, 2.5).await.unwrap() {
        MinutesOutcome::Applied { session, activated } => {
            assert!(activated);
            assert_eq!(session.status, SessionStatus::Active);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    match store.add_minutes(id, 1.0).await.unwrap() {
        MinutesOutcome::Applied { session, activated } => {
            assert!(!activated);
            assert!((session.minutes_consumed - 3.5).abs() < f64::EPSILON);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(matches!(
        store.add_minutes(SessionId::new(), 1.0).await.unwrap(),
        MinutesOutcome::NotFound
    ));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_transition_is_compare_and_set(pool: PgPool) {
    let store = PgStore::new(pool);
    let (id, _) = seed_session(&store).await;
    store.add_minutes(id, 1.0).await.unwrap();

    let sources = SessionStatus::sources_of(SessionStatus::Ended);
    let first = store
        .transition(id, sources, SessionStatus::Ended, Some(Utc::now()))
        .await
        .unwrap();
    assert!(matches!(first, TransitionOutcome::Applied(_)));

    let second = store
        .transition(id, sources, SessionStatus::Ended, Some(Utc::now()))
        .await
        .unwrap();
    assert!(matches!(
        second,
        TransitionOutcome::Rejected(SessionStatus::Ended)
    ));

    assert!(matches!(
        store.add_minutes(id, 1.0).await.unwrap(),
        MinutesOutcome::Terminal(SessionStatus::Ended)
    ));
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_ledger_append_and_forward_state(pool: PgPool) {
    let store = PgStore::new(pool);
    let (id, tenant_id) = seed_session(&store).await;

    let first = store.append(&event(id, tenant_id, 1.0)).await.unwrap();
    let second = store.append(&event(id, tenant_id, 2.0)).await.unwrap();
    assert_eq!(first.forward_status, ForwardStatus::Pending);

    store.mark_forwarded(first.id).await.unwrap();
    store
        .mark_forward_failed(second.id, "processor down")
        .await
        .unwrap();

    let records = store.list_for_session(id).await.unwrap();
    let quantities: Vec<f64> = records.iter().map(|r| r.quantity).collect();
    assert_eq!(quantities, vec![1.0, 2.0]);
    assert_eq!(records[0].forward_status, ForwardStatus::Forwarded);
    assert_eq!(records[1].forward_error.as_deref(), Some("processor down"));

    let failed = store
        .list_by_forward_status(ForwardStatus::Failed, 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, second.id);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_ledger_rows_cannot_be_deleted(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let (id, tenant_id) = seed_session(&store).await;
    store.append(&event(id, tenant_id, 1.0)).await.unwrap();

    let result = sqlx::query("DELETE FROM usage_records WHERE session_id = $1")
        .bind(id.0)
        .execute(&pool)
        .await;
    assert!(result.is_err());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_job_claim_retry_and_exhaust(pool: PgPool) {
    let store = PgStore::new(pool);
    let job_id = store
        .enqueue(NewJob {
            kind: "agent-start".to_string(),
            payload: serde_json::json!({ "room_id": "session-x" }),
            max_attempts: 2,
        })
        .await
        .unwrap();

    let lease = Duration::from_secs(30);
    let claimed = store.claim_next(lease).await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.status, JobStatus::Running);
    assert!(store.claim_next(lease).await.unwrap().is_none());

    let outcome = store
        .schedule_retry(job_id, claimed.attempts, "launcher down", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome, LeaseOutcome::Recorded);
    let reclaimed = store.claim_next(lease).await.unwrap().unwrap();
    assert_eq!(reclaimed.attempts, 2);

    store
        .mark_exhausted(job_id, reclaimed.attempts, "launcher down")
        .await
        .unwrap();
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Exhausted);
    assert_eq!(job.last_error.as_deref(), Some("launcher down"));
    assert!(store.claim_next(lease).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_stale_claim_cannot_overwrite_outcome(pool: PgPool) {
    let store = PgStore::new(pool);
    let job_id = store
        .enqueue(NewJob {
            kind: "agent-start".to_string(),
            payload: serde_json::json!({ "room_id": "session-x" }),
            max_attempts: 3,
        })
        .await
        .unwrap();

    let stale = store.claim_next(Duration::ZERO).await.unwrap().unwrap();
    let fresh = store
        .claim_next(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.attempts, stale.attempts + 1);
    assert_eq!(
        store.mark_succeeded(job_id, fresh.attempts).await.unwrap(),
        LeaseOutcome::Recorded
    );

    assert_eq!(
        store
            .schedule_retry(job_id, stale.attempts, "launcher down", Duration::ZERO)
            .await
            .unwrap(),
        LeaseOutcome::Lost
    );
    assert_eq!(
        store
            .mark_exhausted(job_id, stale.attempts, "launcher down")
            .await
            .unwrap(),
        LeaseOutcome::Lost
    );

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.last_error.is_none());

    let missing = store.mark_succeeded(JobId::new(), 1).await;
    assert!(missing.is_err());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_minutes_are_not_lost(pool: PgPool) {
    let store = PgStore::new(pool);
    let (id, _) = seed_session(&store).await;

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.add_minutes(id, 0.25).await.unwrap() })
        })
        .collect();
    let mut activations = 0;
    for task in tasks {
        match task.await.unwrap() {
            MinutesOutcome::Applied { activated, .. } => {
                if activated {
                    activations += 1;
                }
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    let session = store.get_session(id).await.unwrap().unwrap();
    assert!((session.minutes_consumed - 5.0).abs() < f64::EPSILON);
    assert_eq!(activations, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_minutes_racing_end_stop_at_transition(pool: PgPool) {
    let store = PgStore::new(pool);
    let (id, _) = seed_session(&store).await;
    store.add_minutes(id, 0.25).await.unwrap();

    let increments: Vec<_> = (0..20)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.add_minutes(id, 0.25).await.unwrap() })
        })
        .collect();
    let ender = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .transition(
                    id,
                    SessionStatus::sources_of(SessionStatus::Ended),
                    SessionStatus::Ended,
                    Some(Utc::now()),
                )
                .await
                .unwrap()
        })
    };

    let mut applied = 1u32;
    for task in increments {
        match task.await.unwrap() {
            MinutesOutcome::Applied { .. } => applied += 1,
            MinutesOutcome::Terminal(status) => assert_eq!(status, SessionStatus::Ended),
            MinutesOutcome::NotFound => panic!("session vanished"),
        }
    }
    let ended = match ender.await.unwrap() {
        TransitionOutcome::Applied(session) => session,
        other => panic!("unexpected outcome: {other:?}"),
    };

    // Every applied increment landed before the end, none after.
    let expected = f64::from(applied) * 0.25;
    assert!((ended.minutes_consumed - expected).abs() < f64::EPSILON);
    let session = store.get_session(id).await.unwrap().unwrap();
    assert!((session.minutes_consumed - expected).abs() < f64::EPSILON);
    assert!(matches!(
        store.add_minutes(id, 0.25).await.unwrap(),
        MinutesOutcome::Terminal(SessionStatus::Ended)
    ));
}
