//! Usage reconciliation integration tests.
//!
//! Heartbeats and terminations go through `SessionManager`; the assertions
//! look at the ledger and at what reached the billing mock.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use sc_test_utils::TestHarness;
use session_controller::models::{ForwardStatus, SessionStatus};
use session_controller::services::billing_gateway::mock::MockBillingGateway;
use session_controller::store::UsageLedger;
use std::time::Duration;

#[tokio::test]
async fn test_forwarded_usage_matches_ledger() {
    let mut harness = TestHarness::builder().build();
    let seed = harness.seed().await;
    let started = harness
        .manager
        .start_session(seed.start_request())
        .await
        .unwrap();

    harness
        .manager
        .heartbeat(started.session_id, 2.0, None)
        .await
        .unwrap();
    harness.manager.terminate(started.session_id).await.unwrap();
    harness.drain().await;

    let ledger = harness.ledger(started.session_id).await;
    let recorded = harness.billing.recorded_usage().await;
    assert_eq!(ledger.len(), 2);
    assert_eq!(recorded.len(), 2);

    for (record, forwarded) in ledger.iter().zip(&recorded) {
        assert_eq!(forwarded.idempotency_key, record.id.to_string());
        assert_eq!(forwarded.meter_event, record.meter_event);
        assert_eq!(forwarded.customer_ref, record.customer_ref);
        assert!((forwarded.quantity - record.quantity).abs() < f64::EPSILON);
        assert_eq!(record.forward_status, ForwardStatus::Forwarded);
        assert!(record.forwarded_at.is_some());
    }
}

#[tokio::test]
async fn test_billing_outage_leaves_ledger_intact() {
    let mut harness = TestHarness::builder()
        .billing(MockBillingGateway::failing_record_usage())
        .build();
    let seed = harness.seed().await;
    let started = harness
        .manager
        .start_session(seed.start_request())
        .await
        .unwrap();

    harness
        .manager
        .heartbeat(started.session_id, 1.0, None)
        .await
        .unwrap();
    harness
        .manager
        .heartbeat(started.session_id, 0.5, None)
        .await
        .unwrap();
    let view = harness.manager.terminate(started.session_id).await.unwrap();
    assert_eq!(view.status, SessionStatus::Ended);

    harness.drain().await;

    let ledger = harness.ledger(started.session_id).await;
    assert_eq!(ledger.len(), 3);
    assert!(ledger
        .iter()
        .all(|r| r.forward_status == ForwardStatus::Failed && r.forward_error.is_some()));
    assert_eq!(harness.billing.usage_attempts(), 3);

    let failed = harness
        .store
        .list_by_forward_status(ForwardStatus::Failed, 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 3);
}

#[tokio::test]
async fn test_billing_recovery_forwards_later_events() {
    let mut harness = TestHarness::builder().build();
    let seed = harness.seed().await;
    let started = harness
        .manager
        .start_session(seed.start_request())
        .await
        .unwrap();

    harness.billing.set_fail_record_usage(true);
    harness
        .manager
        .heartbeat(started.session_id, 1.0, None)
        .await
        .unwrap();
    harness.wait_for_usage(started.session_id, 1).await;

    harness.billing.set_fail_record_usage(false);
    harness
        .manager
        .heartbeat(started.session_id, 1.0, None)
        .await
        .unwrap();
    harness.drain().await;

    let statuses: Vec<ForwardStatus> = harness
        .ledger(started.session_id)
        .await
        .iter()
        .map(|r| r.forward_status)
        .collect();
    assert_eq!(statuses, vec![ForwardStatus::Failed, ForwardStatus::Forwarded]);
}

#[tokio::test]
async fn test_slow_billing_does_not_delay_heartbeats() {
    let mut harness = TestHarness::builder()
        .billing(MockBillingGateway::with_record_delay(Duration::from_millis(200)))
        .build();
    let seed = harness.seed().await;
    let started = harness
        .manager
        .start_session(seed.start_request())
        .await
        .unwrap();

    let begin = std::time::Instant::now();
    for _ in 0..5 {
        harness
            .manager
            .heartbeat(started.session_id, 1.0, None)
            .await
            .unwrap();
    }
    assert!(begin.elapsed() < Duration::from_millis(200));

    harness.drain().await;
    assert_eq!(harness.billing.recorded_usage().await.len(), 5);
}

#[tokio::test]
async fn test_sessions_on_many_shards_each_stay_ordered() {
    let mut harness = TestHarness::builder().reconciler_shards(4).build();
    let seed = harness.seed().await;

    let mut sessions = Vec::new();
    for _ in 0..6 {
        let started = harness
            .manager
            .start_session(seed.start_request())
            .await
            .unwrap();
        sessions.push(started.session_id);
    }

    for step in 1..=4 {
        for session_id in &sessions {
            harness
                .manager
                .heartbeat(*session_id, f64::from(step), None)
                .await
                .unwrap();
        }
    }
    harness.drain().await;

    for session_id in sessions {
        let quantities: Vec<f64> = harness
            .ledger(session_id)
            .await
            .iter()
            .map(|r| r.quantity)
            .collect();
        assert_eq!(quantities, vec![1.0, 2.0, 3.0, 4.0]);
    }
}

#[tokio::test]
async fn test_ledger_blip_is_retried_before_billing() {
    let mut harness = TestHarness::builder().build();
    let seed = harness.seed().await;
    let started = harness
        .manager
        .start_session(seed.start_request())
        .await
        .unwrap();

    harness.store.fail_next_ledger_appends(2);
    harness
        .manager
        .heartbeat(started.session_id, 2.0, None)
        .await
        .unwrap();
    harness
        .manager
        .heartbeat(started.session_id, 1.0, None)
        .await
        .unwrap();
    harness.wait_for_usage(started.session_id, 2).await;

    let ledger = harness.ledger(started.session_id).await;
    let quantities: Vec<f64> = ledger.iter().map(|r| r.quantity).collect();
    assert_eq!(quantities, vec![2.0, 1.0]);

    harness.drain().await;
    let billed: Vec<f64> = harness
        .billing
        .recorded_usage()
        .await
        .iter()
        .map(|u| u.quantity)
        .collect();
    assert_eq!(billed, vec![2.0, 1.0]);
}

#[tokio::test]
async fn test_ledger_outage_keeps_session_counter() {
    let mut harness = TestHarness::builder().build();
    let seed = harness.seed().await;
    let started = harness
        .manager
        .start_session(seed.start_request())
        .await
        .unwrap();

    harness.store.fail_ledger_appends(true);
    harness
        .manager
        .heartbeat(started.session_id, 2.0, None)
        .await
        .unwrap();
    harness.drain().await;

    // Retries ran out. The counter still moved; only the ledger entry is missing.
    let view = harness.manager.get_session(started.session_id).await.unwrap();
    assert!((view.minutes_consumed - 2.0).abs() < f64::EPSILON);
    assert!(harness.ledger(started.session_id).await.is_empty());
    assert_eq!(harness.billing.usage_attempts(), 0);
}
