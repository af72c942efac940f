//! Stream verification tests
//! Drives the verification engine against the local network under delivery faults.
use std::time::{Duration, Instant};
use vigil_integration_tests::integration::{ReportInvariants, TestHarness};
use vigil_worker::{EventKind, HarnessConfig, VerifyError, VerifyOptions, StreamVerificationEngine};

#[tokio::test]
async fn test_no_fault_delivery_is_complete() {
    let harness = TestHarness::with_workers(&["bob", "alice", "fabri", "elon"]).await.unwrap();
    let manager = harness.manager();

    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator().await;
    let report = harness.engine(5).verify_message_stream(&group, &receivers).await.unwrap();

    assert!(report.all_received);
    assert!(report.almost_all_received);
    assert_eq!(report.sent_count, 5);
    assert_eq!(report.expected_receiver_count, 3);
    assert_eq!(report.expected_count, 15);
    assert_eq!(report.received_count, 15);
    assert_eq!(report.reception_percentage, 100.0);
    assert_eq!(report.receivers_in_order, 3);
    assert_eq!(report.order_percentage, 100.0);
    for receiver in ["alice-a", "fabri-a", "elon-a"] {
        assert_eq!(report.received_by(receiver), 5);
        assert_eq!(report.event_timings[receiver].len(), 5);
    }

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_installation_lowers_reception() {
    let harness = TestHarness::with_config(HarnessConfig::default().with_stream_timeout(Duration::from_millis(500)));
    let manager = harness.manager();
    manager.create_workers(&["bob", "alice", "fabri"]).await.unwrap();

    let fabri = harness.worker("fabri").await;
    harness.network().mark_installation_failed(fabri.installation_id()).await;

    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let report = harness
        .engine(4)
        .verify_message_stream(&group, &manager.get_all_but_creator().await)
        .await
        .unwrap();

    assert_eq!(report.received_count, 4);
    assert_eq!(report.expected_count, 8);
    assert_eq!(report.reception_percentage, 50.0);
    assert!(!report.all_received);
    assert!(!report.almost_all_received);
    assert_eq!(report.received_by("fabri-a"), 0);
    assert!(ReportInvariants::check_all(&report, manager.config().high_tolerance).is_empty());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_latency_is_reflected_in_timings() {
    let harness = TestHarness::with_workers(&["bob", "alice"]).await.unwrap();
    let manager = harness.manager();
    harness.network().set_latency(50).await;

    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let report = harness
        .engine(3)
        .verify_message_stream(&group, &manager.get_all_but_creator().await)
        .await
        .unwrap();

    assert!(report.all_received);
    assert!(report.average_event_timing >= Duration::from_millis(50));
    assert!(report.average_event_timing_ms() >= 50);
    assert!(report.event_timings["alice-a"].values().all(|ms| *ms >= 50));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_severed_stream_returns_partial_report() {
    let harness = TestHarness::with_config(HarnessConfig::default().with_stream_timeout(Duration::from_secs(5)));
    let manager = harness.manager();
    manager.create_workers(&["bob", "alice"]).await.unwrap();
    let alice = harness.worker("alice").await;
    let group = manager.create_group_between_all(None, &[]).await.unwrap();

    // Drop the only subscriber after the first probe is out
    let network = harness.network().clone();
    let installation = alice.installation_id().to_string();
    let engine = StreamVerificationEngine::new(
        VerifyOptions::from_config(manager.config())
            .with_count(3)
            .with_send_interval(Duration::from_millis(200)),
    );
    let severer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        network.sever_streams(&installation).await
    });

    let started = Instant::now();
    let report = engine
        .verify_message_stream(&group, std::slice::from_ref(&alice))
        .await
        .unwrap();
    assert_eq!(severer.await.unwrap(), 1);

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.sent_count, 3);
    assert_eq!(report.received_count, 1);
    assert!(alice.active_streams().await.is_empty());

    // The next subscription opens a fresh stream
    alice.start_stream(EventKind::Message).await.unwrap();
    assert_eq!(alice.active_streams().await, vec![EventKind::Message]);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_send_failure_is_fatal() {
    let harness = TestHarness::with_workers(&["bob", "alice"]).await.unwrap();
    let manager = harness.manager();
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator().await;

    // The sending session is gone, so the first send fails
    harness.worker("bob").await.terminate().await.unwrap();
    let result = harness.engine(2).verify_message_stream(&group, &receivers).await;
    assert!(matches!(result, Err(VerifyError::Send { index: 0, .. })));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_terminated_receiver_cannot_subscribe() {
    let harness = TestHarness::with_workers(&["bob", "alice"]).await.unwrap();
    let manager = harness.manager();
    let group = manager.create_group_between_all(None, &[]).await.unwrap();

    let alice = harness.worker("alice").await;
    alice.terminate().await.unwrap();
    let result = harness
        .engine(1)
        .verify_message_stream(&group, std::slice::from_ref(&alice))
        .await;
    assert!(matches!(result, Err(VerifyError::Subscribe { kind: EventKind::Message, .. })));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_inputs_are_rejected() {
    let harness = TestHarness::with_workers(&["bob", "alice"]).await.unwrap();
    let manager = harness.manager();
    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let receivers = manager.get_all_but_creator().await;

    let engine = harness.engine(3);
    assert!(matches!(
        engine.verify_message_stream(&group, &[]).await,
        Err(VerifyError::NoReceivers)
    ));
    assert!(matches!(
        harness.engine(0).verify_message_stream(&group, &receivers).await,
        Err(VerifyError::NoProbes)
    ));
    assert!(matches!(
        engine.verify_add_member_stream(&group, &receivers, &[]).await,
        Err(VerifyError::NoProbes)
    ));

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_installations_of_one_inbox_share_consent_probe() {
    let harness = TestHarness::with_workers(&["bob", "alice", "alice-b"]).await.unwrap();
    let manager = harness.manager();
    let bob = harness.worker("bob").await;

    let report = harness
        .engine(1)
        .verify_consent_stream(&bob, &manager.get_all_but_creator().await)
        .await
        .unwrap();

    // One flip toward alice's inbox, seen by both installations
    assert_eq!(report.sent_count, 1);
    assert_eq!(report.expected_count, 2);
    assert!(report.all_received);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stream_restart_is_idempotent() {
    let harness = TestHarness::with_workers(&["bob"]).await.unwrap();
    let manager = harness.manager();
    let bob = harness.worker("bob").await;

    manager.start_stream(EventKind::Message).await.unwrap();
    manager.start_stream(EventKind::Message).await.unwrap();
    assert_eq!(harness.network().subscriber_count(bob.installation_id()).await, 1);

    assert!(bob.stop_stream(EventKind::Message).await);
    assert!(!bob.stop_stream(EventKind::Message).await);
    bob.stop_streams().await;
    assert!(bob.active_streams().await.is_empty());

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_acting_worker_is_left_out_of_receivers() {
    let harness = TestHarness::with_workers(&["bob", "alice", "fabri"]).await.unwrap();
    let manager = harness.manager();
    let bob = harness.worker("bob").await;
    let alice = harness.worker("alice").await;
    let everyone = manager.get_all().await;

    // The initiator never sees its own new group
    let report = harness
        .engine(1)
        .verify_conversation_stream(&bob, &everyone)
        .await
        .unwrap();
    assert!(report.all_received, "reception was {:.1}%", report.reception_percentage);
    assert_eq!(report.expected_receiver_count, 2);
    assert_eq!(report.received_by("bob-a"), 0);

    // A receiver listed among the senders does not message itself
    let report = harness.engine(2).verify_dm_stream(&everyone, &alice).await.unwrap();
    assert!(report.all_received);
    assert_eq!(report.sent_count, 4);
    assert_eq!(report.expected_count, 4);

    harness.shutdown().await.unwrap();
}
