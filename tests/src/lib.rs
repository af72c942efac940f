//! Integration tests for the worker harness
//!
//! This module runs the end-to-end scenarios from the integration
//! framework against the in-process local network.


use integration::{ManagerInvariants, ReportInvariants, TestHarness, TestScenarios};
use vigil_worker::EventKind;

#[tokio::test]
async fn test_basic_group_delivery() {
    TestScenarios::basic_group_delivery()
        .await
        .expect("One message should reach the other group member");
}

#[tokio::test]
async fn test_unknown_version_rejected() {
    TestScenarios::unknown_version_rejected()
        .await
        .expect("Unknown versions should fail before a session opens");
}

#[tokio::test]
async fn test_receiver_terminated_mid_drain() {
    TestScenarios::receiver_terminated_mid_drain()
        .await
        .expect("Terminating a receiver should end its wait early");
}

#[tokio::test]
async fn test_throttled_dm_fan_in() {
    TestScenarios::throttled_dm_fan_in()
        .await
        .expect("Throttled fan-in should stay above the tolerance bar");
}

#[tokio::test]
async fn test_mixed_version_group() {
    TestScenarios::mixed_version_group()
        .await
        .expect("Workers on different versions should interoperate");
}

#[tokio::test]
async fn test_all_stream_kinds() {
    TestScenarios::all_stream_kinds()
        .await
        .expect("Every stream kind should verify on a healthy network");
}

#[tokio::test]
async fn test_invariants_on_simple_run() {
    let harness = TestHarness::with_workers(&["bob", "alice", "fabri"]).await.unwrap();
    let manager = harness.manager();

    let violations = ManagerInvariants::check_all(manager).await;
    assert!(violations.is_empty(), "Manager invariants should hold: {:?}", violations);

    let group = manager.create_group_between_all(Some("invariants"), &[]).await.unwrap();
    let report = harness
        .engine(4)
        .verify_message_stream(&group, &manager.get_all_but_creator().await)
        .await
        .unwrap();
    assert_eq!(report.kind, EventKind::Message);

    let violations = ReportInvariants::check_all(&report, manager.config().high_tolerance);
    assert!(violations.is_empty(), "Report invariants should hold: {:?}", violations);

    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_random_drops_keep_invariants() {
    let harness = TestHarness::with_workers(&["bob", "alice", "fabri", "elon"]).await.unwrap();
    let manager = harness.manager();
    harness.network().set_drop_rate(0.3).await;

    let group = manager.create_group_between_all(None, &[]).await.unwrap();
    let report = harness
        .engine(10)
        .verify_message_stream(&group, &manager.get_all_but_creator().await)
        .await
        .unwrap();

    // Whatever was dropped, the report stays self-consistent
    assert!(report.received_count <= 30);
    let violations = ReportInvariants::check_all(&report, manager.config().high_tolerance);
    assert!(violations.is_empty(), "Report invariants should hold: {:?}", violations);

    harness.shutdown().await.unwrap();
}
