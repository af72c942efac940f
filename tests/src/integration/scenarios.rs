use crate::integration::{ManagerInvariants, ReportInvariants, TestHarness};
use std::time::{Duration, Instant};
use vigil_worker::{EventKind, HarnessConfig, VersionError, WorkerError};

type ScenarioResult = Result<(), Box<dyn std::error::Error>>;

fn check_report(report: &vigil_worker::VerificationReport, high_tolerance: f64) -> ScenarioResult {
    let violations = ReportInvariants::check_all(report, high_tolerance);
    if !violations.is_empty() {
        return Err(format!("Report invariant violations: {:?}", violations).into());
    }
    Ok(())
}

/// End-to-end scenarios for worker orchestration and stream verification
pub struct TestScenarios;

impl TestScenarios {
    /// Two workers share a group; one message from the creator reaches the
    /// other exactly once
    pub async fn basic_group_delivery() -> ScenarioResult {
        let harness = TestHarness::with_workers(&["henry", "ivy"]).await?;
        let manager = harness.manager();

        let group = manager.create_group_between_all(None, &[]).await?;
        let receivers = manager.get_all_but_creator().await;
        let report = harness.engine(1).verify_message_stream(&group, &receivers).await?;

        check_report(&report, manager.config().high_tolerance)?;
        if !report.all_received || report.received_count != 1 {
            return Err(format!(
                "Expected exactly one delivered event, got {}/{}",
                report.received_count, report.expected_count
            )
            .into());
        }
        if report.received_by("ivy-a") != 1 {
            return Err("ivy did not observe the message".into());
        }

        harness.shutdown().await?;
        Ok(())
    }

    /// Requesting a tag missing from the catalog fails before any session
    /// is opened
    pub async fn unknown_version_rejected() -> ScenarioResult {
        let harness = TestHarness::new();

        match harness.manager().create_worker("bob", None, Some("9.9.9")).await {
            Err(WorkerError::Version(VersionError::NotFound { tag })) if tag == "9.9.9" => {}
            Err(e) => return Err(format!("Unexpected error: {}", e).into()),
            Ok(worker) => return Err(format!("{} was created on an unknown version", worker.label()).into()),
        }

        if harness.network().open_installation_count().await != 0 {
            return Err("A session was opened for an unknown version".into());
        }
        if !harness.manager().is_empty().await {
            return Err("The failed worker was registered".into());
        }
        Ok(())
    }

    /// A receiver terminated while the engine is still waiting ends its
    /// wait early; the run completes with a partial report well before the
    /// timeout
    pub async fn receiver_terminated_mid_drain() -> ScenarioResult {
        let timeout = Duration::from_secs(5);
        let harness = TestHarness::with_config(HarnessConfig::default().with_stream_timeout(timeout));
        let manager = harness.manager();
        manager.create_workers(&["henry", "ivy", "jack"]).await?;

        let group = manager.create_group_between_all(None, &[]).await?;
        let receivers = manager.get_all_but_creator().await;

        // jack never receives anything, so its drain waits until it is
        // terminated
        let jack = harness.worker("jack").await;
        harness.network().mark_installation_failed(jack.installation_id()).await;
        let terminator = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            jack.terminate().await
        });

        let started = Instant::now();
        let report = harness.engine(3).verify_message_stream(&group, &receivers).await?;
        let elapsed = started.elapsed();
        terminator.await??;

        check_report(&report, manager.config().high_tolerance)?;
        if elapsed >= timeout {
            return Err(format!("Verification took {:?}, past the {:?} timeout", elapsed, timeout).into());
        }
        if report.received_by("ivy-a") != 3 || report.received_by("jack-a") != 0 {
            return Err(format!("Unexpected partial report: {:?}", report.per_receiver_event_timestamps).into());
        }
        if report.all_received || report.received_count != 3 {
            return Err(format!("Expected 3/6 events, got {}/{}", report.received_count, report.expected_count).into());
        }

        harness.shutdown().await?;
        Ok(())
    }

    /// Ten senders each send ten direct messages to one receiver while the
    /// network rejects every twentieth delivery; the run still clears the
    /// tolerance bar
    pub async fn throttled_dm_fan_in() -> ScenarioResult {
        let harness = TestHarness::new();
        let manager = harness.manager();
        let names = vigil_worker::names::fixed_names(11);
        manager.create_workers(&names).await?;

        let receiver = manager.get_creator().await.ok_or("no receiver")?;
        let senders = manager.get_all_but_creator().await;
        harness.network().set_throttle(20).await;

        let report = harness.engine(10).verify_dm_stream(&senders, &receiver).await?;
        check_report(&report, manager.config().high_tolerance)?;

        if report.sent_count != 100 || report.expected_count != 100 {
            return Err(format!("Expected 100 probes, sent {}", report.sent_count).into());
        }
        if report.reception_percentage < 90.0 || !report.almost_all_received {
            return Err(format!("Reception {:.1}% is below the bar", report.reception_percentage).into());
        }
        if report.all_received {
            return Err("Throttling dropped nothing".into());
        }

        harness.shutdown().await?;
        Ok(())
    }

    /// Workers on different versions share a group and still observe each
    /// other's messages
    pub async fn mixed_version_group() -> ScenarioResult {
        let harness = TestHarness::new();
        let manager = harness.manager();
        manager
            .create_workers(&["henry-a-4.5.0", "ivy-a-4.2.6", "jack-a-4.2.3", "karen-a-1.5.0"])
            .await?;

        let versions: Vec<String> = manager
            .get_all()
            .await
            .iter()
            .map(|w| w.version().tag().to_string())
            .collect();
        if versions != ["4.5.0", "4.2.6", "4.2.3", "4.1.0"] {
            return Err(format!("Unexpected versions: {:?}", versions).into());
        }

        let group = manager.create_group_between_all(None, &[]).await?;
        let report = harness
            .engine(5)
            .verify_message_stream(&group, &manager.get_all_but_creator().await)
            .await?;
        check_report(&report, manager.config().high_tolerance)?;
        if !report.all_received {
            return Err(format!("Mixed versions lost events: {:.1}%", report.reception_percentage).into());
        }

        let violations = ManagerInvariants::check_all(manager).await;
        if !violations.is_empty() {
            return Err(format!("Manager invariant violations: {:?}", violations).into());
        }

        harness.shutdown().await?;
        Ok(())
    }

    /// Every verification variant clears the bar on a healthy network
    pub async fn all_stream_kinds() -> ScenarioResult {
        let harness = TestHarness::with_workers(&["henry", "ivy", "jack", "karen"]).await?;
        let manager = harness.manager();
        let tolerance = manager.config().high_tolerance;
        let engine = harness.engine(3);

        let creator = manager.get_creator().await.ok_or("no creator")?;
        let karen = harness.worker("karen").await;
        let members: Vec<_> = manager.get_all_but("karen").await;
        let receivers: Vec<_> = members
            .iter()
            .filter(|w| w.name() != creator.name())
            .cloned()
            .collect();

        // Group without karen, so she can be added and removed
        let group = creator
            .session()
            .new_group(&receivers.iter().map(|w| w.inbox_id().to_string()).collect::<Vec<_>>(), None)
            .await?;

        let mut reports = vec![
            engine.verify_message_stream(&group, &receivers).await?,
            engine.verify_metadata_stream(&group, &receivers).await?,
            engine
                .verify_add_member_stream(&group, &receivers, &[karen.inbox_id().to_string()])
                .await?,
            engine
                .verify_remove_member_stream(&group, &receivers, &[karen.inbox_id().to_string()])
                .await?,
            engine.verify_conversation_stream(&creator, &receivers).await?,
            engine.verify_consent_stream(&creator, &receivers).await?,
            engine.verify_group_consent_stream(&group, &receivers).await?,
            engine.verify_dm_stream(&receivers, &creator).await?,
        ];
        reports.push(
            engine
                .verify_new_conversation_stream(&group, std::slice::from_ref(&karen))
                .await?,
        );

        let kinds: Vec<EventKind> = reports.iter().map(|r| r.kind).collect();
        for report in &reports {
            check_report(report, tolerance)?;
            if !report.all_received {
                return Err(format!(
                    "{} verification received {}/{}",
                    report.kind, report.received_count, report.expected_count
                )
                .into());
            }
        }
        if kinds.iter().filter(|k| **k == EventKind::Consent).count() != 2 {
            return Err(format!("Unexpected report kinds: {:?}", kinds).into());
        }

        harness.shutdown().await?;
        Ok(())
    }
}
