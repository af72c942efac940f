use std::collections::HashSet;
use vigil_worker::{VerificationReport, WorkerManager};

/// Properties every verification report must satisfy, whatever the
/// delivery conditions were.
pub struct ReportInvariants;

/// Properties of a manager's registered workers.
pub struct ManagerInvariants;

#[derive(Debug)]
pub struct InvariantViolation {
    pub name: String,
    pub description: String,
    pub affected_workers: Vec<String>,
}

fn violation(name: &str, description: String, affected_workers: Vec<String>) -> InvariantViolation {
    InvariantViolation {
        name: name.to_string(),
        description,
        affected_workers,
    }
}

impl ReportInvariants {
    /// Check all report invariants against `high_tolerance`
    pub fn check_all(report: &VerificationReport, high_tolerance: f64) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        violations.extend(Self::check_bounds(report));
        violations.extend(Self::check_flags(report, high_tolerance));
        violations.extend(Self::check_timings(report));

        violations
    }

    /// Received counts never exceed what was expected, and percentages stay
    /// within 0..=100
    pub fn check_bounds(report: &VerificationReport) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        if report.received_count > report.expected_count {
            violations.push(violation(
                "Reception Bound",
                format!(
                    "{} events received but only {} expected",
                    report.received_count, report.expected_count
                ),
                Vec::new(),
            ));
        }
        if report.expected_count > report.sent_count * report.expected_receiver_count {
            violations.push(violation(
                "Expectation Bound",
                format!(
                    "{} events expected from {} sends to {} receivers",
                    report.expected_count, report.sent_count, report.expected_receiver_count
                ),
                Vec::new(),
            ));
        }
        for (name, value) in [
            ("Reception Percentage", report.reception_percentage),
            ("Order Percentage", report.order_percentage),
        ] {
            if !(0.0..=100.0).contains(&value) {
                violations.push(violation(name, format!("{} is outside 0..=100", value), Vec::new()));
            }
        }
        if report.receivers_in_order > report.expected_receiver_count {
            violations.push(violation(
                "Order Bound",
                format!(
                    "{} receivers in order out of {}",
                    report.receivers_in_order, report.expected_receiver_count
                ),
                Vec::new(),
            ));
        }

        violations
    }

    /// The summary flags agree with the reception percentage
    pub fn check_flags(report: &VerificationReport, high_tolerance: f64) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        let complete = report.expected_count > 0 && report.received_count == report.expected_count;
        if report.all_received != complete {
            violations.push(violation(
                "All Received Flag",
                format!(
                    "all_received is {} with {}/{} events",
                    report.all_received, report.received_count, report.expected_count
                ),
                Vec::new(),
            ));
        }

        let almost = report.expected_count > 0 && report.reception_percentage >= high_tolerance;
        if report.almost_all_received != almost {
            violations.push(violation(
                "Almost All Received Flag",
                format!(
                    "almost_all_received is {} at {:.1}% with tolerance {:.1}%",
                    report.almost_all_received, report.reception_percentage, high_tolerance
                ),
                Vec::new(),
            ));
        }
        if report.all_received && !report.almost_all_received {
            violations.push(violation(
                "Flag Ordering",
                "all_received holds but almost_all_received does not".to_string(),
                Vec::new(),
            ));
        }

        violations
    }

    /// Every received event has exactly one arrival timestamp and one
    /// latency entry, per receiver
    pub fn check_timings(report: &VerificationReport) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        let timestamps: usize = report.per_receiver_event_timestamps.values().map(Vec::len).sum();
        let latencies: usize = report.event_timings.values().map(|t| t.len()).sum();
        if timestamps != report.received_count || latencies != report.received_count {
            violations.push(violation(
                "Timing Coverage",
                format!(
                    "{} timestamps and {} latencies for {} received events",
                    timestamps, latencies, report.received_count
                ),
                Vec::new(),
            ));
        }

        for (receiver, arrivals) in &report.per_receiver_event_timestamps {
            if arrivals.windows(2).any(|pair| pair[0] > pair[1]) {
                violations.push(violation(
                    "Arrival Order",
                    format!("{} has arrival timestamps out of order", receiver),
                    vec![receiver.clone()],
                ));
            }
        }

        violations
    }
}

impl ManagerInvariants {
    pub async fn check_all(manager: &WorkerManager) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        violations.extend(Self::check_unique_keys(manager).await);
        violations.extend(Self::check_exclusive_state(manager).await);
        violations.extend(Self::check_live_workers(manager).await);
        violations.extend(Self::check_shared_identity(manager).await);

        violations
    }

    /// No two registered workers share a name and installation
    pub async fn check_unique_keys(manager: &WorkerManager) -> Vec<InvariantViolation> {
        let mut seen = HashSet::new();
        manager
            .get_all()
            .await
            .iter()
            .filter(|w| !seen.insert(w.key().clone()))
            .map(|w| violation("Unique Keys", format!("{} is registered twice", w.label()), vec![w.label()]))
            .collect()
    }

    /// No two registered workers point at the same state path
    pub async fn check_exclusive_state(manager: &WorkerManager) -> Vec<InvariantViolation> {
        let mut seen = HashSet::new();
        manager
            .get_all()
            .await
            .iter()
            .filter(|w| !seen.insert(w.state_path().to_path_buf()))
            .map(|w| {
                violation(
                    "Exclusive State",
                    format!("{} shares state path {}", w.label(), w.state_path().display()),
                    vec![w.label()],
                )
            })
            .collect()
    }

    /// Terminated workers are never left registered
    pub async fn check_live_workers(manager: &WorkerManager) -> Vec<InvariantViolation> {
        manager
            .get_all()
            .await
            .iter()
            .filter(|w| w.is_terminated())
            .map(|w| violation("Live Workers", format!("{} is terminated but registered", w.label()), vec![w.label()]))
            .collect()
    }

    /// Installations of one logical name share an inbox; different names
    /// never do
    pub async fn check_shared_identity(manager: &WorkerManager) -> Vec<InvariantViolation> {
        let workers = manager.get_all().await;
        let mut violations = Vec::new();

        for (i, a) in workers.iter().enumerate() {
            for b in workers.iter().skip(i + 1) {
                let same_name = a.name() == b.name();
                let same_inbox = a.inbox_id() == b.inbox_id();
                if same_name != same_inbox {
                    violations.push(violation(
                        "Shared Identity",
                        format!(
                            "{} and {} {} an inbox",
                            a.label(),
                            b.label(),
                            if same_inbox { "share" } else { "do not share" }
                        ),
                        vec![a.label(), b.label()],
                    ));
                }
            }
        }

        violations
    }
}
