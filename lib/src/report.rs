use crate::events::EventKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One matched event as seen by a receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub probe_index: usize,
    /// Wall-clock arrival, milliseconds since the Unix epoch.
    pub arrived_at_ms: u64,
    /// Time from the probe being sent until this receiver matched it.
    pub latency: Duration,
}

/// Everything one receiver observed during a verification run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverOutcome {
    pub receiver: String,
    /// Probe indices this receiver should see, in send order.
    pub expected: Vec<usize>,
    /// Matched probes in arrival order.
    pub arrivals: Vec<Arrival>,
}

impl ReceiverOutcome {
    /// A receiver is in order when it saw every expected probe, and saw them
    /// in the order they were sent.
    pub fn in_order(&self) -> bool {
        self.arrivals.len() == self.expected.len()
            && self
                .arrivals
                .iter()
                .zip(self.expected.iter())
                .all(|(arrival, expected)| arrival.probe_index == *expected)
    }
}

/// Result of a single stream verification run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VerificationReport {
    pub kind: EventKind,

    /// Number of receivers under observation.
    pub expected_receiver_count: usize,

    /// Number of probes the trigger sent.
    pub sent_count: usize,

    /// Sum over receivers of the probes each one should observe.
    pub expected_count: usize,

    /// Matched probe events across all receivers.
    pub received_count: usize,

    pub reception_percentage: f64,
    pub all_received: bool,
    pub almost_all_received: bool,

    /// Share of receivers that saw every probe in send order.
    pub order_percentage: f64,
    pub receivers_in_order: usize,

    /// Mean send-to-match latency over all matched events.
    #[serde(with = "humantime_serde")]
    pub average_event_timing: Duration,

    /// Receiver label to arrival timestamps (ms since epoch).
    pub per_receiver_event_timestamps: BTreeMap<String, Vec<u64>>,

    /// Receiver label to (probe index to latency in ms).
    pub event_timings: BTreeMap<String, BTreeMap<usize, u64>>,
}

impl VerificationReport {
    pub fn from_outcomes(
        kind: EventKind,
        sent_count: usize,
        outcomes: &[ReceiverOutcome],
        high_tolerance: f64,
    ) -> Self {
        let expected_count: usize = outcomes.iter().map(|o| o.expected.len()).sum();
        let received_count: usize = outcomes.iter().map(|o| o.arrivals.len()).sum();

        let reception_percentage = percentage(received_count, expected_count);
        let receivers_in_order = outcomes.iter().filter(|o| o.in_order()).count();

        let mut total_latency = Duration::ZERO;
        let mut per_receiver_event_timestamps = BTreeMap::new();
        let mut event_timings = BTreeMap::new();
        for outcome in outcomes {
            let timestamps: Vec<u64> = outcome.arrivals.iter().map(|a| a.arrived_at_ms).collect();
            let timings: BTreeMap<usize, u64> = outcome
                .arrivals
                .iter()
                .map(|a| (a.probe_index, a.latency.as_millis() as u64))
                .collect();
            total_latency += outcome.arrivals.iter().map(|a| a.latency).sum::<Duration>();

            per_receiver_event_timestamps.insert(outcome.receiver.clone(), timestamps);
            event_timings.insert(outcome.receiver.clone(), timings);
        }

        let average_event_timing = if received_count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((total_latency.as_nanos() / received_count as u128) as u64)
        };

        Self {
            kind,
            expected_receiver_count: outcomes.len(),
            sent_count,
            expected_count,
            received_count,
            reception_percentage,
            all_received: expected_count > 0 && received_count == expected_count,
            almost_all_received: expected_count > 0 && reception_percentage >= high_tolerance,
            order_percentage: percentage(receivers_in_order, outcomes.len()),
            receivers_in_order,
            average_event_timing,
            per_receiver_event_timestamps,
            event_timings,
        }
    }

    pub fn average_event_timing_ms(&self) -> u64 {
        self.average_event_timing.as_millis() as u64
    }

    /// Matched events for one receiver label, zero when the label is unknown.
    pub fn received_by(&self, receiver: &str) -> usize {
        self.per_receiver_event_timestamps
            .get(receiver)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
