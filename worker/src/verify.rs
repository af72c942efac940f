//! Stream verification: subscribe receivers, fire a known set of probes,
//! and measure which receivers observed which probes, in what order and
//! how quickly.

use crate::config::{HarnessConfig, DEFAULT_HIGH_TOLERANCE, DEFAULT_STREAM_TIMEOUT};
use crate::error::VerifyError;
use crate::protocol::Conversation;
use crate::worker::{Next, StreamSubscription, Worker};
use futures::future::try_join_all;
use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use vigil_lib::events::{member_set_key, ConsentEntity, EventKind, InboxId, StreamEvent, GROUP_NAME_FIELD};
use vigil_lib::report::{Arrival, ReceiverOutcome, VerificationReport};

// Upper bound on a drain's wait before the trigger has finished sending;
// the trigger itself is bounded by the verification timeout.
const PRE_SEND_WAIT: Duration = Duration::from_secs(3600);

type Matcher = dyn Fn(&StreamEvent) -> Option<String> + Send + Sync;

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Probes per sender.
    pub count: usize,
    /// Bounds the send phase and then the wait after the last send.
    pub timeout: Duration,
    pub high_tolerance: f64,
    pub prefix: String,
    /// Pause between consecutive probes of one sender.
    pub send_interval: Duration,
    /// Pause between subscribing and the first send.
    pub cold_start: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            count: 1,
            timeout: DEFAULT_STREAM_TIMEOUT,
            high_tolerance: DEFAULT_HIGH_TOLERANCE,
            prefix: "gm".to_string(),
            send_interval: Duration::ZERO,
            cold_start: Duration::ZERO,
        }
    }
}

impl VerifyOptions {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            timeout: config.stream_timeout,
            high_tolerance: config.high_tolerance,
            ..Self::default()
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_high_tolerance(mut self, tolerance: f64) -> Self {
        self.high_tolerance = tolerance.clamp(0.0, 100.0);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_cold_start(mut self, cold_start: Duration) -> Self {
        self.cold_start = cold_start;
        self
    }
}

/// Membership mutation checked by [`StreamVerificationEngine::verify_membership_stream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(Vec<InboxId>),
    Remove(Vec<InboxId>),
}

/// Send instants per probe index, shared with the trigger.
#[derive(Clone, Default)]
struct SendClock {
    sent: Arc<Mutex<HashMap<usize, Instant>>>,
}

impl SendClock {
    async fn mark(&self, index: usize) {
        self.sent.lock().await.insert(index, Instant::now());
    }

    async fn snapshot(&self) -> HashMap<usize, Instant> {
        self.sent.lock().await.clone()
    }
}

struct Plan {
    kind: EventKind,
    receivers: Vec<Arc<Worker>>,
    /// Probe index to match key
    keys: Vec<String>,
    /// Per receiver, the probe indices it should see in send order
    expected: Vec<Vec<usize>>,
}

impl Plan {
    /// Every receiver expects every probe.
    fn broadcast(kind: EventKind, receivers: &[Arc<Worker>], keys: Vec<String>) -> Self {
        let all: Vec<usize> = (0..keys.len()).collect();
        Self {
            kind,
            receivers: receivers.to_vec(),
            expected: vec![all; receivers.len()],
            keys,
        }
    }

    /// One probe per distinct receiver inbox, keyed by `key_of(inbox)`.
    /// Installations sharing an inbox share its probe.
    fn per_inbox(kind: EventKind, receivers: &[Arc<Worker>], key_of: impl Fn(&str) -> String) -> (Self, Vec<InboxId>) {
        let mut inboxes: Vec<InboxId> = Vec::new();
        let mut expected = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let index = match inboxes.iter().position(|i| i == receiver.inbox_id()) {
                Some(index) => index,
                None => {
                    inboxes.push(receiver.inbox_id().to_string());
                    inboxes.len() - 1
                }
            };
            expected.push(vec![index]);
        }

        let plan = Self {
            kind,
            receivers: receivers.to_vec(),
            keys: inboxes.iter().map(|i| key_of(i)).collect(),
            expected,
        };
        (plan, inboxes)
    }
}

struct Matched {
    probe_index: usize,
    at: Instant,
    wall_ms: u64,
}

pub struct StreamVerificationEngine {
    options: VerifyOptions,
}

impl Default for StreamVerificationEngine {
    fn default() -> Self {
        Self::new(VerifyOptions::default())
    }
}

impl StreamVerificationEngine {
    pub fn new(options: VerifyOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &VerifyOptions {
        &self.options
    }

    /// `count` messages into `conversation`, observed by every receiver.
    /// The sending installation never sees its own messages, so it must not
    /// be among `receivers`.
    pub async fn verify_message_stream(
        &self,
        conversation: &Arc<dyn Conversation>,
        receivers: &[Arc<Worker>],
    ) -> Result<VerificationReport, VerifyError> {
        let suffix = random_suffix();
        let keys: Vec<String> = (0..self.options.count)
            .map(|i| format!("{}-{}-{}", self.options.prefix, i + 1, suffix))
            .collect();
        let plan = Plan::broadcast(EventKind::Message, receivers, keys.clone());

        let conversation_id = conversation.id();
        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::Message {
                conversation_id: id,
                content,
                ..
            } if *id == conversation_id => Some(content.clone()),
            _ => None,
        });

        let conversation = Arc::clone(conversation);
        let interval = self.options.send_interval;
        self.run(plan, matcher, |clock| async move {
            for (index, content) in keys.iter().enumerate() {
                pace(index, interval).await;
                clock.mark(index).await;
                conversation
                    .send(content)
                    .await
                    .map_err(|source| VerifyError::Send { index, source })?;
            }
            Ok(())
        })
        .await
    }

    /// Every sender opens a direct conversation with `receiver` and sends
    /// `count` messages; senders run concurrently. Senders sharing the
    /// receiver's inbox are skipped.
    pub async fn verify_dm_stream(
        &self,
        senders: &[Arc<Worker>],
        receiver: &Arc<Worker>,
    ) -> Result<VerificationReport, VerifyError> {
        let senders: Vec<&Arc<Worker>> = senders
            .iter()
            .filter(|s| s.inbox_id() != receiver.inbox_id())
            .collect();
        if senders.is_empty() {
            return Err(VerifyError::NoProbes);
        }

        let mut conversations = Vec::with_capacity(senders.len());
        for sender in &senders {
            conversations.push(sender.session().new_dm(receiver.inbox_id()).await?);
        }

        let suffix = random_suffix();
        let count = self.options.count;
        let keys: Vec<String> = (0..senders.len())
            .flat_map(|s| (0..count).map(move |j| (s, j)))
            .map(|(s, j)| format!("{}-{}-{}-{}", self.options.prefix, s + 1, j + 1, suffix))
            .collect();
        let plan = Plan::broadcast(EventKind::Message, std::slice::from_ref(receiver), keys.clone());

        let dm_ids: HashSet<String> = conversations.iter().map(|c| c.id()).collect();
        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::Message {
                conversation_id,
                content,
                ..
            } if dm_ids.contains(conversation_id) => Some(content.clone()),
            _ => None,
        });

        let interval = self.options.send_interval;
        self.run(plan, matcher, |clock| async move {
            try_join_all(conversations.iter().enumerate().map(|(s, conversation)| {
                let clock = clock.clone();
                let keys = &keys;
                async move {
                    for j in 0..count {
                        let index = s * count + j;
                        pace(j, interval).await;
                        clock.mark(index).await;
                        let content = keys.get(index).map(String::as_str).unwrap_or_default();
                        conversation
                            .send(content)
                            .await
                            .map_err(|source| VerifyError::Send { index, source })?;
                    }
                    Ok::<(), VerifyError>(())
                }
            }))
            .await
            .map(|_| ())
        })
        .await
    }

    /// `count` renames of `conversation`, observed as metadata updates. The
    /// renaming installation must not be among `receivers`.
    pub async fn verify_metadata_stream(
        &self,
        conversation: &Arc<dyn Conversation>,
        receivers: &[Arc<Worker>],
    ) -> Result<VerificationReport, VerifyError> {
        let suffix = random_suffix();
        let names: Vec<String> = (0..self.options.count)
            .map(|i| format!("New name-{}-{}", i + 1, suffix))
            .collect();
        let plan = Plan::broadcast(EventKind::MetadataUpdate, receivers, names.clone());

        let conversation_id = conversation.id();
        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::MetadataUpdate {
                conversation_id: id,
                field,
                new_value,
                ..
            } if *id == conversation_id && field == GROUP_NAME_FIELD => Some(new_value.clone()),
            _ => None,
        });

        let conversation = Arc::clone(conversation);
        let interval = self.options.send_interval;
        self.run(plan, matcher, |clock| async move {
            for (index, name) in names.iter().enumerate() {
                pace(index, interval).await;
                clock.mark(index).await;
                conversation
                    .update_name(name)
                    .await
                    .map_err(|source| VerifyError::Send { index, source })?;
            }
            Ok(())
        })
        .await
    }

    /// One membership mutation; each receiver must see an event naming
    /// exactly the mutated member set. The acting installation must not be
    /// among `receivers`.
    pub async fn verify_membership_stream(
        &self,
        conversation: &Arc<dyn Conversation>,
        receivers: &[Arc<Worker>],
        change: MembershipChange,
    ) -> Result<VerificationReport, VerifyError> {
        let (kind, members, added) = match change {
            MembershipChange::Add(members) => (EventKind::MembershipAdd, members, true),
            MembershipChange::Remove(members) => (EventKind::MembershipRemove, members, false),
        };
        if members.is_empty() {
            return Err(VerifyError::NoProbes);
        }
        let plan = Plan::broadcast(kind, receivers, vec![member_set_key(&members)]);

        let conversation_id = conversation.id();
        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::MembersAdded {
                conversation_id: id,
                inbox_ids,
                ..
            }
            | StreamEvent::MembersRemoved {
                conversation_id: id,
                inbox_ids,
                ..
            } if *id == conversation_id => Some(member_set_key(inbox_ids)),
            _ => None,
        });

        let conversation = Arc::clone(conversation);
        self.run(plan, matcher, |clock| async move {
            clock.mark(0).await;
            let result = if added {
                conversation.add_members(&members).await
            } else {
                conversation.remove_members(&members).await
            };
            result.map_err(|source| VerifyError::Send { index: 0, source })
        })
        .await
    }

    pub async fn verify_add_member_stream(
        &self,
        conversation: &Arc<dyn Conversation>,
        receivers: &[Arc<Worker>],
        members: &[InboxId],
    ) -> Result<VerificationReport, VerifyError> {
        self.verify_membership_stream(conversation, receivers, MembershipChange::Add(members.to_vec()))
            .await
    }

    pub async fn verify_remove_member_stream(
        &self,
        conversation: &Arc<dyn Conversation>,
        receivers: &[Arc<Worker>],
        members: &[InboxId],
    ) -> Result<VerificationReport, VerifyError> {
        self.verify_membership_stream(conversation, receivers, MembershipChange::Remove(members.to_vec()))
            .await
    }

    /// `initiator` creates a new group with every receiver; each receiver
    /// must see it on its conversation stream. Installations of the
    /// initiator's inbox are left out of the receivers.
    pub async fn verify_conversation_stream(
        &self,
        initiator: &Arc<Worker>,
        receivers: &[Arc<Worker>],
    ) -> Result<VerificationReport, VerifyError> {
        let receivers: Vec<Arc<Worker>> = receivers
            .iter()
            .filter(|r| r.inbox_id() != initiator.inbox_id())
            .cloned()
            .collect();
        let name = format!("{}-conversation-{}", self.options.prefix, random_suffix());
        let plan = Plan::broadcast(EventKind::Conversation, &receivers, vec![name.clone()]);

        let mut members: Vec<InboxId> = Vec::new();
        for receiver in &receivers {
            let inbox_id = receiver.inbox_id().to_string();
            if !members.contains(&inbox_id) {
                members.push(inbox_id);
            }
        }

        let creator = initiator.inbox_id().to_string();
        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::Conversation {
                creator_inbox_id,
                name,
                ..
            } if *creator_inbox_id == creator => Some(name.clone()),
            _ => None,
        });

        let session = initiator.session();
        self.run(plan, matcher, |clock| async move {
            clock.mark(0).await;
            session
                .new_group(&members, Some(name))
                .await
                .map(|_| ())
                .map_err(|source| VerifyError::Send { index: 0, source })
        })
        .await
    }

    /// Adds `receivers` to an existing group; each must see the group
    /// arrive on its conversation stream.
    pub async fn verify_new_conversation_stream(
        &self,
        conversation: &Arc<dyn Conversation>,
        receivers: &[Arc<Worker>],
    ) -> Result<VerificationReport, VerifyError> {
        let conversation_id = conversation.id();
        let plan = Plan::broadcast(EventKind::Conversation, receivers, vec![conversation_id.clone()]);

        let mut members: Vec<InboxId> = Vec::new();
        for receiver in receivers {
            let inbox_id = receiver.inbox_id().to_string();
            if !members.contains(&inbox_id) {
                members.push(inbox_id);
            }
        }

        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::Conversation {
                conversation_id: id, ..
            } if *id == conversation_id => Some(id.clone()),
            _ => None,
        });

        let conversation = Arc::clone(conversation);
        self.run(plan, matcher, |clock| async move {
            clock.mark(0).await;
            conversation
                .add_members(&members)
                .await
                .map_err(|source| VerifyError::Send { index: 0, source })
        })
        .await
    }

    /// `sender` flips its consent toward each receiver inbox; each receiver
    /// must see the flip aimed at itself.
    pub async fn verify_consent_stream(
        &self,
        sender: &Arc<Worker>,
        receivers: &[Arc<Worker>],
    ) -> Result<VerificationReport, VerifyError> {
        let (plan, inboxes) = Plan::per_inbox(EventKind::Consent, receivers, |inbox| format!("inbox:{}", inbox));

        let initiator = sender.inbox_id().to_string();
        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::Consent {
                initiated_by,
                entity,
                entity_type: ConsentEntity::Inbox,
                ..
            } if *initiated_by == initiator => Some(format!("inbox:{}", entity)),
            _ => None,
        });

        let session = sender.session();
        let interval = self.options.send_interval;
        self.run(plan, matcher, |clock| async move {
            for (index, inbox) in inboxes.iter().enumerate() {
                pace(index, interval).await;
                let send_error = |source| VerifyError::Send { index, source };
                let current = session
                    .consent_state(inbox, ConsentEntity::Inbox)
                    .await
                    .map_err(send_error)?;
                clock.mark(index).await;
                session
                    .set_consent(inbox, ConsentEntity::Inbox, current.toggled())
                    .await
                    .map_err(send_error)?;
            }
            Ok(())
        })
        .await
    }

    /// Each receiver flips its own consent toward `conversation` and must
    /// see its own flip on its consent stream.
    pub async fn verify_group_consent_stream(
        &self,
        conversation: &Arc<dyn Conversation>,
        receivers: &[Arc<Worker>],
    ) -> Result<VerificationReport, VerifyError> {
        let (plan, inboxes) = Plan::per_inbox(EventKind::Consent, receivers, |inbox| format!("group:{}", inbox));

        let group_id = conversation.id();
        let matcher_group = group_id.clone();
        let matcher: Arc<Matcher> = Arc::new(move |event: &StreamEvent| match event {
            StreamEvent::Consent {
                initiated_by,
                entity,
                entity_type: ConsentEntity::Group,
                ..
            } if *entity == matcher_group => Some(format!("group:{}", initiated_by)),
            _ => None,
        });

        // One acting session per distinct inbox
        let sessions: Vec<_> = inboxes
            .iter()
            .filter_map(|inbox| receivers.iter().find(|r| r.inbox_id() == inbox))
            .map(|r| r.session())
            .collect();

        self.run(plan, matcher, |clock| async move {
            for (index, session) in sessions.iter().enumerate() {
                let send_error = |source| VerifyError::Send { index, source };
                let current = session
                    .consent_state(&group_id, ConsentEntity::Group)
                    .await
                    .map_err(send_error)?;
                clock.mark(index).await;
                session
                    .set_consent(&group_id, ConsentEntity::Group, current.toggled())
                    .await
                    .map_err(send_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn run<F, Fut>(&self, plan: Plan, matcher: Arc<Matcher>, trigger: F) -> Result<VerificationReport, VerifyError>
    where
        F: FnOnce(SendClock) -> Fut,
        Fut: Future<Output = Result<(), VerifyError>>,
    {
        if plan.receivers.is_empty() {
            return Err(VerifyError::NoReceivers);
        }
        if plan.keys.is_empty() {
            return Err(VerifyError::NoProbes);
        }

        // Every receiver is listening before the first probe goes out.
        let mut subscriptions = Vec::with_capacity(plan.receivers.len());
        for receiver in &plan.receivers {
            let subscription = receiver
                .subscribe(plan.kind)
                .await
                .map_err(|source| VerifyError::Subscribe {
                    receiver: receiver.key().clone(),
                    kind: plan.kind,
                    source,
                })?;
            subscriptions.push(subscription);
        }
        if !self.options.cold_start.is_zero() {
            tokio::time::sleep(self.options.cold_start).await;
        }

        let probes: Arc<HashMap<String, usize>> = Arc::new(
            plan.keys
                .iter()
                .enumerate()
                .map(|(index, key)| (key.clone(), index))
                .collect(),
        );
        let (deadline_tx, deadline_rx) = watch::channel(None::<Instant>);
        let drains: Vec<JoinHandle<Vec<Matched>>> = subscriptions
            .into_iter()
            .zip(plan.expected.iter())
            .map(|(subscription, expected)| {
                tokio::spawn(drain(
                    subscription,
                    Arc::clone(&probes),
                    expected.clone(),
                    Arc::clone(&matcher),
                    deadline_rx.clone(),
                ))
            })
            .collect();

        let clock = SendClock::default();
        let outcome = tokio::time::timeout(self.options.timeout, trigger(clock.clone())).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(_) => Some(VerifyError::SendTimeout(self.options.timeout)),
        };
        if let Some(error) = failure {
            for drain in &drains {
                drain.abort();
            }
            warn!("{} verification aborted: {}", plan.kind, error);
            return Err(error);
        }
        deadline_tx.send_replace(Some(Instant::now() + self.options.timeout));

        let sent_at = clock.snapshot().await;
        let mut outcomes = Vec::with_capacity(plan.receivers.len());
        for ((receiver, expected), handle) in plan.receivers.iter().zip(plan.expected).zip(drains) {
            let matched = match handle.await {
                Ok(matched) => matched,
                Err(e) => {
                    warn!("[{}] drain task failed: {}", receiver.key(), e);
                    Vec::new()
                }
            };
            let arrivals = matched
                .into_iter()
                .map(|m| Arrival {
                    probe_index: m.probe_index,
                    arrived_at_ms: m.wall_ms,
                    latency: sent_at
                        .get(&m.probe_index)
                        .map(|sent| m.at.saturating_duration_since(*sent))
                        .unwrap_or_default(),
                })
                .collect();
            outcomes.push(ReceiverOutcome {
                receiver: receiver.label(),
                expected,
                arrivals,
            });
        }

        let report = VerificationReport::from_outcomes(plan.kind, sent_at.len(), &outcomes, self.options.high_tolerance);
        info!(
            "{} verification: {}/{} events ({:.1}%), {}/{} receivers in order, average {:?}",
            report.kind,
            report.received_count,
            report.expected_count,
            report.reception_percentage,
            report.receivers_in_order,
            report.expected_receiver_count,
            report.average_event_timing
        );
        Ok(report)
    }
}

/// Collects one receiver's matches until it has every expected probe, its
/// stream closes, or the deadline passes. The deadline is unset until the
/// last probe has been sent.
async fn drain(
    mut subscription: StreamSubscription,
    probes: Arc<HashMap<String, usize>>,
    expected: Vec<usize>,
    matcher: Arc<Matcher>,
    mut deadline: watch::Receiver<Option<Instant>>,
) -> Vec<Matched> {
    let mut outstanding: HashSet<usize> = expected.into_iter().collect();
    let mut matched = Vec::new();

    while !outstanding.is_empty() {
        let current = *deadline.borrow();
        let next = match current {
            Some(at) => subscription.next_before(at).await,
            None => {
                tokio::select! {
                    next = subscription.next_before(Instant::now() + PRE_SEND_WAIT) => next,
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        match next {
            Next::Event(event) => {
                let Some(index) = matcher(&event).and_then(|key| probes.get(&key).copied()) else {
                    continue;
                };
                // Duplicates and probes meant for other receivers are ignored
                if outstanding.remove(&index) {
                    matched.push(Matched {
                        probe_index: index,
                        at: Instant::now(),
                        wall_ms: epoch_millis(),
                    });
                }
            }
            Next::Closed => {
                warn!(
                    "[{}] {} stream closed with {} probe(s) outstanding",
                    subscription.worker(),
                    subscription.kind(),
                    outstanding.len()
                );
                break;
            }
            Next::TimedOut if current.is_none() => continue,
            Next::TimedOut => break,
        }
    }
    matched
}

async fn pace(index: usize, interval: Duration) {
    if index > 0 && !interval.is_zero() {
        tokio::time::sleep(interval).await;
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
