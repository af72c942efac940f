//! In-process protocol network used by the `local` network selector.
//!
//! Every session created through a [`LocalClientFactory`] lives on a shared
//! [`LocalNetwork`]. Events are routed between installations without any
//! transport, and delivery can be degraded for fault-injection runs.

mod session;

pub use session::{LocalClientFactory, LocalConversation, LocalSession};

use crate::error::ProtocolError;
use crate::protocol::{ClientRequest, EventStream};
use futures::StreamExt;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use vigil_lib::events::{ConsentEntity, ConsentState, ConversationId, EventKind, InboxId, StreamEvent};
use vigil_lib::keys::{self, IdentityKeys};

/// File under a worker's state path holding its sealed installation id.
pub const INSTALLATION_FILE: &str = "installation.sealed";

type EventSender = mpsc::UnboundedSender<Result<StreamEvent, ProtocolError>>;

#[derive(Clone)]
pub struct LocalNetwork {
    state: Arc<RwLock<NetworkState>>,
    /// Controls event delivery timing and failures
    delivery_controller: Arc<RwLock<DeliveryController>>,
    next_id: Arc<AtomicU64>,
}

#[derive(Default)]
struct NetworkState {
    installations: HashMap<String, InstallationState>,
    open_paths: HashSet<PathBuf>,
    known_inboxes: HashSet<InboxId>,
    conversations: HashMap<ConversationId, ConversationState>,
    consent: HashMap<(InboxId, String, ConsentEntity), ConsentState>,
}

struct InstallationState {
    inbox_id: InboxId,
    state_path: PathBuf,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    kind: EventKind,
    sender: EventSender,
}

struct ConversationState {
    is_dm: bool,
    name: String,
    creator: InboxId,
    members: Vec<InboxId>,
}

#[derive(Default)]
struct DeliveryController {
    /// Installations that receive nothing
    failed_installations: HashSet<String>,
    latency_ms: u64,
    /// Random drop rate (0.0 to 1.0)
    drop_rate: f64,
    /// Drop every n-th delivery attempt, 0 disables
    throttle_one_in: u64,
    attempts: u64,
}

impl DeliveryController {
    fn admit(&mut self, installation_id: &str) -> bool {
        if self.failed_installations.contains(installation_id) {
            return false;
        }

        self.attempts += 1;
        if self.throttle_one_in > 0 && self.attempts % self.throttle_one_in == 0 {
            return false;
        }

        !(self.drop_rate > 0.0 && rand::random::<f64>() < self.drop_rate)
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(NetworkState::default())),
            delivery_controller: Arc::new(RwLock::new(DeliveryController::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Delay every delivery by `latency_ms`.
    pub async fn set_latency(&self, latency_ms: u64) {
        self.delivery_controller.write().await.latency_ms = latency_ms;
    }

    /// Set event drop rate (0.0 = no drops, 1.0 = drop all)
    pub async fn set_drop_rate(&self, drop_rate: f64) {
        self.delivery_controller.write().await.drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    /// Drop every `one_in`-th delivery attempt network-wide. Zero disables it.
    pub async fn set_throttle(&self, one_in: u64) {
        let mut controller = self.delivery_controller.write().await;
        controller.throttle_one_in = one_in;
        controller.attempts = 0;
    }

    pub async fn mark_installation_failed(&self, installation_id: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_installations
            .insert(installation_id.to_string());
    }

    pub async fn mark_installation_recovered(&self, installation_id: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_installations
            .remove(installation_id);
    }

    /// Clears every delivery fault.
    pub async fn heal(&self) {
        *self.delivery_controller.write().await = DeliveryController::default();
    }

    /// Drops every live stream of an installation with a transport error.
    /// Returns how many streams were severed.
    pub async fn sever_streams(&self, installation_id: &str) -> usize {
        let mut state = self.state.write().await;
        let Some(installation) = state.installations.get_mut(installation_id) else {
            return 0;
        };

        let severed = installation.subscribers.len();
        for subscriber in installation.subscribers.drain(..) {
            let _ = subscriber
                .sender
                .send(Err(ProtocolError::Transport("stream severed".to_string())));
        }
        warn!("Severed {} stream(s) of installation {}", severed, installation_id);
        severed
    }

    pub async fn is_installation_open(&self, installation_id: &str) -> bool {
        self.state.read().await.installations.contains_key(installation_id)
    }

    pub async fn open_installation_count(&self) -> usize {
        self.state.read().await.installations.len()
    }

    /// Live subscriptions held by an installation, across all kinds.
    pub async fn subscriber_count(&self, installation_id: &str) -> usize {
        self.state
            .read()
            .await
            .installations
            .get(installation_id)
            .map(|i| i.subscribers.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn register_installation(&self, request: &ClientRequest, inbox_id: &str) -> Result<String, ProtocolError> {
        let mut state = self.state.write().await;
        if state.open_paths.contains(&request.state_path) {
            return Err(ProtocolError::State(format!(
                "{} is already in use",
                request.state_path.display()
            )));
        }

        let installation_id = load_or_create_installation(&request.state_path, &request.keys).await?;
        if state.installations.contains_key(&installation_id) {
            return Err(ProtocolError::State(format!(
                "installation {} is already open",
                installation_id
            )));
        }

        state.open_paths.insert(request.state_path.clone());
        state.known_inboxes.insert(inbox_id.to_string());
        state.installations.insert(
            installation_id.clone(),
            InstallationState {
                inbox_id: inbox_id.to_string(),
                state_path: request.state_path.clone(),
                subscribers: Vec::new(),
            },
        );
        Ok(installation_id)
    }

    // Dropping the subscriber senders ends every stream of the installation.
    async fn close_installation(&self, installation_id: &str) {
        let mut state = self.state.write().await;
        if let Some(installation) = state.installations.remove(installation_id) {
            state.open_paths.remove(&installation.state_path);
            debug!(
                "Closed installation {} of inbox {} ({} stream(s))",
                installation_id,
                installation.inbox_id,
                installation.subscribers.len()
            );
        }
    }

    async fn open_stream(&self, installation_id: &str, kind: EventKind) -> Result<EventStream, ProtocolError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.state.write().await;
            let installation = state
                .installations
                .get_mut(installation_id)
                .ok_or(ProtocolError::Terminated)?;
            installation.subscribers.push(Subscriber { kind, sender });
        }

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    /// Routes `event` to every subscribed installation of `recipients`,
    /// skipping all installations of `skip_inbox`.
    async fn deliver(&self, recipients: &[InboxId], skip_inbox: Option<&str>, event: StreamEvent) {
        let kind = event.kind();
        let mut targets: Vec<(String, EventSender)> = Vec::new();
        {
            let mut state = self.state.write().await;
            for (installation_id, installation) in state.installations.iter_mut() {
                if !recipients.contains(&installation.inbox_id) || skip_inbox == Some(installation.inbox_id.as_str()) {
                    continue;
                }
                installation.subscribers.retain(|s| !s.sender.is_closed());
                for subscriber in installation.subscribers.iter().filter(|s| s.kind == kind) {
                    targets.push((installation_id.clone(), subscriber.sender.clone()));
                }
            }
        }

        for (installation_id, sender) in targets {
            let latency_ms = {
                let mut controller = self.delivery_controller.write().await;
                if !controller.admit(&installation_id) {
                    debug!("Dropped {} event for installation {}", kind, installation_id);
                    continue;
                }
                controller.latency_ms
            };

            let item = Ok(event.clone());
            if latency_ms == 0 {
                let _ = sender.send(item);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(tokio::time::Duration::from_millis(latency_ms)).await;
                    let _ = sender.send(item);
                });
            }
        }
    }
}

async fn load_or_create_installation(state_path: &Path, keys: &IdentityKeys) -> Result<String, ProtocolError> {
    let file = state_path.join(INSTALLATION_FILE);
    match tokio::fs::read(&file).await {
        Ok(sealed) => {
            let plaintext = keys::open(&keys.encryption_key, &sealed)
                .map_err(|e| ProtocolError::State(format!("cannot open {}: {}", file.display(), e)))?;
            String::from_utf8(plaintext).map_err(|e| ProtocolError::State(e.to_string()))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let installation_id = hex::encode(rand::random::<[u8; 16]>());
            let sealed = keys::seal(&keys.encryption_key, installation_id.as_bytes()).map_err(ProtocolError::State)?;
            tokio::fs::create_dir_all(state_path).await.map_err(state_error)?;
            tokio::fs::write(&file, sealed).await.map_err(state_error)?;
            Ok(installation_id)
        }
        Err(e) => Err(state_error(e)),
    }
}

fn state_error(error: io::Error) -> ProtocolError {
    ProtocolError::State(error.to_string())
}
