use crate::config::Network;
use crate::error::WorkerError;
use crate::protocol::{ClientRequest, EventStream, Session};
use crate::version::VersionDescriptor;
use futures::StreamExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use vigil_lib::events::{EventKind, InboxId, StreamEvent};
use vigil_lib::keys::IdentityKeys;
use vigil_lib::WorkerKey;

const STREAM_BUFFER: usize = 1024;

/// Who a worker is, independent of the session it runs.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub key: WorkerKey,
    pub keys: IdentityKeys,
    pub state_path: PathBuf,
}

struct ActiveStream {
    started_at: Instant,
    events: broadcast::Sender<StreamEvent>,
    stop: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl ActiveStream {
    fn is_live(&self) -> bool {
        !*self.stop.borrow()
    }

    fn shutdown(self) {
        self.stop.send_replace(true);
        self.task.abort();
    }
}

/// One protocol client instance bound to a logical name and installation.
pub struct Worker {
    identity: WorkerIdentity,
    version: Arc<VersionDescriptor>,
    network: Network,
    session: Arc<dyn Session>,
    inbox_id: InboxId,
    installation_id: String,
    initialization_time: Duration,
    streams: Mutex<HashMap<EventKind, ActiveStream>>,
    terminated: AtomicBool,
}

impl Worker {
    /// Creates the protocol session for `identity`, bounded by `init_timeout`.
    pub async fn open(
        identity: WorkerIdentity,
        version: Arc<VersionDescriptor>,
        network: Network,
        init_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let request = ClientRequest {
            worker: identity.key.clone(),
            keys: identity.keys.clone(),
            version: version.tag().to_string(),
            binding_version: version.binding_tag().to_string(),
            state_path: identity.state_path.clone(),
            network,
        };

        let started = Instant::now();
        let session = match tokio::time::timeout(init_timeout, version.factory().create_client(&request)).await {
            Ok(Ok(session)) => session,
            Ok(Err(source)) => {
                log_error!(identity.key, "Session setup failed: {}", source);
                return Err(WorkerError::Init {
                    worker: identity.key,
                    source,
                });
            }
            Err(_) => {
                log_error!(identity.key, "Session setup timed out after {:?}", init_timeout);
                return Err(WorkerError::InitTimeout {
                    worker: identity.key,
                    after: init_timeout,
                });
            }
        };
        let initialization_time = started.elapsed();

        let inbox_id = session.inbox_id();
        let installation_id = session.installation_id();
        log_info!(
            identity.key,
            "Ready in {:?} on {} (version {}, inbox {})",
            initialization_time,
            network,
            version.tag(),
            inbox_id
        );

        Ok(Self {
            identity,
            version,
            network,
            session,
            inbox_id,
            installation_id,
            initialization_time,
            streams: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &WorkerKey {
        &self.identity.key
    }

    pub fn name(&self) -> &str {
        &self.identity.key.name
    }

    pub fn installation(&self) -> &str {
        &self.identity.key.installation
    }

    pub fn label(&self) -> String {
        self.identity.key.label()
    }

    pub fn inbox_id(&self) -> &str {
        &self.inbox_id
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity.keys
    }

    pub fn version(&self) -> &VersionDescriptor {
        &self.version
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn state_path(&self) -> &Path {
        &self.identity.state_path
    }

    pub fn initialization_time(&self) -> Duration {
        self.initialization_time
    }

    pub fn session(&self) -> Arc<dyn Session> {
        Arc::clone(&self.session)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Opens the live stream for `kind`. Starting a kind that is already
    /// live is a no-op; a kind whose stream died is reopened.
    pub async fn start_stream(&self, kind: EventKind) -> Result<(), WorkerError> {
        let mut streams = self.streams.lock().await;
        self.ensure_streams_open(&mut streams, kind).await
    }

    /// Subscribes to the live stream for `kind`, starting it if needed.
    /// Only events that arrive after this call are observed.
    pub async fn subscribe(&self, kind: EventKind) -> Result<StreamSubscription, WorkerError> {
        let mut streams = self.streams.lock().await;
        self.ensure_streams_open(&mut streams, kind).await?;

        let active = streams
            .get(&kind)
            .ok_or_else(|| WorkerError::Terminated(self.identity.key.clone()))?;
        Ok(StreamSubscription {
            worker: self.identity.key.clone(),
            kind,
            started_at: active.started_at,
            events: active.events.subscribe(),
            stop: active.stop.subscribe(),
        })
    }

    async fn ensure_streams_open(
        &self,
        streams: &mut HashMap<EventKind, ActiveStream>,
        kind: EventKind,
    ) -> Result<(), WorkerError> {
        if self.is_terminated() {
            return Err(WorkerError::Terminated(self.identity.key.clone()));
        }
        if streams.get(&kind).is_some_and(ActiveStream::is_live) {
            return Ok(());
        }

        let stream = self
            .session
            .stream(kind)
            .await
            .map_err(|source| WorkerError::Protocol {
                worker: self.identity.key.clone(),
                source,
            })?;

        let (events, _) = broadcast::channel(STREAM_BUFFER);
        let stop = Arc::new(watch::channel(false).0);
        let task = tokio::spawn(pump(
            self.identity.key.clone(),
            kind,
            stream,
            events.clone(),
            Arc::clone(&stop),
        ));

        if let Some(stale) = streams.insert(
            kind,
            ActiveStream {
                started_at: Instant::now(),
                events,
                stop,
                task,
            },
        ) {
            log_debug!(self.identity.key, "Replacing dead {} stream", kind);
            stale.shutdown();
        }
        log_debug!(self.identity.key, "Started {} stream", kind);
        Ok(())
    }

    /// Closes the stream for `kind`. Returns false if none was open.
    pub async fn stop_stream(&self, kind: EventKind) -> bool {
        match self.streams.lock().await.remove(&kind) {
            Some(active) => {
                active.shutdown();
                log_debug!(self.identity.key, "Stopped {} stream", kind);
                true
            }
            None => false,
        }
    }

    /// Closes every open stream; subscribers observe the close immediately.
    pub async fn stop_streams(&self) {
        let drained: Vec<(EventKind, ActiveStream)> = self.streams.lock().await.drain().collect();
        for (kind, active) in drained {
            active.shutdown();
            log_debug!(self.identity.key, "Stopped {} stream", kind);
        }
    }

    pub async fn active_streams(&self) -> Vec<EventKind> {
        let streams = self.streams.lock().await;
        let mut kinds: Vec<EventKind> = streams
            .iter()
            .filter(|(_, active)| active.is_live())
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort();
        kinds
    }

    /// Stops all streams and closes the session. Safe to call repeatedly.
    pub async fn terminate(&self) -> Result<(), WorkerError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop_streams().await;
        self.session.terminate().await.map_err(|source| {
            log_warn!(self.identity.key, "Session close failed: {}", source);
            WorkerError::Protocol {
                worker: self.identity.key.clone(),
                source,
            }
        })?;
        log_info!(self.identity.key, "Terminated");
        Ok(())
    }

    /// Removes the worker's local state directory. A missing directory is
    /// not an error.
    pub async fn delete_state(&self) -> Result<(), WorkerError> {
        match tokio::fs::remove_dir_all(&self.identity.state_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkerError::StatePath {
                path: self.identity.state_path.clone(),
                source,
            }),
        }
    }
}

async fn pump(
    worker: WorkerKey,
    kind: EventKind,
    mut stream: EventStream,
    events: broadcast::Sender<StreamEvent>,
    stop: Arc<watch::Sender<bool>>,
) {
    let mut stop_rx = stop.subscribe();
    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {}
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    // No subscribers is fine; the event is simply unobserved.
                    let _ = events.send(event);
                }
                Some(Err(error)) => {
                    log_warn!(worker, "{} stream dropped: {}", kind, error);
                    break;
                }
                None => {
                    log_debug!(worker, "{} stream ended", kind);
                    break;
                }
            }
        }
    }
    stop.send_replace(true);
}

/// Outcome of waiting on a [`StreamSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    Event(StreamEvent),
    /// The underlying stream stopped, through termination or a transport drop.
    Closed,
    TimedOut,
}

/// A receiver's view of one live stream.
pub struct StreamSubscription {
    worker: WorkerKey,
    kind: EventKind,
    started_at: Instant,
    events: broadcast::Receiver<StreamEvent>,
    stop: watch::Receiver<bool>,
}

impl StreamSubscription {
    pub fn worker(&self) -> &WorkerKey {
        &self.worker
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_closed(&self) -> bool {
        *self.stop.borrow()
    }

    /// Waits for the next event until `deadline`. Events already buffered
    /// are still handed out after the stream closes.
    pub async fn next_before(&mut self, deadline: Instant) -> Next {
        loop {
            if *self.stop.borrow() {
                return match self.events.try_recv() {
                    Ok(event) => Next::Event(event),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!("[{}] {} subscription lagged by {} events", self.worker, self.kind, skipped);
                        continue;
                    }
                    Err(_) => Next::Closed,
                };
            }

            tokio::select! {
                biased;
                received = self.events.recv() => match received {
                    Ok(event) => return Next::Event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[{}] {} subscription lagged by {} events", self.worker, self.kind, skipped);
                    }
                    Err(RecvError::Closed) => return Next::Closed,
                },
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        return Next::Closed;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Next::TimedOut,
            }
        }
    }
}

// Streams of a worker dropped without terminate are still closed.
impl Drop for Worker {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.streams.try_lock() {
            for (_, active) in streams.drain() {
                active.shutdown();
            }
        }
        if !self.is_terminated() {
            debug!("[{}] dropped without terminate", self.identity.key);
        }
    }
}
