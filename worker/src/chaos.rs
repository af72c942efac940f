//! Fault injection alongside verification runs.
//!
//! A [`ChaosProvider`] is started against a worker manager, disturbs the run
//! on its own timer, and is stopped once the run is over.

use crate::error::ChaosError;
use crate::manager::WorkerManager;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use vigil_lib::events::EventKind;

#[async_trait]
pub trait ChaosProvider: Send {
    fn name(&self) -> &'static str;

    /// Begins injecting faults. Starting a running provider is an error.
    async fn start(&mut self, manager: Arc<WorkerManager>) -> Result<(), ChaosError>;

    /// Stops injecting faults and waits for the current round to finish.
    /// Safe to call repeatedly, or without a prior start.
    async fn stop(&mut self);
}

/// Starts every provider in order. On failure the ones already started are
/// stopped again.
pub async fn start_all(providers: &mut [Box<dyn ChaosProvider>], manager: Arc<WorkerManager>) -> Result<(), ChaosError> {
    for index in 0..providers.len() {
        let Some(provider) = providers.get_mut(index) else {
            break;
        };
        if let Err(e) = provider.start(Arc::clone(&manager)).await {
            for started in providers.iter_mut().take(index) {
                started.stop().await;
            }
            return Err(e);
        }
    }
    Ok(())
}

pub async fn stop_all(providers: &mut [Box<dyn ChaosProvider>]) {
    for provider in providers.iter_mut() {
        provider.stop().await;
    }
}

/// A periodic task with a stop signal.
struct Ticker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Ticker {
    /// Runs `tick()` every `period`, starting one period from now.
    fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => tick().await,
                }
            }
        });
        Self { stop, task }
    }

    async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Chaos task failed: {}", e);
            }
        }
    }
}

/// Periodically adds a fresh worker to every group the creator is in, and
/// renames those groups. Rounds are numbered from 1 and keep counting
/// across restarts, so every round creates a new worker.
pub struct GroupExpansionChaos {
    interval: Duration,
    prefix: String,
    ticker: Option<Ticker>,
    rounds: Arc<AtomicU64>,
}

impl GroupExpansionChaos {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            prefix: "expand".to_string(),
            ticker: None,
            rounds: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name prefix of the workers this provider creates. It must not contain
    /// the name separator.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Expansion rounds run so far, including those of earlier starts.
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::SeqCst)
    }
}

async fn expand_groups(manager: &WorkerManager, name: &str, round: u64) {
    let newcomer = match manager.create_worker(name, None, None).await {
        Ok(worker) => worker,
        Err(e) => {
            warn!("Group expansion could not create {}: {}", name, e);
            return;
        }
    };
    let Some(creator) = manager.get_creator().await else {
        return;
    };

    let conversations = match creator.session().list_conversations().await {
        Ok(conversations) => conversations,
        Err(e) => {
            warn!("[{}] group expansion could not list groups: {}", creator.key(), e);
            return;
        }
    };

    let members = [newcomer.inbox_id().to_string()];
    for conversation in conversations.iter().filter(|c| !c.is_dm()) {
        if let Err(e) = conversation.add_members(&members).await {
            warn!("[{}] could not add {} to {}: {}", creator.key(), name, conversation.id(), e);
            continue;
        }
        if let Err(e) = conversation.update_name(&format!("Expanded group {}", round)).await {
            warn!("[{}] could not rename {}: {}", creator.key(), conversation.id(), e);
        }
    }
    debug!("Group expansion round {} added {}", round, name);
}

#[async_trait]
impl ChaosProvider for GroupExpansionChaos {
    fn name(&self) -> &'static str {
        "group-expansion"
    }

    async fn start(&mut self, manager: Arc<WorkerManager>) -> Result<(), ChaosError> {
        if self.ticker.is_some() {
            return Err(ChaosError::AlreadyRunning(self.name()));
        }

        let prefix = self.prefix.clone();
        let rounds = Arc::clone(&self.rounds);
        self.ticker = Some(Ticker::spawn(self.interval, move || {
            let manager = Arc::clone(&manager);
            let round = rounds.fetch_add(1, Ordering::SeqCst) + 1;
            let name = format!("{}{}", prefix, round);
            async move { expand_groups(&manager, &name, round).await }
        }));
        info!("Started group expansion every {:?}", self.interval);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.shutdown().await;
            info!("Stopped group expansion");
        }
    }
}

/// Periodically opens extra raw streams on every worker and drops the
/// previous round's, without touching verification subscriptions.
pub struct StreamChaos {
    interval: Duration,
    kind: EventKind,
    ticker: Option<Ticker>,
    consumers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StreamChaos {
    pub fn new(interval: Duration, kind: EventKind) -> Self {
        Self {
            interval,
            kind,
            ticker: None,
            consumers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Raw streams currently held open by this provider.
    pub async fn open_streams(&self) -> usize {
        self.consumers.lock().await.iter().filter(|c| !c.is_finished()).count()
    }
}

async fn churn_streams(manager: &WorkerManager, kind: EventKind, consumers: &Mutex<Vec<JoinHandle<()>>>) {
    let mut consumers = consumers.lock().await;
    for consumer in consumers.drain(..) {
        consumer.abort();
    }

    for worker in manager.get_all().await {
        match worker.session().stream(kind).await {
            Ok(mut stream) => consumers.push(tokio::spawn(async move {
                while let Some(item) = stream.next().await {
                    if item.is_err() {
                        break;
                    }
                }
            })),
            Err(e) => debug!("[{}] stream chaos could not open {} stream: {}", worker.key(), kind, e),
        }
    }
}

#[async_trait]
impl ChaosProvider for StreamChaos {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn start(&mut self, manager: Arc<WorkerManager>) -> Result<(), ChaosError> {
        if self.ticker.is_some() {
            return Err(ChaosError::AlreadyRunning(self.name()));
        }

        let kind = self.kind;
        let consumers = Arc::clone(&self.consumers);
        self.ticker = Some(Ticker::spawn(self.interval, move || {
            let manager = Arc::clone(&manager);
            let consumers = Arc::clone(&consumers);
            async move { churn_streams(&manager, kind, &consumers).await }
        }));
        info!("Started {} stream churn every {:?}", self.kind, self.interval);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.shutdown().await;
            info!("Stopped {} stream churn", self.kind);
        }
        for consumer in self.consumers.lock().await.drain(..) {
            consumer.abort();
        }
    }
}
