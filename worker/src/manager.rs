use crate::config::{HarnessConfig, Network};
use crate::error::{AggregateTerminationError, TerminationFailure, VersionError, WorkerError};
use crate::protocol::Conversation;
use crate::version::VersionRegistry;
use crate::worker::{Worker, WorkerIdentity};
use futures::future::join_all;
use log::{info, warn};
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use vigil_lib::events::{EventKind, InboxId};
use vigil_lib::keys::{generate_identity_keys, IdentityKeys};
use vigil_lib::{is_valid_key_part, WorkerKey, DEFAULT_INSTALLATION, SEPARATOR};

/// A parsed `name[-installation][-version]` worker descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub name: String,
    pub installation: Option<String>,
    pub version: Option<String>,
}

impl WorkerDescriptor {
    /// The trailing part is read as a version when the registry knows it;
    /// everything between the name and the version is the installation. A
    /// trailing part shaped like a version tag must be in the catalog.
    pub fn parse(descriptor: &str, registry: &VersionRegistry) -> Result<Self, VersionError> {
        let separator = SEPARATOR.to_string();
        let parts: Vec<&str> = descriptor.split(SEPARATOR).collect();
        let (name, rest) = match parts.split_first() {
            Some((name, rest)) => (name.to_string(), rest),
            None => (descriptor.to_string(), &[][..]),
        };

        let (installation, version) = match rest.split_last() {
            Some((last, middle)) if registry.contains(last) => {
                let installation = (!middle.is_empty()).then(|| middle.join(separator.as_str()));
                (installation, Some(last.to_string()))
            }
            Some((last, _)) if looks_like_version(last) => {
                return Err(VersionError::NotFound { tag: last.to_string() });
            }
            Some(_) => (Some(rest.join(separator.as_str())), None),
            None => (None, None),
        };

        Ok(Self {
            name,
            installation,
            version,
        })
    }
}

fn looks_like_version(part: &str) -> bool {
    part.starts_with(|c: char| c.is_ascii_digit()) && part.contains('.')
}

/// Local state location of a worker:
/// `<root>/<name>/<installation>/<network>-<version>`.
pub fn state_path(root: &Path, key: &WorkerKey, version: &str, network: Network) -> PathBuf {
    root.join(&key.name)
        .join(&key.installation)
        .join(format!("{}-{}", network, version))
}

/// Owns every worker of a run, keyed by (name, installation).
pub struct WorkerManager {
    config: HarnessConfig,
    registry: Arc<VersionRegistry>,
    // Insertion order decides the creator and the receiver
    workers: RwLock<Vec<Arc<Worker>>>,
    key_cache: Mutex<HashMap<String, IdentityKeys>>,
    // Held from the lookup until registration so one key opens one session
    creating: Mutex<HashMap<WorkerKey, Arc<Mutex<()>>>>,
}

impl WorkerManager {
    pub fn new(config: HarnessConfig, registry: Arc<VersionRegistry>) -> Self {
        Self {
            config,
            registry,
            workers: RwLock::new(Vec::new()),
            key_cache: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<VersionRegistry> {
        &self.registry
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    /// Creates and registers a worker. An existing worker with the same
    /// name and installation is returned unchanged.
    pub async fn create_worker(
        &self,
        name: &str,
        installation: Option<&str>,
        version: Option<&str>,
    ) -> Result<Arc<Worker>, WorkerError> {
        let key = validated_key(name, installation)?;
        let _creating = self.creation_lock(&key).await;
        if let Some(existing) = self.get_key(&key).await {
            return Ok(existing);
        }

        let worker = Arc::new(self.open_worker(key, version).await?);
        Ok(self.register(worker).await)
    }

    /// Creates a worker from a `name[-installation][-version]` descriptor.
    pub async fn create_from_descriptor(&self, descriptor: &str) -> Result<Arc<Worker>, WorkerError> {
        let parsed = WorkerDescriptor::parse(descriptor, &self.registry)?;
        self.create_worker(&parsed.name, parsed.installation.as_deref(), parsed.version.as_deref())
            .await
    }

    /// Creates many workers concurrently. Workers are registered in
    /// descriptor order; when any creation fails the first failure is
    /// returned after all attempts settle, and the successful ones stay
    /// registered.
    pub async fn create_workers<S: AsRef<str>>(&self, descriptors: &[S]) -> Result<Vec<Arc<Worker>>, WorkerError> {
        let mut pending = Vec::new();
        let mut seen: Vec<WorkerKey> = Vec::new();
        let mut first_error: Option<WorkerError> = None;
        for descriptor in descriptors {
            let parsed = match WorkerDescriptor::parse(descriptor.as_ref(), &self.registry) {
                Ok(parsed) => parsed,
                Err(e) => {
                    first_error.get_or_insert(e.into());
                    continue;
                }
            };
            match validated_key(&parsed.name, parsed.installation.as_deref()) {
                Ok(key) if seen.contains(&key) => {}
                Ok(key) => {
                    seen.push(key.clone());
                    pending.push((key, parsed.version));
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let results = join_all(pending.into_iter().map(|(key, version)| async move {
            let creating = self.creation_lock(&key).await;
            if let Some(existing) = self.get_key(&key).await {
                return (creating, Ok(existing));
            }
            let opened = self.open_worker(key, version.as_deref()).await.map(Arc::new);
            (creating, opened)
        }))
        .await;

        let mut created = Vec::new();
        for (creating, result) in results {
            match result {
                Ok(worker) => created.push(self.register(worker).await),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
            drop(creating);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    async fn open_worker(&self, key: WorkerKey, version: Option<&str>) -> Result<Worker, WorkerError> {
        let version = self.registry.resolve(version)?;
        let keys = self.identity_keys_for(&key.name).await;
        let identity = WorkerIdentity {
            state_path: state_path(&self.config.state_root, &key, version.tag(), self.config.network),
            key,
            keys,
        };
        Worker::open(identity, version, self.config.network, self.config.init_timeout).await
    }

    async fn creation_lock(&self, key: &WorkerKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut creating = self.creating.lock().await;
            Arc::clone(creating.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    // Callers hold the key's creation lock.
    async fn register(&self, worker: Arc<Worker>) -> Arc<Worker> {
        let mut workers = self.workers.write().await;
        if !workers.iter().any(|w| Arc::ptr_eq(w, &worker)) {
            workers.push(Arc::clone(&worker));
        }
        worker
    }

    /// Keys are cached per logical name so every installation of a name
    /// shares one inbox.
    async fn identity_keys_for(&self, name: &str) -> IdentityKeys {
        let mut cache = self.key_cache.lock().await;
        cache
            .entry(name.to_string())
            .or_insert_with(|| match self.config.identity_keys_for(name) {
                Some(keys) => keys.clone(),
                None => generate_identity_keys(),
            })
            .clone()
    }

    /// Looks up `name` or `name-installation`; a bare name means the
    /// default installation.
    pub async fn get(&self, token: &str) -> Option<Arc<Worker>> {
        self.get_key(&WorkerKey::parse(token)).await
    }

    pub async fn get_key(&self, key: &WorkerKey) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .await
            .iter()
            .find(|w| w.key() == key)
            .cloned()
    }

    pub async fn get_all(&self) -> Vec<Arc<Worker>> {
        self.workers.read().await.clone()
    }

    /// Every worker except all installations of `name`.
    pub async fn get_all_but(&self, name: &str) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .await
            .iter()
            .filter(|w| w.name() != name)
            .cloned()
            .collect()
    }

    /// The first registered worker.
    pub async fn get_creator(&self) -> Option<Arc<Worker>> {
        self.workers.read().await.first().cloned()
    }

    /// The second registered worker.
    pub async fn get_receiver(&self) -> Option<Arc<Worker>> {
        self.workers.read().await.get(1).cloned()
    }

    pub async fn get_all_but_creator(&self) -> Vec<Arc<Worker>> {
        self.workers.read().await.iter().skip(1).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    pub async fn get_random_workers(&self, count: usize) -> Vec<Arc<Worker>> {
        let workers = self.workers.read().await;
        workers
            .choose_multiple(&mut rand::thread_rng(), count)
            .cloned()
            .collect()
    }

    pub async fn get_random_worker(&self) -> Option<Arc<Worker>> {
        self.workers.read().await.choose(&mut rand::thread_rng()).cloned()
    }

    pub async fn worker_names(&self) -> Vec<String> {
        self.workers.read().await.iter().map(|w| w.label()).collect()
    }

    /// One line per worker: label, version, inbox and setup time.
    pub async fn describe(&self) -> String {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| {
                format!(
                    "{} version={} bindings={} inbox={} init={:?}",
                    w.label(),
                    w.version().tag(),
                    w.version().binding_tag(),
                    w.inbox_id(),
                    w.initialization_time()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The creator opens a group with every other worker's inbox, then adds
    /// `extra_members`. A missing title becomes `Test Group <random>`.
    pub async fn create_group_between_all(
        &self,
        title: Option<&str>,
        extra_members: &[InboxId],
    ) -> Result<Arc<dyn Conversation>, WorkerError> {
        let creator = self.get_creator().await.ok_or(WorkerError::NoWorkers)?;

        let mut members: Vec<InboxId> = Vec::new();
        for worker in self.get_all_but_creator().await {
            let inbox_id = worker.inbox_id().to_string();
            if inbox_id != creator.inbox_id() && !members.contains(&inbox_id) {
                members.push(inbox_id);
            }
        }

        let title = title.map(str::to_string).unwrap_or_else(|| {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            format!("Test Group {}", suffix)
        });

        let protocol_error = |source| WorkerError::Protocol {
            worker: creator.key().clone(),
            source,
        };
        let group = creator
            .session()
            .new_group(&members, Some(title.clone()))
            .await
            .map_err(protocol_error)?;
        if !extra_members.is_empty() {
            group.add_members(extra_members).await.map_err(protocol_error)?;
        }

        info!(
            "[{}] created group {:?} ({}) with {} member(s)",
            creator.key(),
            title,
            group.id(),
            members.len() + extra_members.len() + 1
        );
        Ok(group)
    }

    pub async fn create_group_between_all_workers(
        &self,
        title: Option<&str>,
    ) -> Result<Arc<dyn Conversation>, WorkerError> {
        self.create_group_between_all(title, &[]).await
    }

    /// Opens (or reuses) the direct conversation from `from` to `to`.
    pub async fn create_dm(&self, from: &str, to: &str) -> Result<Arc<dyn Conversation>, WorkerError> {
        let sender = self
            .get(from)
            .await
            .ok_or_else(|| WorkerError::NotFound(WorkerKey::parse(from)))?;
        let peer = self
            .get(to)
            .await
            .ok_or_else(|| WorkerError::NotFound(WorkerKey::parse(to)))?;

        sender
            .session()
            .new_dm(peer.inbox_id())
            .await
            .map_err(|source| WorkerError::Protocol {
                worker: sender.key().clone(),
                source,
            })
    }

    /// Starts `kind` on every worker; every worker is attempted and the
    /// first failure is reported.
    pub async fn start_stream(&self, kind: EventKind) -> Result<(), WorkerError> {
        let workers = self.get_all().await;
        let results = join_all(workers.iter().map(|w| w.start_stream(kind))).await;
        results.into_iter().collect()
    }

    /// Terminates one worker and forgets it. Terminating an unknown or
    /// already-terminated worker succeeds and returns false.
    pub async fn terminate(&self, token: &str, delete_state: bool) -> Result<bool, WorkerError> {
        let key = WorkerKey::parse(token);
        let removed = {
            let mut workers = self.workers.write().await;
            workers
                .iter()
                .position(|w| w.key() == &key)
                .map(|index| workers.remove(index))
        };
        let Some(worker) = removed else {
            return Ok(false);
        };

        worker.terminate().await?;
        if delete_state {
            worker.delete_state().await?;
        }
        Ok(true)
    }

    /// Terminates every worker concurrently and empties the manager. Every
    /// worker is attempted; failures are gathered into one error.
    pub async fn terminate_all(&self, delete_state: bool) -> Result<(), AggregateTerminationError> {
        let workers: Vec<Arc<Worker>> = self.workers.write().await.drain(..).collect();
        let count = workers.len();

        let results = join_all(workers.iter().map(|worker| async move {
            let mut outcome = worker.terminate().await;
            if outcome.is_ok() && delete_state {
                outcome = worker.delete_state().await;
            }
            outcome.map_err(|error| TerminationFailure {
                worker: worker.key().clone(),
                error,
            })
        }))
        .await;

        let failures: Vec<TerminationFailure> = results.into_iter().filter_map(Result::err).collect();
        for failure in &failures {
            warn!("[{}] termination failed: {}", failure.worker, failure.error);
        }
        info!("Terminated {} of {} worker(s)", count - failures.len(), count);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AggregateTerminationError { failures })
        }
    }
}

fn validated_key(name: &str, installation: Option<&str>) -> Result<WorkerKey, WorkerError> {
    if !is_valid_key_part(name) {
        return Err(WorkerError::InvalidName {
            field: "name",
            value: name.to_string(),
        });
    }
    let installation = installation.unwrap_or(DEFAULT_INSTALLATION);
    if !is_valid_key_part(installation) {
        return Err(WorkerError::InvalidName {
            field: "installation",
            value: installation.to_string(),
        });
    }
    Ok(WorkerKey::new(name, installation))
}
