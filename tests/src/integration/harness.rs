use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vigil_worker::{
    AggregateTerminationError, HarnessConfig, LocalNetwork, StreamVerificationEngine, VerifyOptions,
    VersionRegistry, Worker, WorkerError, WorkerManager,
};

/// Stream timeout used by harness runs unless a test overrides it.
pub const TEST_STREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// A local network, a private state root and the manager running on them.
pub struct TestHarness {
    network: LocalNetwork,
    manager: Arc<WorkerManager>,
    // Dropped last; removes every worker's persisted state
    state_root: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default().with_stream_timeout(TEST_STREAM_TIMEOUT))
    }

    /// Builds a harness from `config`. The state root is always replaced by
    /// a fresh temporary directory.
    pub fn with_config(config: HarnessConfig) -> Self {
        let state_root = tempfile::tempdir().expect("Failed to create state root");
        let network = LocalNetwork::new();
        let registry = VersionRegistry::local(&network)
            .and_then(|r| r.with_forced_version(config.forced_version.as_deref()))
            .expect("Local catalog should be valid");

        let config = config.with_state_root(state_root.path());
        let manager = Arc::new(WorkerManager::new(config, Arc::new(registry)));
        Self {
            network,
            manager,
            state_root,
        }
    }

    /// A harness with `descriptors` already created.
    pub async fn with_workers(descriptors: &[&str]) -> Result<Self, WorkerError> {
        let harness = Self::new();
        harness.manager.create_workers(descriptors).await?;
        Ok(harness)
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    pub fn state_root(&self) -> &Path {
        self.state_root.path()
    }

    /// An engine using the harness timeout and tolerance, sending `count`
    /// probes per sender.
    pub fn engine(&self, count: usize) -> StreamVerificationEngine {
        StreamVerificationEngine::new(VerifyOptions::from_config(self.manager.config()).with_count(count))
    }

    pub async fn worker(&self, token: &str) -> Arc<Worker> {
        self.manager
            .get(token)
            .await
            .unwrap_or_else(|| panic!("worker {} should exist", token))
    }

    pub async fn shutdown(&self) -> Result<(), AggregateTerminationError> {
        self.manager.terminate_all(false).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
