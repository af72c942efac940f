use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vigil_lib::events::EventKind;
use vigil_lib::{WorkerKey, SEPARATOR};

/// Failures reported by a protocol client implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session terminated")]
    Terminated,

    #[error("local state error: {0}")]
    State(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("version {tag} is not in the catalog")]
    NotFound { tag: String },

    #[error("{field} {tag:?} contains the reserved separator '{sep}'", sep = SEPARATOR)]
    InvalidTag { tag: String, field: &'static str },

    #[error("version {tag} appears more than once in the catalog")]
    Duplicate { tag: String },

    #[error("version catalog has no auto-tested entry")]
    EmptyCatalog,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid worker {field} {value:?}: must be non-empty and free of '{sep}'", sep = SEPARATOR)]
    InvalidName { field: &'static str, value: String },

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("invalid identity keys for {name}: {reason}")]
    InvalidKeys { name: String, reason: String },

    #[error("failed to initialise worker {worker}: {source}")]
    Init {
        worker: WorkerKey,
        #[source]
        source: ProtocolError,
    },

    #[error("worker {worker} did not initialise within {after:?}")]
    InitTimeout { worker: WorkerKey, after: Duration },

    #[error("state path {}: {source}", .path.display())]
    StatePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} is terminated")]
    Terminated(WorkerKey),

    #[error("worker {0} is not managed here")]
    NotFound(WorkerKey),

    #[error("worker {worker}: {source}")]
    Protocol {
        worker: WorkerKey,
        #[source]
        source: ProtocolError,
    },

    #[error("the manager holds no workers")]
    NoWorkers,
}

#[derive(Debug)]
pub struct TerminationFailure {
    pub worker: WorkerKey,
    pub error: WorkerError,
}

/// Every worker that failed to shut down during a bulk termination.
#[derive(Error, Debug)]
#[error("{} worker(s) failed to terminate: {}", .failures.len(), summarize(.failures))]
pub struct AggregateTerminationError {
    pub failures: Vec<TerminationFailure>,
}

fn summarize(failures: &[TerminationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.worker, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("verification needs at least one receiver")]
    NoReceivers,

    #[error("verification needs at least one probe")]
    NoProbes,

    #[error("failed to subscribe {receiver} to {kind} events: {source}")]
    Subscribe {
        receiver: WorkerKey,
        kind: EventKind,
        #[source]
        source: WorkerError,
    },

    #[error("probe {index} failed to send: {source}")]
    Send {
        index: usize,
        #[source]
        source: ProtocolError,
    },

    #[error("sends did not complete within {0:?}")]
    SendTimeout(Duration),

    #[error("verification setup failed: {0}")]
    Setup(#[from] ProtocolError),
}

#[derive(Error, Debug)]
pub enum ChaosError {
    #[error("chaos provider {0} is already running")]
    AlreadyRunning(&'static str),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}
