//! Vigil worker harness
//!
//! Orchestrates protocol client workers across library versions and checks
//! that their live event streams deliver what was sent. The harness can run
//! against a real network through a [`protocol::ClientFactory`] or against
//! the in-process [`local::LocalNetwork`].

macro_rules! log_info {
    ($worker:expr, $($arg:tt)*) => ({
        log::info!("[{}] {}", $worker, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($worker:expr, $($arg:tt)*) => ({
        log::warn!("[{}] {}", $worker, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($worker:expr, $($arg:tt)*) => ({
        log::error!("[{}] {}", $worker, format_args!($($arg)*));
    })
}

macro_rules! log_debug {
    ($worker:expr, $($arg:tt)*) => ({
        log::debug!("[{}] {}", $worker, format_args!($($arg)*));
    })
}

pub mod chaos;
pub mod config;
pub mod error;
pub mod local;
pub mod manager;
pub mod names;
pub mod protocol;
pub mod verify;
pub mod version;
pub mod worker;


// Re-export main types for public API
pub use chaos::{ChaosProvider, GroupExpansionChaos, StreamChaos};
pub use config::{HarnessConfig, Network};
pub use error::{
    AggregateTerminationError, ChaosError, ConfigError, ProtocolError, VerifyError, VersionError, WorkerError,
};
pub use local::LocalNetwork;
pub use manager::{WorkerDescriptor, WorkerManager};
pub use verify::{StreamVerificationEngine, VerifyOptions};
pub use version::{VersionDescriptor, VersionRegistry};
pub use worker::{Next, StreamSubscription, Worker};

// Re-export from lib crate for convenience
pub use vigil_lib::events::{ConsentEntity, ConsentState, EventKind, InboxId, StreamEvent};
pub use vigil_lib::report::VerificationReport;
pub use vigil_lib::WorkerKey;
