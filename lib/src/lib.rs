// Shared types for the worker harness
pub mod events;
pub mod keys;
pub mod report;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Joins a logical name and an installation id in worker labels.
pub const SEPARATOR: char = '-';

/// Installation id used when a caller names only the logical worker.
pub const DEFAULT_INSTALLATION: &str = "a";

/// Structured identity of a worker inside a manager: one logical name,
/// one installation of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerKey {
    pub name: String,
    pub installation: String,
}

impl WorkerKey {
    pub fn new(name: impl Into<String>, installation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            installation: installation.into(),
        }
    }

    /// Key for the default installation of `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_INSTALLATION)
    }

    /// Parses a single `name` or `name-installation` token.
    ///
    /// Only meant for CLI and test boundaries; everything past the first
    /// separator is taken as the installation id.
    pub fn parse(token: &str) -> Self {
        match token.split_once(SEPARATOR) {
            Some((name, installation)) => Self::new(name, installation),
            None => Self::named(token),
        }
    }

    pub fn label(&self) -> String {
        format!("{}{}{}", self.name, SEPARATOR, self.installation)
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, SEPARATOR, self.installation)
    }
}

// Names and installation ids must be non-empty and separator-free, otherwise
// `WorkerKey::parse` cannot round-trip the label.
pub fn is_valid_key_part(part: &str) -> bool {
    !part.is_empty() && !part.contains(SEPARATOR)
}
