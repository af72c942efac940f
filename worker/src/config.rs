use crate::error::ConfigError;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use vigil_lib::keys::IdentityKeys;

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_HIGH_TOLERANCE: f64 = 90.0;
pub const DEFAULT_STATE_ROOT: &str = ".data";

const WALLET_KEY_PREFIX: &str = "WALLET_KEY_";
const ENCRYPTION_KEY_PREFIX: &str = "ENCRYPTION_KEY_";

/// Protocol environment the workers talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Local,
    Dev,
    Production,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Local => "local",
            Network::Dev => "dev",
            Network::Production => "production",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Network::Local),
            "dev" => Ok(Network::Dev),
            "production" => Ok(Network::Production),
            _ => Err(invalid("VIGIL_NETWORK", value, "expected local, dev or production")),
        }
    }
}

/// Harness-wide settings, normally read from the environment.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub network: Network,
    /// Version tag every worker is pinned to when no explicit tag is given.
    pub forced_version: Option<String>,
    pub stream_timeout: Duration,
    /// Reception percentage at or above which a run counts as almost complete.
    pub high_tolerance: f64,
    pub init_timeout: Duration,
    pub state_root: PathBuf,
    identity_keys: HashMap<String, IdentityKeys>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            network: Network::Local,
            forced_version: None,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            high_tolerance: DEFAULT_HIGH_TOLERANCE,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            state_root: PathBuf::from(DEFAULT_STATE_ROOT),
            identity_keys: HashMap::new(),
        }
    }
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Builds a config from `(key, value)` pairs. Unset keys fall back to
    /// the defaults; malformed values are rejected.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let mut config = Self::default();

        if let Some(value) = vars.get("VIGIL_NETWORK") {
            config.network = value.parse()?;
        }
        if let Some(value) = vars.get("VIGIL_FORCE_VERSION") {
            let value = value.trim();
            if !value.is_empty() {
                config.forced_version = Some(value.to_string());
            }
        }
        if let Some(value) = vars.get("VIGIL_STREAM_TIMEOUT_MS") {
            config.stream_timeout = parse_millis("VIGIL_STREAM_TIMEOUT_MS", value)?;
        }
        if let Some(value) = vars.get("VIGIL_INIT_TIMEOUT_MS") {
            config.init_timeout = parse_millis("VIGIL_INIT_TIMEOUT_MS", value)?;
        }
        if let Some(value) = vars.get("VIGIL_HIGH_TOLERANCE") {
            let tolerance: f64 = value
                .trim()
                .parse()
                .map_err(|_| invalid("VIGIL_HIGH_TOLERANCE", value, "not a number"))?;
            if !(0.0..=100.0).contains(&tolerance) {
                return Err(invalid("VIGIL_HIGH_TOLERANCE", value, "must be within 0..=100"));
            }
            config.high_tolerance = tolerance;
        }
        if let Some(value) = vars.get("VIGIL_STATE_ROOT") {
            config.state_root = PathBuf::from(value);
        }

        for (key, signing_key) in &vars {
            let Some(suffix) = key.strip_prefix(WALLET_KEY_PREFIX) else {
                continue;
            };
            let encryption_var = format!("{}{}", ENCRYPTION_KEY_PREFIX, suffix);
            let Some(encryption_key) = vars.get(&encryption_var) else {
                return Err(invalid(key, "<redacted>", &format!("{} is not set", encryption_var)));
            };
            let keys = IdentityKeys::from_hex(signing_key, encryption_key)
                .map_err(|reason| invalid(key, "<redacted>", &reason))?;
            config.identity_keys.insert(suffix.to_ascii_lowercase(), keys);
        }

        Ok(config)
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_forced_version(mut self, tag: impl Into<String>) -> Self {
        self.forced_version = Some(tag.into());
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_high_tolerance(mut self, tolerance: f64) -> Self {
        self.high_tolerance = tolerance.clamp(0.0, 100.0);
        self
    }

    pub fn with_state_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.state_root = root.into();
        self
    }

    pub fn with_identity_keys(mut self, name: &str, keys: IdentityKeys) -> Self {
        self.identity_keys.insert(name.to_ascii_lowercase(), keys);
        self
    }

    /// Pre-provisioned keys for a logical worker name, if any.
    pub fn identity_keys_for(&self, name: &str) -> Option<&IdentityKeys> {
        self.identity_keys.get(&name.to_ascii_lowercase())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, value, "expected milliseconds"))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
