use {
    crate::topology::{HostAndPort, TopologyError},
    serde::{Deserialize, Serialize},
    std::{collections::HashSet, path::Path, time::Duration},
    thiserror::Error,
};

pub const MIN_HOLD_TIMEOUT_SECS: u64 = 1;
pub const MAX_HOLD_TIMEOUT_SECS: u64 = 86_400;
pub const MIN_RETRY_SLEEP_MILLIS: u64 = 9;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

///
/// Construction-time configuration of a [`crate::client::LockClient`].
///
/// ```json
/// {
///   "shards": ["locks-a", "locks-b"],
///   "topology": { "kind": "sentinel", "peers": ["10.0.0.1:26379", "10.0.0.2:26379"] },
///   "password": "secret",
///   "lock": { "hold_timeout_secs": 30 }
/// }
/// ```
///
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Logical shard names, in routing order.
    pub shards: Vec<String>,
    pub topology: TopologyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Store index (Redis database number); ignored by etcd.
    #[serde(default)]
    pub database: i64,
    #[serde(default)]
    pub lock: LockOptions,
    #[serde(default)]
    pub failover: FailoverConfig,
}

///
/// Where shard masters come from.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyConfig {
    /// Masters are resolved and followed through discovery peers.
    Sentinel { peers: Vec<HostAndPort> },
    /// Fixed masters, one per shard name, never failed over.
    Static { masters: Vec<HostAndPort> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections checked out at once per shard.
    pub max_size: usize,
    /// Maximum idle connections kept per shard.
    pub max_idle: usize,
    /// How long a checkout waits for a free slot.
    pub checkout_timeout_ms: u64,
    /// Ping idle connections before handing them out.
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            max_idle: 8,
            checkout_timeout_ms: 2_000,
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

///
/// Per-lock timing. Values are clamped when a lock is built, see [`LockOptions::hold_timeout`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// How long an acquired lock may be held before others may treat it as stale.
    pub hold_timeout_secs: i64,
    /// Pause between acquisition attempts.
    pub retry_sleep_ms: i64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            hold_timeout_secs: MAX_HOLD_TIMEOUT_SECS as i64,
            retry_sleep_ms: MIN_RETRY_SLEEP_MILLIS as i64,
        }
    }
}

impl LockOptions {
    pub fn new(hold_timeout_secs: i64, retry_sleep_ms: i64) -> Self {
        Self {
            hold_timeout_secs,
            retry_sleep_ms,
        }
    }

    ///
    /// Hold timeout, taken in absolute value and clamped to `[1s, 86400s]`.
    ///
    pub fn hold_timeout(&self) -> Duration {
        let secs = self
            .hold_timeout_secs
            .unsigned_abs()
            .clamp(MIN_HOLD_TIMEOUT_SECS, MAX_HOLD_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }

    ///
    /// Retry sleep clamped to `[9ms, hold timeout]`.
    ///
    pub fn retry_sleep(&self) -> Duration {
        let max = self.hold_timeout().as_millis() as u64;
        let millis = self.retry_sleep_ms.max(0) as u64;
        Duration::from_millis(millis.clamp(MIN_RETRY_SLEEP_MILLIS, max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Failed discovery rounds tolerated during startup, shared by all shard names.
    pub startup_retries: usize,
    pub startup_backoff_ms: u64,
    /// Pause before a listener re-subscribes after losing its peer.
    pub resubscribe_backoff_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            startup_retries: 10,
            startup_backoff_ms: 1_000,
            resubscribe_backoff_ms: 5_000,
        }
    }
}

impl FailoverConfig {
    pub fn startup_backoff(&self) -> Duration {
        Duration::from_millis(self.startup_backoff_ms)
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

impl ClientConfig {
    pub fn new(shards: Vec<String>, topology: TopologyConfig) -> Self {
        Self {
            shards,
            topology,
            pool: PoolConfig::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            username: None,
            password: None,
            database: 0,
            lock: LockOptions::default(),
            failover: FailoverConfig::default(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards.is_empty() {
            return Err(ConfigError::Invalid("at least one shard name is required".into()));
        }
        let mut seen = HashSet::new();
        for name in &self.shards {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("shard names cannot be empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate shard name `{name}`")));
            }
        }
        match &self.topology {
            TopologyConfig::Sentinel { peers } if peers.is_empty() => {
                Err(ConfigError::Invalid("at least one discovery peer is required".into()))
            }
            TopologyConfig::Static { masters } if masters.len() != self.shards.len() => {
                Err(TopologyError::CardinalityMismatch {
                    expected: self.shards.len(),
                    actual: masters.len(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }
}
