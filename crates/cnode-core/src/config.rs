//! Configuration system for cnode.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CNODE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cnode/config.toml
//!   3. ~/.config/cnode/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub identity: IdentityConfig,
    pub transport: TransportConfig,
    pub board: BoardSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Explicit node id. Empty = load from `node_id_path`, generating on first run.
    pub node_id: String,
    /// File holding the persisted node id.
    pub node_id_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// IPv4 multicast group and port shared by every node on the link.
    pub multicast_addr: String,
    /// IPv4 address of the interface to join the group on. Empty = any.
    pub interface: String,
    /// Key expression this node listens on.
    pub subscribe_key: String,
    /// Key this node publishes replies on.
    pub reply_key: String,
    /// Key this node publishes its own requests on.
    pub request_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    /// Board-wide task capacity.
    pub max_tasks: usize,
    /// Live instances allowed per task.
    pub max_instances_per_task: usize,
    /// Decoded commands waiting for the dispatcher. Overflow is dropped.
    pub inbound_queue_capacity: usize,
    /// How long a result request waits for the instance to finish. 0 = forever.
    pub result_timeout_ms: u64,
}

impl BoardSettings {
    /// `None` when result requests wait forever.
    pub fn result_timeout(&self) -> Option<Duration> {
        (self.result_timeout_ms > 0).then(|| Duration::from_millis(self.result_timeout_ms))
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Reference board limits.
pub const DEFAULT_MAX_TASKS: usize = 20;
pub const DEFAULT_MAX_INSTANCES: usize = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;
pub const DEFAULT_RESULT_TIMEOUT_MS: u64 = 10_000;

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_id_path: config_dir().join("node_id"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            multicast_addr: "224.0.0.224:7446".to_string(),
            interface: String::new(),
            subscribe_key: "app/**".to_string(),
            reply_key: "app/replies/up".to_string(),
            request_key: "app/requests/up".to_string(),
        }
    }
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            max_tasks: DEFAULT_MAX_TASKS,
            max_instances_per_task: DEFAULT_MAX_INSTANCES,
            inbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            result_timeout_ms: DEFAULT_RESULT_TIMEOUT_MS,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cnode")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid board settings: {0}")]
    InvalidBoard(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl NodeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            NodeConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CNODE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&NodeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Zero capacities would make the board unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.board.max_tasks == 0 {
            return Err(ConfigError::InvalidBoard("max_tasks must be at least 1"));
        }
        if self.board.max_instances_per_task == 0 {
            return Err(ConfigError::InvalidBoard(
                "max_instances_per_task must be at least 1",
            ));
        }
        if self.board.inbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidBoard(
                "inbound_queue_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Apply CNODE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("CNODE_IDENTITY__NODE_ID") {
            self.identity.node_id = v;
        }
        if let Some(v) = get("CNODE_TRANSPORT__MULTICAST_ADDR") {
            self.transport.multicast_addr = v;
        }
        if let Some(v) = get("CNODE_TRANSPORT__INTERFACE") {
            self.transport.interface = v;
        }
        if let Some(n) = get("CNODE_BOARD__MAX_TASKS").and_then(|v| v.parse().ok()) {
            self.board.max_tasks = n;
        }
        if let Some(n) = get("CNODE_BOARD__MAX_INSTANCES_PER_TASK").and_then(|v| v.parse().ok()) {
            self.board.max_instances_per_task = n;
        }
        if let Some(n) = get("CNODE_BOARD__INBOUND_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.board.inbound_queue_capacity = n;
        }
        if let Some(n) = get("CNODE_BOARD__RESULT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.board.result_timeout_ms = n;
        }
    }
}
