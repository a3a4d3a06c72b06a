//! Layered configuration for the pdnstore backend and clients.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (pdnstore.toml)
//! ```toml
//! [backend]
//! listen = "0.0.0.0:4242"
//! data_dir = "/var/lib/pdnstore"
//! batch_size = 100
//!
//! [storage]
//! write_buffer_mb = 64
//!
//! [[targets]]
//! name = "primary"
//! kind = "remote"
//! host = "backend-1:4242"
//! tags = ["internal"]
//!
//! [[targets]]
//! name = "local"
//! kind = "rocksdb"
//! db_path = "/var/lib/pdnstore/local"
//! ```
//!
//! Environment variables use the `PDNSTORE_` prefix and `__` between
//! nesting levels, e.g. `PDNSTORE_BACKEND__MAX_CONNECTIONS=128`.

mod defaults;

pub use defaults::*;

use crate::error::StoreError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendConfig,
    /// RocksDB storage tuning (advanced)
    pub storage: StorageConfig,
    /// Storage targets for fan-out clients
    pub targets: Vec<TargetConfig>,
}

impl StoreConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(StoreConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("PDNSTORE_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: StoreConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Reject target lists that cannot be wired up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(ConfigError::new("target without a name"));
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::new(format!(
                    "duplicate target name `{}`",
                    target.name
                )));
            }
            if target.kind.is_empty() {
                return Err(ConfigError::new(format!(
                    "target `{}` has no kind",
                    target.name
                )));
            }
            if target.kind == "remote" && target.host.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::new(format!(
                    "remote target `{}` requires a host",
                    target.name
                )));
            }
            if target.kind == "rocksdb" && target.db_path.is_none() {
                return Err(ConfigError::new(format!(
                    "rocksdb target `{}` requires a db_path",
                    target.name
                )));
            }
            if target.pool_min > target.pool_max {
                return Err(ConfigError::new(format!(
                    "target `{}`: pool_min exceeds pool_max",
                    target.name
                )));
            }
        }
        if self.backend.batch_size == 0 {
            return Err(ConfigError::new("backend.batch_size must be positive"));
        }
        Ok(())
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub listen: SocketAddr,
    /// Data directory for the RocksDB engine; in-memory when unset
    pub data_dir: Option<PathBuf>,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_connections: usize,
    /// Stream query results instead of bundling them
    pub stream_responses: bool,
    pub default_limit: usize,
    pub feed_capacity: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4242)),
            data_dir: None,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            stream_responses: DEFAULT_STREAM_RESPONSES,
            default_limit: DEFAULT_QUERY_LIMIT,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

/// RocksDB storage configuration (advanced).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Write buffer size in MB
    pub write_buffer_mb: usize,
    /// Maximum number of background compaction threads
    pub max_background_jobs: usize,
    /// LZ4 block compression
    pub compression: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            max_background_jobs: DEFAULT_BACKGROUND_JOBS,
            compression: DEFAULT_COMPRESSION,
        }
    }
}

/// One storage target a client writes to and queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: String,
    /// Registry key: `rocksdb`, `memory` or `remote`
    pub kind: String,
    pub host: Option<String>,
    pub db_path: Option<PathBuf>,
    /// Observations carrying any of these tags are routed here
    pub tags: Vec<String>,
    pub pool_min: usize,
    pub pool_max: usize,
    /// Dial a replacement after each query instead of returning the
    /// connection to the pool
    pub refill: bool,
    pub reconnect_delay_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            host: None,
            db_path: None,
            tags: Vec::new(),
            pool_min: DEFAULT_POOL_MIN,
            pool_max: DEFAULT_POOL_MAX,
            refill: false,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            write_timeout_secs: DEFAULT_CLIENT_WRITE_TIMEOUT_SECS,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_responses: Option<bool>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        StoreError::Config(e.message)
    }
}
