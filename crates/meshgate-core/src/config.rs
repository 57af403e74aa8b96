//! Configuration system for meshgate.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHGATE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshgate/config.toml
//!   3. ~/.config/meshgate/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::MAX_CHUNK_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshgateConfig {
    pub identity: IdentityConfig,
    pub transport: TransportConfig,
    pub server: ServerConfig,
    pub streams: StreamsConfig,
    pub client: ClientConfig,
    pub proxy: ProxyConfig,
    pub discovery: DiscoveryConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the 32-byte identity seed (hex). Auto-generated on first run.
    pub seed_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP listen address for inbound queries.
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve inbound requests. When false the node only acts as a client.
    pub enabled: bool,
    /// Base URL of the HTTP origin being bridged.
    pub origin_url: String,
    /// Timeout for the upstream call up to response headers.
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Hard ceiling for a single chunk payload. Must equal the protocol
    /// maximum (131072) so no peer ever receives a short non-final chunk.
    pub chunk_ceiling: usize,
    /// Streams without a chunk request for this long are evicted.
    pub idle_timeout_secs: u64,
    /// Longest wait for the upstream to produce more body bytes.
    pub stall_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-query timeout.
    pub query_timeout_secs: u64,
    /// Chunk request retries before a stream is aborted.
    pub retries: u32,
    pub retry_backoff_ms: u64,
    /// Requested chunk size, at most 131072.
    pub max_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Run the local HTTP proxy front-end.
    pub enabled: bool,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base URL of the HTTP directory. Empty = use an in-process directory.
    pub directory_url: String,
    /// Endpoint advertised for this node. Empty = transport listen address.
    pub endpoint: String,
    /// Serve the in-process directory over HTTP on this port. 0 = off.
    pub serve_port: u16,
    pub publish_interval_secs: u64,
    pub validity_secs: u64,
    pub retry_backoff_secs: u64,
    pub max_attempts: u32,
    /// Limit for a single publish attempt.
    pub attempt_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Local control API port (127.0.0.1). 0 = off.
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            seed_path: config_dir().join("identity.seed"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7420".into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origin_url: "http://127.0.0.1:8080".into(),
            upstream_timeout_secs: 30,
        }
    }
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            chunk_ceiling: 128 * 1024,
            idle_timeout_secs: 60,
            stall_timeout_secs: 30,
            sweep_interval_secs: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: 10,
            retries: 3,
            retry_backoff_ms: 500,
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_port: 8119,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            directory_url: String::new(),
            endpoint: String::new(),
            serve_port: 0,
            publish_interval_secs: 60,
            validity_secs: 15 * 60,
            retry_backoff_secs: 5,
            max_attempts: 5,
            attempt_timeout_secs: 10,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9001 }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl ServerConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

impl StreamsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl ClientConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl DiscoveryConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }

    /// Directory to query for lookups: the remote directory if one is
    /// configured, else the locally served one.
    pub fn lookup_url(&self) -> Option<String> {
        if !self.directory_url.is_empty() {
            Some(self.directory_url.clone())
        } else if self.serve_port != 0 {
            Some(format!("http://127.0.0.1:{}", self.serve_port))
        } else {
            None
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshgate")
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
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeshgateConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a specific file without env overrides. Missing file = defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(MeshgateConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: MeshgateConfig =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject chunk sizes that would let a short chunk be mistaken for the
    /// last one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.chunk_ceiling != MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "streams.chunk_ceiling must be {MAX_CHUNK_SIZE}, got {}",
                self.streams.chunk_ceiling
            )));
        }
        if !(1..=MAX_CHUNK_SIZE).contains(&self.client.max_chunk_size) {
            return Err(ConfigError::Invalid(format!(
                "client.max_chunk_size must be within 1..={MAX_CHUNK_SIZE}, got {}",
                self.client.max_chunk_size
            )));
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MESHGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&MeshgateConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply MESHGATE_* overrides through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = lookup("MESHGATE_TRANSPORT__LISTEN_ADDR") {
            self.transport.listen_addr = v;
        }
        if let Some(v) = lookup("MESHGATE_SERVER__ENABLED") {
            self.server.enabled = flag(v);
        }
        if let Some(v) = lookup("MESHGATE_SERVER__ORIGIN_URL") {
            self.server.origin_url = v;
        }
        if let Some(v) = lookup("MESHGATE_PROXY__ENABLED") {
            self.proxy.enabled = flag(v);
        }
        if let Some(v) = lookup("MESHGATE_PROXY__LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.proxy.listen_port = p;
            }
        }
        if let Some(v) = lookup("MESHGATE_DISCOVERY__DIRECTORY_URL") {
            self.discovery.directory_url = v;
        }
        if let Some(v) = lookup("MESHGATE_DISCOVERY__ENDPOINT") {
            self.discovery.endpoint = v;
        }
        if let Some(v) = lookup("MESHGATE_DISCOVERY__SERVE_PORT") {
            if let Ok(p) = v.parse() {
                self.discovery.serve_port = p;
            }
        }
        if let Some(v) = lookup("MESHGATE_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
