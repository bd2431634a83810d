//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading or writing the config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// TOML serialization error
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Serialize(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}

/// Local worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Number of worker threads (0 = one per logical core, capped at 4)
    #[serde(default)]
    pub workers: u32,
    /// Seconds to wait for graceful termination before force-killing
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Timeout for the source duration probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_probe_timeout_secs() -> u64 {
    30
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            grace_period_secs: default_grace_period_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Distributed client configuration: handshake/request timeouts, reconnect
/// backoff, and the persisted auto-connect list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedConfig {
    /// Timeout for opening a connection and completing the handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Timeout for ping/capability/other request-response exchanges
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Initial reconnect delay in milliseconds
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    /// Maximum reconnect delay in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Maximum reconnect attempts per address (negative = unbounded)
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: i64,
    /// Interval between health-check passes in seconds
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Addresses ("host:port") connected automatically at discovery startup
    #[serde(default)]
    pub auto_connect: Vec<String>,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_max_attempts() -> i64 {
    -1
}

fn default_ping_interval_secs() -> u64 {
    10
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
            auto_connect: Vec::new(),
        }
    }
}

/// Encode server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Human-readable server name announced in server_info
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Bind address for the WebSocket listener
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listener port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum concurrent jobs accepted by this server
    #[serde(default = "default_max_jobs")]
    pub max_jobs: u32,
    /// Path to the ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Working directory for transferred inputs and produced outputs
    /// (empty = system temp directory)
    #[serde(default)]
    pub work_dir: String,
}

fn default_server_name() -> String {
    "encode-server".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_jobs() -> u32 {
    2
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            bind: default_bind(),
            port: default_port(),
            max_jobs: default_max_jobs(),
            ffmpeg_path: default_ffmpeg_path(),
            work_dir: String::new(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist (first run)
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist the configuration back to a TOML file
    ///
    /// The discovery loop uses this to keep the auto-connect list current
    /// after add/remove operations.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FARM_POOL_WORKERS -> pool.workers
    /// - FARM_SERVER_PORT -> server.port
    /// - FARM_SERVER_MAX_JOBS -> server.max_jobs
    /// - FARM_FFMPEG_PATH -> server.ffmpeg_path
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("FARM_POOL_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.pool.workers = workers;
            }
        }

        if let Ok(val) = env::var("FARM_SERVER_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("FARM_SERVER_MAX_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.server.max_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("FARM_FFMPEG_PATH") {
            if !val.is_empty() {
                self.server.ffmpeg_path = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
