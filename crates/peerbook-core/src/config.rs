//! Configuration system for Peerbook
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/peerbook/config.toml
//! - Linux: ~/.config/peerbook/config.toml
//! - Windows: %APPDATA%/peerbook/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    CREDENTIAL_LIFETIME_SECS, DEFAULT_TURN_SECRET, EMAIL_INTERVAL_SECS, MAX_PEERS_PER_USER,
    TOKEN_LEN, TOKEN_TTL_SECS, TURN_SECRET_ENV, USER_ID_LEN,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Key-value store settings
    pub store: StoreConfig,
    /// Quotas and expiries
    pub limits: LimitsConfig,
    /// TURN credential settings
    pub turn: TurnConfig,
    /// Logging settings
    pub log: LogConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for both HTTP and WebSocket traffic
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Public URL (for links handed to clients)
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 17777,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_url: None,
        }
    }
}

/// Key-value store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database path (None = in-memory)
    pub db_path: Option<PathBuf>,
    /// Maximum pooled connections
    pub pool_size: usize,
    /// Keys returned per scan page
    pub scan_page_size: usize,
    /// How long a connection waits on a locked database
    pub busy_timeout_ms: u64,
    /// How long a caller waits for a free pooled connection
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            pool_size: 5,
            scan_page_size: 10,
            busy_timeout_ms: 5_000,
            acquire_timeout_ms: 10_000,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Quotas and expiries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum peers per user
    pub max_peers_per_user: usize,
    /// Verification token length in bytes
    pub token_len: usize,
    /// Verification token lifetime in seconds
    pub token_ttl_secs: u64,
    /// Minimum seconds between two emails to one address
    pub email_interval_secs: u64,
    /// User id length in bytes
    pub user_id_len: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_peers_per_user: MAX_PEERS_PER_USER,
            token_len: TOKEN_LEN,
            token_ttl_secs: TOKEN_TTL_SECS,
            email_interval_secs: EMAIL_INTERVAL_SECS,
            user_id_len: USER_ID_LEN,
        }
    }
}

/// TURN credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Shared secret with the relay (TURN_SECRET_KEY overrides it)
    pub secret: Option<String>,
    /// Credential lifetime in seconds
    pub credential_lifetime_secs: i64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            secret: None,
            credential_lifetime_secs: CREDENTIAL_LIFETIME_SECS,
        }
    }
}

impl TurnConfig {
    /// Secret in effect: environment, then config file, then the development default
    pub fn effective_secret(&self) -> String {
        match std::env::var(TURN_SECRET_ENV) {
            Ok(secret) if !secret.is_empty() => secret,
            _ => self.secret.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| {
                warn!("No TURN secret configured, using the development default");
                DEFAULT_TURN_SECRET.to_string()
            }),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when RUST_LOG is not set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load `path`, else the default path, else the defaults
    ///
    /// A file that exists but cannot be read or parsed is an error.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "peerbook", "peerbook")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
}
