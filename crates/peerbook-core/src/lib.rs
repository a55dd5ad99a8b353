//! Peerbook Core - shared types, errors, configuration and relay credentials
//!
//! This crate contains the foundational pieces used by the Peerbook broker.
//! It has no dependencies on networking or database code.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, LimitsConfig, LogConfig, ServerConfig, StoreConfig, TurnConfig};
pub use crypto::{CredentialIssuer, RelayCredential};
pub use error::*;
pub use types::*;

/// Maximum number of peers a single user may own
pub const MAX_PEERS_PER_USER: usize = 10;

/// Verification token length in bytes (four thirds of that once encoded)
pub const TOKEN_LEN: usize = 30;

/// Verification token lifetime in seconds
pub const TOKEN_TTL_SECS: u64 = 300;

/// Minimum interval between two emails to the same address, in seconds
pub const EMAIL_INTERVAL_SECS: u64 = 60;

/// User id length in bytes
pub const USER_ID_LEN: usize = 10;

/// Relay credential lifetime in seconds (24 hours)
pub const CREDENTIAL_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// TURN secret used when neither the environment nor the config provides one
pub const DEFAULT_TURN_SECRET: &str = "thisisatest";

/// Environment variable overriding the configured TURN secret
pub const TURN_SECRET_ENV: &str = "TURN_SECRET_KEY";
