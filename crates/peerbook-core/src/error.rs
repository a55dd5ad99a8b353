//! Error types for the Peerbook broker

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the broker
pub type Result<T> = std::result::Result<T, PeerbookError>;

/// Broker-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerbookError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("user {user} already has the maximum of {max} peers")]
    QuotaExceeded { user: String, max: usize },

    #[error("failed to read field {field:?} of peer {fingerprint}")]
    LookupFailure {
        fingerprint: String,
        field: &'static str,
    },

    #[error("store unavailable at key {key:?}: {reason}")]
    StoreUnavailable { key: String, reason: String },

    #[error("user already exists with id {id}")]
    UserExists { id: String },

    #[error("no ICE servers found")]
    NoIceServers,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PeerbookError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Whether the transport layer may retry the request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

impl From<getrandom::Error> for PeerbookError {
    fn from(e: getrandom::Error) -> Self {
        PeerbookError::Internal(format!("entropy source unavailable: {e}"))
    }
}

/// Wire error codes (sent to sessions and mapped to HTTP statuses)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    QuotaExceeded,
    LookupFailure,
    StoreUnavailable,
    UserExists,
    NoIceServers,
    Unauthorized,
    InternalError,
}

impl From<&PeerbookError> for ErrorCode {
    fn from(e: &PeerbookError) -> Self {
        match e {
            PeerbookError::InvalidInput(_) => ErrorCode::InvalidInput,
            PeerbookError::NotFound(_) => ErrorCode::NotFound,
            PeerbookError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            PeerbookError::LookupFailure { .. } => ErrorCode::LookupFailure,
            PeerbookError::StoreUnavailable { .. } => ErrorCode::StoreUnavailable,
            PeerbookError::UserExists { .. } => ErrorCode::UserExists,
            PeerbookError::NoIceServers => ErrorCode::NoIceServers,
            PeerbookError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Map error code to an HTTP status
impl ErrorCode {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidInput => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::QuotaExceeded => 403,
            ErrorCode::NotFound | ErrorCode::NoIceServers => 404,
            ErrorCode::UserExists => 409,
            ErrorCode::LookupFailure | ErrorCode::StoreUnavailable | ErrorCode::InternalError => {
                500
            }
        }
    }
}
