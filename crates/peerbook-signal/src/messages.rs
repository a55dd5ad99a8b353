//! Signal protocol messages

use serde::{Deserialize, Serialize};

use peerbook_core::{ErrorCode, Peer, PeerbookError, PresenceUpdate, StatusMessage};

/// Messages sent over the signaling WebSocket
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// First frame of every session: who is connecting
    Register {
        fp: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        kind: String,
        /// Owning user id
        #[serde(default)]
        user: String,
    },

    /// Verification status of the receiving peer
    Status(StatusMessage),

    /// All peers of the receiving peer's user
    Peers { peers: Vec<Peer> },

    /// One sibling peer changed state
    PeerUpdate(PresenceUpdate),

    /// Offer to relay to another peer
    Offer { target: String, offer: String },

    /// Answer to relay to another peer
    Answer { target: String, answer: String },

    /// Relayed offer, annotated with its source
    OfferFrom {
        source_name: String,
        source_fp: String,
        offer: String,
    },

    /// Relayed answer, annotated with its source
    AnswerFrom {
        source_name: String,
        source_fp: String,
        answer: String,
    },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Pong response
    Pong { timestamp: u64 },
}

impl SignalMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn status(status: StatusMessage) -> Self {
        Self::Status(status)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&PeerbookError> for SignalMessage {
    fn from(e: &PeerbookError) -> Self {
        Self::error(e.code(), e.to_string())
    }
}
