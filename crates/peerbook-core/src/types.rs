//! Core data model: peers, users, ICE servers and presence updates
//!
//! Records are persisted as flat string hashes. Booleans are stored as
//! `"1"`/`"0"` and timestamps as Unix seconds, `0` meaning unset.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// Parse a stored flag, accepting the spellings other tools write
pub fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" | "" => Some(false),
        _ => None,
    }
}

/// Encode a flag for storage
pub fn flag(value: bool) -> String {
    let s = if value { "1" } else { "0" };
    s.to_string()
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> &'a str {
    fields.get(name).map(String::as_str).unwrap_or("")
}

fn field_flag(fields: &HashMap<String, String>, name: &str) -> bool {
    parse_flag(field(fields, name)).unwrap_or(false)
}

fn field_i64(fields: &HashMap<String, String>, name: &str) -> i64 {
    field(fields, name).parse().unwrap_or(0)
}

/// A device or app instance that can join WebRTC sessions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Fingerprint, the peer's sole identity
    pub fp: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Owning user id, empty for unclaimed peers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Category such as "webexec" or "terminal7"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub verified: bool,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub created_on: i64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub verified_on: i64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub last_connect: i64,

    #[serde(default)]
    pub online: bool,
}

impl Peer {
    /// A freshly registered peer: unverified and offline
    pub fn new(
        fp: impl Into<String>,
        name: impl Into<String>,
        user: impl Into<String>,
        kind: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            fp: fp.into(),
            name: name.into(),
            user: user.into(),
            kind: kind.into(),
            created_on: now,
            ..Self::default()
        }
    }

    /// Every field as stored in the peer hash
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("fp", self.fp.clone()),
            ("name", self.name.clone()),
            ("user", self.user.clone()),
            ("kind", self.kind.clone()),
            ("verified", flag(self.verified)),
            ("created_on", self.created_on.to_string()),
            ("verified_on", self.verified_on.to_string()),
            ("last_connect", self.last_connect.to_string()),
            ("online", flag(self.online)),
        ]
    }

    /// Rebuild a peer from its stored hash
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            fp: field(fields, "fp").to_string(),
            name: field(fields, "name").to_string(),
            user: field(fields, "user").to_string(),
            kind: field(fields, "kind").to_string(),
            verified: field_flag(fields, "verified"),
            created_on: field_i64(fields, "created_on"),
            verified_on: field_i64(fields, "verified_on"),
            last_connect: field_i64(fields, "last_connect"),
            online: field_flag(fields, "online"),
        }
    }
}

/// An account, keyed durably by its random id
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub active: bool,
}

impl User {
    pub fn from_fields(id: impl Into<String>, fields: &HashMap<String, String>) -> Self {
        Self {
            id: id.into(),
            email: field(fields, "email").to_string(),
            active: field_flag(fields, "active"),
        }
    }
}

/// A STUN or TURN server
///
/// TURN entries are templates: the credential is filled in per request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Named `urls` on the wire as in the W3C RTCIceServer dictionary
    pub urls: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,

    #[serde(skip)]
    pub active: bool,
}

impl IceServer {
    pub fn new(urls: impl Into<String>, active: bool) -> Self {
        Self {
            urls: urls.into(),
            active,
            ..Self::default()
        }
    }

    /// Whether this entry is a relay (TURN) rather than a plain reflector
    pub fn is_relay(&self) -> bool {
        self.urls.starts_with("turn:") || self.urls.starts_with("turns:")
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("urls", self.urls.clone()),
            ("username", self.username.clone()),
            ("credential", self.credential.clone()),
            ("active", flag(self.active)),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        Self {
            urls: field(fields, "urls").to_string(),
            username: field(fields, "username").to_string(),
            credential: field(fields, "credential").to_string(),
            active: field_flag(fields, "active"),
        }
    }
}

/// Status pushed to a single session, with HTTP status semantics
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub code: u16,
    pub text: String,
}

impl StatusMessage {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn verified() -> Self {
        Self::new(200, "peer is verified")
    }

    pub fn revoked() -> Self {
        Self::new(401, "peer's verification was revoked")
    }

    pub fn unverified() -> Self {
        Self::new(401, "peer is unverified")
    }
}

/// One peer's state, fanned out to all of its user's sessions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user: String,
    pub fp: String,
    pub verified: bool,
    pub online: bool,
}
