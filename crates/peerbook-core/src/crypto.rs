//! Cryptographic utilities for Peerbook
//!
//! Provides:
//! - Random URL-safe strings for tokens and user ids
//! - Time-boxed TURN relay credentials (HMAC-SHA1, the TURN REST scheme)

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::{PeerbookError, Result, CREDENTIAL_LIFETIME_SECS};

type HmacSha1 = Hmac<Sha1>;

/// Generate `n` random bytes and encode them as URL-safe base64
pub fn random_string(n: usize) -> std::result::Result<String, getrandom::Error> {
    let mut bytes = vec![0u8; n];
    getrandom::fill(&mut bytes)?;
    Ok(URL_SAFE.encode(bytes))
}

/// A username/password pair accepted by a TURN relay until the embedded expiry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayCredential {
    /// `<identity>:<expiry unix seconds>`
    pub username: String,
    /// base64(HMAC-SHA1(secret, username))
    pub credential: String,
}

impl RelayCredential {
    /// The expiry timestamp embedded in the username
    pub fn expires_at(&self) -> Option<i64> {
        self.username
            .rsplit_once(':')
            .and_then(|(_, ts)| ts.parse().ok())
    }
}

/// Derives relay credentials from a server-held secret
///
/// Derivation is a pure function of `(identity, now)`: two calls in the same
/// second yield the same credential. There is no revocation, the relay
/// rejects a credential once its embedded timestamp has passed.
#[derive(Clone)]
pub struct CredentialIssuer {
    secret: Vec<u8>,
    lifetime_secs: i64,
}

impl CredentialIssuer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self::with_lifetime(secret, CREDENTIAL_LIFETIME_SECS)
    }

    pub fn with_lifetime(secret: impl AsRef<[u8]>, lifetime_secs: i64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            lifetime_secs,
        }
    }

    /// Issue a credential for `identity` valid until `now + lifetime`
    pub fn issue(&self, identity: &str, now: i64) -> Result<RelayCredential> {
        let username = format!("{}:{}", identity, now + self.lifetime_secs);
        let mut mac = HmacSha1::new_from_slice(&self.secret)
            .map_err(|e| PeerbookError::Internal(format!("relay secret rejected: {e}")))?;
        mac.update(username.as_bytes());
        let credential = STANDARD.encode(mac.finalize().into_bytes());
        Ok(RelayCredential {
            username,
            credential,
        })
    }
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("secret", &"<redacted>")
            .field("lifetime_secs", &self.lifetime_secs)
            .finish()
    }
}
