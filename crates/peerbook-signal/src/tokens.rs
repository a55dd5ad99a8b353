//! Possession proofs: emailed tokens, QR verification and email rate limiting
//!
//! Tokens expire through the store's TTL only. Redeeming does not consume a
//! token; callers that need single use call [`TokenService::invalidate_token`].

use std::sync::Arc;

use tracing::{debug, warn};

use peerbook_core::crypto::random_string;
use peerbook_core::{LimitsConfig, PeerbookError, Result};

use crate::keys;
use crate::store::Store;

pub struct TokenService {
    store: Arc<Store>,
    token_len: usize,
    token_ttl_secs: u64,
    email_interval_secs: u64,
}

impl TokenService {
    pub fn new(store: Arc<Store>, limits: &LimitsConfig) -> Self {
        Self {
            store,
            token_len: limits.token_len,
            token_ttl_secs: limits.token_ttl_secs,
            email_interval_secs: limits.email_interval_secs,
        }
    }

    /// Create a short-lived token that unlocks `email`
    pub fn create_token(&self, email: &str) -> Result<String> {
        if email.is_empty() {
            return Err(PeerbookError::invalid(
                "cannot create a token for an empty email",
            ));
        }
        let token = random_string(self.token_len)?;
        self.store
            .set_with_expiry(&keys::token(&token), email, self.token_ttl_secs)?;
        debug!("Token created for {}", email);
        Ok(token)
    }

    /// The email a live token unlocks
    pub fn redeem_token(&self, token: &str) -> Result<String> {
        Ok(self.store.get_string(&keys::token(token))?)
    }

    pub fn invalidate_token(&self, token: &str) -> Result<()> {
        self.store.delete(&keys::token(token))?;
        Ok(())
    }

    /// Rate limiter: true at most once per interval for a given email
    ///
    /// A store failure reads as "do not send".
    pub fn can_send_email(&self, email: &str) -> bool {
        let key = keys::dont_send(email);
        match self
            .store
            .set_if_absent(&key, "1", Some(self.email_interval_secs))
        {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Failed to check if key {:?} exists: {}", key, e);
                false
            }
        }
    }

    pub fn set_qr_verified(&self, email: &str) -> Result<()> {
        Ok(self.store.set(&keys::qr_verified(email), "1")?)
    }

    /// A store failure reads as "not verified"
    pub fn is_qr_verified(&self, email: &str) -> bool {
        let key = keys::qr_verified(email);
        self.store.exists(&key).unwrap_or_else(|e| {
            warn!("Failed to check if key {:?} exists: {}", key, e);
            false
        })
    }
}
