//! Peer directory: peer records and per-user peer sets
//!
//! The user's peer set is the source of truth for "does this user have this
//! peer". Membership is capped at the configured maximum using the store's
//! atomic capped add, so concurrent registrations cannot overshoot it.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use peerbook_core::{Peer, PeerbookError, Result};

use crate::keys;
use crate::store::{SetAdd, Store};

/// CRUD over peers and user → peer membership
pub struct PeerDirectory {
    store: Arc<Store>,
    max_peers: usize,
}

impl PeerDirectory {
    pub fn new(store: Arc<Store>, max_peers: usize) -> Self {
        Self { store, max_peers }
    }

    /// Add or overwrite a peer, claiming a slot in its owner's peer set
    ///
    /// Every field of an existing record is overwritten. The owner may not
    /// change this way: re-assigning a peer requires removing it first.
    /// A user at the cap is refused outright, even for a peer it already has.
    pub fn add_peer(&self, peer: &Peer) -> Result<()> {
        if peer.fp.is_empty() {
            return Err(PeerbookError::invalid("peer fingerprint is empty"));
        }
        let key = keys::peer(&peer.fp);

        match self.store.hash_get_field(&key, "user") {
            Ok(owner) if !owner.is_empty() && owner != peer.user => {
                return Err(PeerbookError::invalid(format!(
                    "peer {} is already owned by {:?}",
                    peer.fp, owner
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if !peer.user.is_empty() {
            let set_key = keys::peer_set(&peer.user);
            match self.store.set_add_capped(&set_key, &peer.fp, self.max_peers)? {
                SetAdd::Full => {
                    warn!("User {} has too many peers, rejecting {}", peer.user, peer.fp);
                    return Err(PeerbookError::QuotaExceeded {
                        user: peer.user.clone(),
                        max: self.max_peers,
                    });
                }
                SetAdd::Added => debug!("Peer {} added to user {}", peer.fp, peer.user),
                SetAdd::Present => {}
            }
        }

        self.store.hash_set(&key, &peer.to_fields())?;
        info!("Peer {} stored (user {:?}, kind {:?})", peer.fp, peer.user, peer.kind);
        Ok(())
    }

    pub fn get_peer(&self, fp: &str) -> Result<Peer> {
        let key = keys::peer(fp);
        let fields = self.store.hash_get_all(&key)?;
        if fields.is_empty() {
            return Err(PeerbookError::not_found(key));
        }
        Ok(Peer::from_fields(&fields))
    }

    /// Whether a record exists, verified or not
    pub fn peer_exists(&self, fp: &str) -> Result<bool> {
        Ok(self.store.exists(&keys::peer(fp))?)
    }

    /// Remove the peer record only; the owner's peer set keeps the fingerprint
    pub fn delete_peer(&self, fp: &str) -> Result<()> {
        self.store.delete(&keys::peer(fp))?;
        info!("Peer {} deleted", fp);
        Ok(())
    }

    /// Remove the peer record together with its membership in the owner's set
    pub fn delete_peer_and_membership(&self, fp: &str) -> Result<()> {
        let owner = match self.store.hash_get_field(&keys::peer(fp), "user") {
            Ok(owner) => owner,
            Err(e) if e.is_not_found() => String::new(),
            Err(e) => return Err(e.into()),
        };
        if !owner.is_empty() {
            self.remove_peer_from_user(&owner, fp)?;
        }
        self.delete_peer(fp)
    }

    /// Drop a fingerprint from a user's peer set; returns whether it was there
    pub fn remove_peer_from_user(&self, user: &str, fp: &str) -> Result<bool> {
        let removed = self.store.set_remove(&keys::peer_set(user), fp)?;
        if removed {
            debug!("Peer {} removed from user {}", fp, user);
        }
        Ok(removed)
    }

    pub fn rename_peer(&self, fp: &str, name: &str) -> Result<()> {
        let key = keys::peer(fp);
        if !self.store.exists(&key)? {
            return Err(PeerbookError::not_found(key));
        }
        self.store.hash_set(&key, &[("name", name.to_string())])?;
        Ok(())
    }

    /// The peer's owning user; a missing or unreadable owner is a data-integrity fault
    pub fn owner(&self, fp: &str) -> Result<String> {
        self.store
            .hash_get_field(&keys::peer(fp), "user")
            .map_err(|e| {
                error!("Failed to read the user of peer {}: {}", fp, e);
                PeerbookError::LookupFailure {
                    fingerprint: fp.to_string(),
                    field: "user",
                }
            })
    }

    pub(crate) fn field(&self, fp: &str, field: &str) -> Result<String> {
        Ok(self.store.hash_get_field(&keys::peer(fp), field)?)
    }

    pub(crate) fn set_fields(&self, fp: &str, fields: &[(&str, String)]) -> Result<()> {
        Ok(self.store.hash_set(&keys::peer(fp), fields)?)
    }

    pub fn user_fingerprints(&self, user: &str) -> Result<BTreeSet<String>> {
        Ok(self.store.set_members(&keys::peer_set(user))?)
    }

    /// Load every peer in a user's set, skipping records that cannot be read
    pub fn users_peers(&self, user: &str) -> Result<Vec<Peer>> {
        let mut peers = Vec::new();
        for fp in self.user_fingerprints(user)? {
            match self.get_peer(&fp) {
                Ok(peer) => peers.push(peer),
                Err(e) => warn!("Failed to read peer {} of user {}: {}", fp, user, e),
            }
        }
        Ok(peers)
    }

    /// Mark every stored peer offline, recovering from an unclean shutdown
    pub fn reset_all_online(&self) -> Result<usize> {
        let keys = self.store.scan_keys_matching(keys::PEER_PATTERN)?;
        let mut reset = 0;
        for key in &keys {
            match self.store.hash_set(key, &[("online", "0".to_string())]) {
                Ok(()) => reset += 1,
                Err(e) => error!("Failed to set {} online to false: {}", key, e),
            }
        }
        info!("Reset online flag on {} of {} peers", reset, keys.len());
        Ok(reset)
    }
}
