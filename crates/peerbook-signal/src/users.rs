//! User accounts and provisional ids

use std::sync::Arc;

use tracing::{debug, info};

use peerbook_core::crypto::random_string;
use peerbook_core::{flag, PeerbookError, Result, User};

use crate::keys;
use crate::store::Store;

pub struct UserDirectory {
    store: Arc<Store>,
    id_len: usize,
}

impl UserDirectory {
    pub fn new(store: Arc<Store>, id_len: usize) -> Self {
        Self { store, id_len }
    }

    /// Create an account for `email` and return its permanent id
    ///
    /// An existing account is reported as [`PeerbookError::UserExists`],
    /// which still carries the id.
    pub fn add_user(&self, email: &str) -> Result<String> {
        if email.is_empty() {
            return Err(PeerbookError::invalid("cannot add a user with an empty email"));
        }

        let key = keys::user_id(email);
        let id = random_string(self.id_len)?;
        if !self.store.set_if_absent(&key, &id, None)? {
            let existing = self.store.get_string(&key)?;
            return Err(PeerbookError::UserExists { id: existing });
        }

        self.store.hash_set(
            &keys::user(&id),
            &[("email", email.to_string()), ("active", flag(true))],
        )?;
        info!("User {} created for {}", id, email);
        Ok(id)
    }

    /// The id registered for `email`
    pub fn user_id(&self, email: &str) -> Result<String> {
        Ok(self.store.get_string(&keys::user_id(email))?)
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        let key = keys::user(id);
        let fields = self.store.hash_get_all(&key)?;
        if fields.is_empty() {
            return Err(PeerbookError::not_found(key));
        }
        Ok(User::from_fields(id, &fields))
    }

    pub fn set_user_active(&self, id: &str, active: bool) -> Result<()> {
        let key = keys::user(id);
        if !self.store.exists(&key)? {
            return Err(PeerbookError::not_found(key));
        }
        self.store.hash_set(&key, &[("active", flag(active))])?;
        debug!("User {} active = {}", id, active);
        Ok(())
    }

    /// Reserve a provisional identifier
    pub fn add_temp_id(&self, id: &str) -> Result<()> {
        Ok(self.store.set(&keys::temp_id(id), "1")?)
    }

    pub fn temp_id_exists(&self, id: &str) -> Result<bool> {
        Ok(self.store.exists(&keys::temp_id(id))?)
    }

    pub fn remove_temp_id(&self, id: &str) -> Result<()> {
        self.store.delete(&keys::temp_id(id))?;
        Ok(())
    }
}
