//! ICE server registry and per-request relay credentials

use std::sync::Arc;

use tracing::{debug, info};

use peerbook_core::{CredentialIssuer, IceServer, PeerbookError, RelayCredential, Result};

use crate::keys;
use crate::store::Store;

pub struct IceRegistry {
    store: Arc<Store>,
    issuer: CredentialIssuer,
}

impl IceRegistry {
    pub fn new(store: Arc<Store>, issuer: CredentialIssuer) -> Self {
        Self { store, issuer }
    }

    /// Admin population of `iceserver:<name>`
    pub fn put_ice_server(&self, name: &str, server: &IceServer) -> Result<()> {
        if name.is_empty() || server.urls.is_empty() {
            return Err(PeerbookError::invalid("ICE server needs a name and a url"));
        }
        self.store
            .hash_set(&keys::ice_server(name), &server.to_fields())?;
        info!("ICE server {} set to {} (active: {})", name, server.urls, server.active);
        Ok(())
    }

    /// Active entries as stored; relay entries are still credential templates
    pub fn list_active_ice_servers(&self) -> Result<Vec<IceServer>> {
        let mut servers = Vec::new();
        for key in self.store.scan_keys_matching(keys::ICE_SERVER_PATTERN)? {
            let server = IceServer::from_fields(&self.store.hash_get_all(&key)?);
            if server.active {
                servers.push(server);
            } else {
                debug!("Skipping inactive ICE server {}", key);
            }
        }
        Ok(servers)
    }

    pub fn issue_credential(&self, identity: &str) -> Result<RelayCredential> {
        self.issuer.issue(identity, self.store.clock().now())
    }

    /// Ready-to-use servers for `identity`
    ///
    /// Relay entries get a freshly derived credential, the rest carry only
    /// their url.
    pub fn ice_servers_for(&self, identity: &str) -> Result<Vec<IceServer>> {
        let servers = self.list_active_ice_servers()?;
        if servers.is_empty() {
            return Err(PeerbookError::NoIceServers);
        }

        let credential = if servers.iter().any(IceServer::is_relay) {
            if identity.is_empty() {
                return Err(PeerbookError::invalid(
                    "relay servers need an identity to issue credentials for",
                ));
            }
            Some(self.issue_credential(identity)?)
        } else {
            None
        };

        let mut ready = Vec::with_capacity(servers.len());
        for mut server in servers {
            match &credential {
                Some(relay) if server.is_relay() => {
                    server.username = relay.username.clone();
                    server.credential = relay.credential.clone();
                }
                _ => {
                    server.username.clear();
                    server.credential.clear();
                }
            }
            ready.push(server);
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_store;
    use peerbook_core::{Clock, ManualClock, CREDENTIAL_LIFETIME_SECS};

    fn registry() -> (IceRegistry, Arc<ManualClock>) {
        let (store, clock) = test_store();
        (IceRegistry::new(store, CredentialIssuer::new("thisisatest")), clock)
    }

    #[test]
    fn test_no_servers() {
        let (ice, _) = registry();
        assert_eq!(
            ice.ice_servers_for("a@b.com").unwrap_err(),
            PeerbookError::NoIceServers
        );

        ice.put_ice_server("old", &IceServer::new("stun:old.example.com", false))
            .unwrap();
        assert_eq!(
            ice.ice_servers_for("a@b.com").unwrap_err(),
            PeerbookError::NoIceServers
        );
    }

    #[test]
    fn test_only_active_servers_listed() {
        let (ice, _) = registry();
        ice.put_ice_server("a", &IceServer::new("stun:a.example.com", true))
            .unwrap();
        ice.put_ice_server("b", &IceServer::new("stun:b.example.com", false))
            .unwrap();

        let servers = ice.list_active_ice_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, "stun:a.example.com");
    }

    #[test]
    fn test_relay_entries_get_credentials() {
        let (ice, clock) = registry();
        ice.put_ice_server("relay", &IceServer::new("turn:relay.example.com:3478", true))
            .unwrap();
        let mut stun = IceServer::new("stun:stun.example.com:3478", true);
        stun.username = "leftover".into();
        ice.put_ice_server("stun", &stun).unwrap();

        let servers = ice.ice_servers_for("a@b.com").unwrap();
        assert_eq!(servers.len(), 2);

        let relay = servers.iter().find(|s| s.is_relay()).unwrap();
        let expected = ice.issue_credential("a@b.com").unwrap();
        assert_eq!(relay.username, expected.username);
        assert_eq!(relay.credential, expected.credential);
        assert_eq!(
            relay.username,
            format!("a@b.com:{}", clock.now() + CREDENTIAL_LIFETIME_SECS)
        );

        let plain = servers.iter().find(|s| !s.is_relay()).unwrap();
        assert!(plain.username.is_empty());
        assert!(plain.credential.is_empty());
    }

    #[test]
    fn test_relay_requires_identity() {
        let (ice, _) = registry();
        ice.put_ice_server("relay", &IceServer::new("turns:relay.example.com", true))
            .unwrap();
        assert!(matches!(
            ice.ice_servers_for(""),
            Err(PeerbookError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_stun_only_needs_no_identity() {
        let (ice, _) = registry();
        ice.put_ice_server("stun", &IceServer::new("stun:stun.example.com", true))
            .unwrap();
        assert_eq!(ice.ice_servers_for("").unwrap().len(), 1);
    }

    #[test]
    fn test_credential_is_deterministic_per_second() {
        let (ice, clock) = registry();
        let first = ice.issue_credential("x").unwrap();
        assert_eq!(ice.issue_credential("x").unwrap(), first);
        clock.advance(1);
        assert_ne!(ice.issue_credential("x").unwrap(), first);
    }
}
