//! Peerbook Signal
//!
//! Presence and trust broker for WebRTC peers. Tracks which peers belong to
//! which user, whether each is online and verified, and issues time-boxed
//! relay credentials.
//!
//! # Protocol
//!
//! 1. A peer opens a WebSocket and sends `register` with its fingerprint
//! 2. The broker stores it, marks it online and replies with its status
//! 3. Verified peers get their user's peer list and live presence updates
//! 4. Offers and answers are relayed between verified peers of one user
//! 5. On disconnect the peer is marked offline

use std::sync::Arc;

use peerbook_core::{Clock, Config, CredentialIssuer};

pub mod directory;
pub mod hub;
pub mod ice;
pub mod keys;
pub mod messages;
pub mod notifier;
pub mod server;
pub mod store;
pub mod tokens;
pub mod users;
pub mod verification;

pub use directory::PeerDirectory;
pub use hub::SessionHub;
pub use ice::IceRegistry;
pub use messages::SignalMessage;
pub use notifier::PresenceNotifier;
pub use server::PeerbookServer;
pub use store::{SetAdd, Store, StoreError};
pub use tokens::TokenService;
pub use users::UserDirectory;
pub use verification::VerificationService;

/// Every broker service, wired to one store and one session hub
pub struct Broker {
    pub store: Arc<Store>,
    pub directory: Arc<PeerDirectory>,
    pub users: UserDirectory,
    pub tokens: TokenService,
    pub verification: VerificationService,
    pub ice: IceRegistry,
    pub hub: Arc<SessionHub>,
}

impl Broker {
    pub fn new(store: Arc<Store>, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let limits = &config.limits;
        let directory = Arc::new(PeerDirectory::new(store.clone(), limits.max_peers_per_user));
        let hub = Arc::new(SessionHub::new());
        let issuer = CredentialIssuer::with_lifetime(
            config.turn.effective_secret(),
            config.turn.credential_lifetime_secs,
        );

        Self {
            users: UserDirectory::new(store.clone(), limits.user_id_len),
            tokens: TokenService::new(store.clone(), limits),
            verification: VerificationService::new(directory.clone(), hub.clone(), clock),
            ice: IceRegistry::new(store.clone(), issuer),
            directory,
            hub,
            store,
        }
    }
}
