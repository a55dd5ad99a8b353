//! Live session registry
//!
//! Maps each connected fingerprint to the outbound queue of its WebSocket.
//! A fingerprint has at most one session; a reconnect replaces the older
//! session, whose writer ends once its queue is dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use peerbook_core::PresenceUpdate;

use crate::messages::SignalMessage;
use crate::notifier::PresenceNotifier;

struct Session {
    id: u64,
    user: String,
    verified: bool,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

/// Handle returned to the connection that owns a session
pub struct SessionHandle {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<SignalMessage>,
    pub rx: mpsc::UnboundedReceiver<SignalMessage>,
}

#[derive(Default)]
pub struct SessionHub {
    sessions: DashMap<String, Session>,
    next_id: AtomicU64,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session for `fp`, replacing any previous one
    pub fn register(&self, fp: &str, user: &str, verified: bool) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.sessions.insert(
            fp.to_string(),
            Session {
                id,
                user: user.to_string(),
                verified,
                tx: tx.clone(),
            },
        );
        if previous.is_some() {
            debug!("Session for {} replaced", fp);
        }
        SessionHandle { id, tx, rx }
    }

    /// Detach session `id` of `fp`; returns false if a newer session took over
    pub fn unregister(&self, fp: &str, id: u64) -> bool {
        self.sessions.remove_if(fp, |_, s| s.id == id).is_some()
    }

    pub fn is_online(&self, fp: &str) -> bool {
        self.sessions.contains_key(fp)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl PresenceNotifier for SessionHub {
    fn notify_session(&self, fp: &str, message: SignalMessage) -> bool {
        match self.sessions.get(fp) {
            Some(session) => session.tx.send(message).is_ok(),
            None => {
                debug!("No live session for {}, dropping message", fp);
                false
            }
        }
    }

    fn mark_verified(&self, fp: &str, verified: bool) {
        if let Some(mut session) = self.sessions.get_mut(fp) {
            session.verified = verified;
        }
    }

    fn broadcast_presence(&self, update: &PresenceUpdate) {
        let mut delivered = 0;
        let recipients = self
            .sessions
            .iter()
            .filter(|s| s.verified && s.user == update.user);
        for session in recipients {
            if session
                .tx
                .send(SignalMessage::PeerUpdate(update.clone()))
                .is_ok()
            {
                delivered += 1;
            }
        }
        debug!(
            "Presence of {} sent to {} sessions of {}",
            update.fp, delivered, update.user
        );
    }
}
