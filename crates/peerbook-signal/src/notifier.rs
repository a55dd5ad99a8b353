//! Presence notifier: the seam between the broker and live sessions

use peerbook_core::PresenceUpdate;

use crate::messages::SignalMessage;

/// Delivers messages to connected sessions
///
/// Delivery is best effort. Notifying a fingerprint without a live session
/// is a no-op, not an error.
pub trait PresenceNotifier: Send + Sync {
    /// Deliver one message to a single session; returns whether it was queued
    fn notify_session(&self, fp: &str, message: SignalMessage) -> bool;

    /// Record a session's verification; broadcasts only reach verified sessions
    fn mark_verified(&self, fp: &str, verified: bool);

    /// Tell every verified session of `update.user` about one peer's new state
    fn broadcast_presence(&self, update: &PresenceUpdate);
}
