//! Verification state machine
//!
//! Each peer is in one of four states, {unverified, verified} × {offline,
//! online}, and cycles between them forever. Every transition goes through
//! this service so the stored state and the notifications sent about it
//! never drift apart within a call.

use std::sync::Arc;

use tracing::{debug, info, warn};

use peerbook_core::{flag, parse_flag, Clock, Peer, PeerbookError, PresenceUpdate, Result, StatusMessage};

use crate::directory::PeerDirectory;
use crate::messages::SignalMessage;
use crate::notifier::PresenceNotifier;

pub struct VerificationService {
    directory: Arc<PeerDirectory>,
    notifier: Arc<dyn PresenceNotifier>,
    clock: Arc<dyn Clock>,
}

impl VerificationService {
    pub fn new(
        directory: Arc<PeerDirectory>,
        notifier: Arc<dyn PresenceNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory,
            notifier,
            clock,
        }
    }

    /// Current online flag; a read failure counts as offline
    fn online(&self, fp: &str) -> bool {
        match self.directory.field(fp, "online") {
            Ok(value) => parse_flag(&value).unwrap_or(false),
            Err(e) => {
                warn!("Failed to read online flag of {}, assuming offline: {}", fp, e);
                false
            }
        }
    }

    /// Set or revoke a peer's verification and tell everyone who cares
    ///
    /// An online peer hears about its own transition first (200 plus its
    /// sibling list, or 401). Then every session of the owner gets the
    /// presence update.
    pub fn verify_peer(&self, fp: &str, verified: bool) -> Result<()> {
        if !self.directory.peer_exists(fp)? {
            return Err(PeerbookError::not_found(format!("peer:{fp}")));
        }
        let online = self.online(fp);

        if verified {
            self.directory.set_fields(
                fp,
                &[
                    ("verified", flag(true)),
                    ("verified_on", self.clock.now().to_string()),
                ],
            )?;
            if online {
                self.notifier
                    .notify_session(fp, SignalMessage::status(StatusMessage::verified()));
                info!("Sent a 200 to {} - a newly verified peer", fp);
            }
        } else {
            self.directory.set_fields(fp, &[("verified", flag(false))])?;
            if online {
                self.notifier
                    .notify_session(fp, SignalMessage::status(StatusMessage::revoked()));
                info!("Sent a 401 to {} - verification revoked", fp);
            }
        }

        self.notifier.mark_verified(fp, verified);

        let user = self.directory.owner(fp)?;
        if verified && online && !user.is_empty() {
            let peers = self.directory.users_peers(&user)?;
            self.notifier
                .notify_session(fp, SignalMessage::Peers { peers });
        }

        self.publish(fp, &user, verified, online);
        Ok(())
    }

    /// Pure read of the verified flag; a read failure counts as unverified
    pub fn is_verified(&self, fp: &str) -> bool {
        match self.directory.field(fp, "verified") {
            Ok(value) => parse_flag(&value).unwrap_or(false),
            Err(e) => {
                warn!("Failed to get 'verified' field for peer:{}: {}", fp, e);
                false
            }
        }
    }

    /// Connection lifecycle: record presence and fan it out
    pub fn set_online(&self, fp: &str, online: bool) -> Result<()> {
        if !self.directory.peer_exists(fp)? {
            return Err(PeerbookError::not_found(format!("peer:{fp}")));
        }
        let mut fields = vec![("online", flag(online))];
        if online {
            fields.push(("last_connect", self.clock.now().to_string()));
        }
        self.directory.set_fields(fp, &fields)?;

        let user = self.directory.owner(fp)?;
        let verified = self.is_verified(fp);
        self.publish(fp, &user, verified, online);
        Ok(())
    }

    /// Gate for relaying offers and answers: both ends verified, same user
    pub fn authorize_relay(&self, source: &str, target: &str) -> Result<(Peer, Peer)> {
        let from = self.directory.get_peer(source)?;
        let to = self.directory.get_peer(target)?;

        if !from.verified {
            return Err(PeerbookError::invalid(format!("peer {source} is not verified")));
        }
        if !to.verified {
            return Err(PeerbookError::invalid(format!("peer {target} is not verified")));
        }
        if from.user.is_empty() || from.user != to.user {
            return Err(PeerbookError::invalid(format!(
                "peers {source} and {target} belong to different users"
            )));
        }
        Ok((from, to))
    }

    fn publish(&self, fp: &str, user: &str, verified: bool, online: bool) {
        if user.is_empty() {
            debug!("Peer {} has no user, nobody to tell", fp);
            return;
        }
        self.notifier.broadcast_presence(&PresenceUpdate {
            user: user.to_string(),
            fp: fp.to_string(),
            verified,
            online,
        });
    }
}
