//! Per-connection sync state machine.
//!
//! ```text
//!  CONNECTING ──start()──► SYNCING ──peer step 1 answered──► SYNCED
//!                             │      + peer step 2 applied      │
//!                             └──────────────┬──────────────────┘
//!                                            ▼
//!                                         CLOSED  (transport loss, Error, fatal violation)
//! ```
//!
//! The engine performs no I/O. It reads and mutates the document through a
//! [`Replica`] and returns [`Action`]s for its caller to carry out, so the
//! server connection loop and the client bridge share it.

use log::{debug, warn};
use zwriter_crdt::DecodeError;

use crate::error::CollabError;
use crate::protocol::SyncMessage;

/// Document access needed by the handshake.
pub trait Replica {
    fn state_vector(&self) -> Vec<u8>;
    fn encode_state_as_update(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DecodeError>;
    /// Merge an update, returning the number of newly integrated operations.
    fn apply_update(&self, update: &[u8]) -> Result<usize, DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Connecting,
    Syncing,
    Synced,
    Closed,
}

/// Work the caller must do after feeding the engine a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(SyncMessage),
    /// An update was merged; `0` when it only carried known operations.
    Applied(usize),
    /// Awareness message to store and relay; never touches the document.
    Awareness {
        connection_id: String,
        seq: u64,
        entry: Option<Vec<u8>>,
        principal: Option<String>,
    },
    /// The handshake completed in both directions.
    Synced,
}

#[derive(Debug)]
pub struct SyncEngine {
    state: SyncState,
    answered_step1: bool,
    applied_step2: bool,
    malformed: u32,
    max_malformed: u32,
}

impl SyncEngine {
    pub fn new(max_malformed: u32) -> Self {
        Self {
            state: SyncState::Connecting,
            answered_step1: false,
            applied_step2: false,
            malformed: 0,
            max_malformed,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn malformed_count(&self) -> u32 {
        self.malformed
    }

    /// Open the handshake by announcing our state vector.
    pub fn start<R: Replica>(&mut self, replica: &R) -> Result<Vec<Action>, CollabError> {
        if self.state != SyncState::Connecting {
            return Err(CollabError::ProtocolViolation(format!(
                "handshake started twice (state {:?})",
                self.state
            )));
        }
        self.state = SyncState::Syncing;
        Ok(vec![Action::Send(SyncMessage::sync_step1(replica.state_vector()))])
    }

    /// Process one decoded message from the peer.
    pub fn handle<R: Replica>(
        &mut self,
        replica: &R,
        msg: SyncMessage,
    ) -> Result<Vec<Action>, CollabError> {
        match self.state {
            SyncState::Connecting => {
                return Err(CollabError::ProtocolViolation(format!(
                    "{} received before the handshake started",
                    msg.kind()
                )))
            }
            SyncState::Closed => {
                return Err(CollabError::ProtocolViolation(format!(
                    "{} received after close",
                    msg.kind()
                )))
            }
            SyncState::Syncing | SyncState::Synced => {}
        }

        match msg {
            SyncMessage::SyncStep1 { state_vector } => {
                let update = match replica.encode_state_as_update(&state_vector) {
                    Ok(update) => update,
                    Err(e) => return Err(self.malformed(e)),
                };
                self.answered_step1 = true;
                let mut actions = vec![Action::Send(SyncMessage::sync_step2(update))];
                self.check_synced(&mut actions);
                Ok(actions)
            }
            SyncMessage::SyncStep2 { update } => {
                if !self.answered_step1 {
                    return Err(CollabError::ProtocolViolation(
                        "sync-step-2 received before the peer's sync-step-1".into(),
                    ));
                }
                let applied = match replica.apply_update(&update) {
                    Ok(applied) => applied,
                    Err(e) => return Err(self.malformed(e)),
                };
                self.applied_step2 = true;
                let mut actions = vec![Action::Applied(applied)];
                self.check_synced(&mut actions);
                Ok(actions)
            }
            SyncMessage::Awareness {
                connection_id,
                seq,
                entry,
                principal,
            } => Ok(vec![Action::Awareness {
                connection_id,
                seq,
                entry,
                principal,
            }]),
            SyncMessage::Error { code, message } => {
                self.state = SyncState::Closed;
                Err(CollabError::Peer { code, message })
            }
        }
    }

    /// Count a malformed payload. Returns the error to report: the decode
    /// error itself while under quota, `MalformedQuota` once exceeded.
    pub fn malformed(&mut self, err: DecodeError) -> CollabError {
        self.malformed += 1;
        if self.malformed > self.max_malformed {
            warn!("malformed quota exceeded ({} > {})", self.malformed, self.max_malformed);
            return CollabError::MalformedQuota {
                count: self.malformed,
                limit: self.max_malformed,
            };
        }
        debug!("malformed payload {}/{}: {err}", self.malformed, self.max_malformed);
        CollabError::Decode(err)
    }

    /// Move to CLOSED. Returns false if already closed.
    pub fn close(&mut self) -> bool {
        let was_open = self.state != SyncState::Closed;
        self.state = SyncState::Closed;
        was_open
    }

    fn check_synced(&mut self, actions: &mut Vec<Action>) {
        if self.state == SyncState::Syncing && self.answered_step1 && self.applied_step2 {
            self.state = SyncState::Synced;
            actions.push(Action::Synced);
        }
    }
}
