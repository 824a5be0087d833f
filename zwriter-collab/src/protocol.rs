//! Wire protocol for document synchronization.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`SyncMessage`]
//! (possibly wrapped by the frame codec, see [`crate::codec`]):
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ variant │ fields (varint lengths, raw byte payloads)   │
//! └─────────┴──────────────────────────────────────────────┘
//!   0 SyncStep1  state_vector
//!   1 SyncStep2  update
//!   2 Awareness  connection_id │ seq │ entry? │ principal?
//!   3 Error      code │ message
//! ```
//!
//! Document and connection identities live here as well since both appear
//! on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use zwriter_crdt::DecodeError;

use crate::error::CollabError;

/// Upper bound on the bytes bincode may consume for one message.
const DECODE_LIMIT: usize = 64 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<DECODE_LIMIT>()
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// "Here is what I have": the sender's encoded state vector.
    SyncStep1 { state_vector: Vec<u8> },
    /// Operations the receiver lacks. Also used for incremental updates.
    SyncStep2 { update: Vec<u8> },
    /// Presence change. `entry: None` removes the connection's entry.
    Awareness {
        connection_id: String,
        seq: u64,
        entry: Option<Vec<u8>>,
        principal: Option<String>,
    },
    /// Sent right before the sender closes the connection.
    Error { code: String, message: String },
}

impl SyncMessage {
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        SyncMessage::SyncStep1 { state_vector }
    }

    pub fn sync_step2(update: Vec<u8>) -> Self {
        SyncMessage::SyncStep2 { update }
    }

    /// Error message describing `err`.
    pub fn error(err: &CollabError) -> Self {
        SyncMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::SyncStep1 { .. } => "sync-step-1",
            SyncMessage::SyncStep2 { .. } => "sync-step-2",
            SyncMessage::Awareness { .. } => "awareness",
            SyncMessage::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| CollabError::Encode(format!("{}: {e}", self.kind())))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (msg, read): (SyncMessage, usize) =
            bincode::serde::decode_from_slice(bytes, wire_config())?;
        if read != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }
}

/// Server-assigned identity of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        ConnectionId(Uuid::from_u128(value))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ConnectionId)
    }
}

/// Opaque document key, 1..=128 characters of `[A-Za-z0-9._:-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub const MAX_LEN: usize = 128;

    pub fn parse(raw: &str) -> Result<Self, CollabError> {
        let valid = !raw.is_empty()
            && raw.len() <= Self::MAX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'-'));
        if valid {
            Ok(DocumentId(raw.to_string()))
        } else {
            Err(CollabError::InvalidDocumentId(raw.to_string()))
        }
    }

    /// Extract the id from a request path such as `/doc-1`.
    pub fn from_path(path: &str) -> Result<Self, CollabError> {
        Self::parse(path.strip_prefix('/').unwrap_or(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DocumentId {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
