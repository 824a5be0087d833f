//! Error type shared by the server, the sync engine and the client bridge.
//!
//! Every variant maps to a stable wire code carried by
//! [`SyncMessage::Error`](crate::protocol::SyncMessage::Error) and to a
//! fatality flag deciding whether the connection survives it.

use std::time::Duration;
use thiserror::Error;
use zwriter_crdt::DecodeError;

#[derive(Debug, Error)]
pub enum CollabError {
    /// A payload could not be parsed. Counted against the malformed quota.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// An outbound message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    CapacityExceeded { size: usize, limit: usize },

    #[error("{count} malformed messages exceed the quota of {limit}")]
    MalformedQuota { count: u32, limit: u32 },

    #[error("persistence hook failed: {0}")]
    PersistenceHook(String),

    #[error("invalid document id {0:?}")]
    InvalidDocumentId(String),

    /// The peer sent an `Error` message.
    #[error("peer error {code}: {message}")]
    Peer { code: String, message: String },

    /// The outbound queue of a peer overflowed.
    #[error("outbound queue full")]
    SlowConsumer,

    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),

    #[error("connection closed")]
    ConnectionClosed,

    /// The local Lamport clock reached its ceiling; the replica can no
    /// longer create operations.
    #[error("document clock exhausted")]
    ClockExhausted,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollabError {
    /// Stable code sent to the peer in an `Error` message.
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::Decode(_) => "decode-error",
            CollabError::Encode(_) => "encode-error",
            CollabError::ProtocolViolation(_) => "protocol-violation",
            CollabError::Transport(_) | CollabError::ConnectionClosed => "transport-error",
            CollabError::CapacityExceeded { .. } | CollabError::SlowConsumer => {
                "capacity-exceeded"
            }
            CollabError::MalformedQuota { .. } => "malformed-quota",
            CollabError::PersistenceHook(_) => "persistence-hook",
            CollabError::InvalidDocumentId(_) => "invalid-document",
            CollabError::Peer { .. } => "peer-error",
            CollabError::IdleTimeout(_) => "idle-timeout",
            CollabError::ClockExhausted => "clock-exhausted",
            CollabError::Config(_) => "config-error",
            CollabError::Io(_) => "io-error",
        }
    }

    /// Whether the connection must be closed after this error.
    ///
    /// Single malformed payloads, hook failures and refused local edits are
    /// survived; everything else ends the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CollabError::Decode(_) | CollabError::PersistenceHook(_) | CollabError::ClockExhausted
        )
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
