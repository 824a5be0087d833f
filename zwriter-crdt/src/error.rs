use thiserror::Error;

use crate::id::OpId;

/// Rejected update or state vector payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid operation {id}: {reason}")]
    InvalidOp { id: OpId, reason: &'static str },
    #[error("{pending} buffered operations would exceed the limit of {limit}")]
    PendingOverflow { pending: usize, limit: usize },
}

impl From<bincode::error::DecodeError> for DecodeError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}
