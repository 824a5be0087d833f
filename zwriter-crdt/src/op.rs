//! Operations and the update wire format.
//!
//! Wire format (bincode 2, standard config, varint integers):
//! ```text
//! Update ─► [op count] Op*
//! Op     ─► replica │ counter │ lamport │ kind tag │ kind fields
//! ```
//!
//! Decoding is bounded by [`DECODE_LIMIT`] and every operation is validated
//! before it reaches the document.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::id::{OpId, Stamp};

/// Upper bound on the bytes bincode may consume while decoding one payload.
pub const DECODE_LIMIT: usize = 64 * 1024 * 1024;

/// Largest Lamport time an operation may carry. Leaves the clock room to
/// keep counting locally after adopting any accepted remote time.
pub const MAX_LAMPORT: u64 = 1 << 62;

pub(crate) fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<DECODE_LIMIT>()
}

/// Encode plain data with the wire config.
///
/// Only derived `Serialize` impls over sized sequences reach this, and
/// bincode cannot fail on those when writing into a `Vec`.
pub(crate) fn encode_to_vec<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .expect("bincode encoding of plain data into a Vec is infallible")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert one character after `origin` (`None` = document start).
    Insert { origin: Option<OpId>, content: char },
    /// Tombstone the element created by `target`.
    Delete { target: OpId },
    /// Set (`Some`) or clear (`None`) an attribute on the element created by `target`.
    Format {
        target: OpId,
        key: String,
        value: Option<String>,
    },
}

/// A single immutable operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub lamport: u64,
    pub kind: OpKind,
}

impl Op {
    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.lamport, self.id.replica)
    }

    /// Operations that must be integrated before this one.
    pub fn dependencies(&self) -> impl Iterator<Item = OpId> {
        let reference = match &self.kind {
            OpKind::Insert { origin, .. } => *origin,
            OpKind::Delete { target } | OpKind::Format { target, .. } => Some(*target),
        };
        self.id.predecessor().into_iter().chain(reference)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let invalid = |reason: &'static str| -> Result<(), DecodeError> {
            Err(DecodeError::InvalidOp { id: self.id, reason })
        };
        if self.id.counter == 0 {
            return invalid("counter must start at 1");
        }
        if self.lamport == 0 {
            return invalid("lamport time must be positive");
        }
        if self.lamport > MAX_LAMPORT {
            return invalid("lamport time out of range");
        }
        match &self.kind {
            OpKind::Insert { origin: Some(origin), .. } if *origin == self.id => {
                invalid("insert cannot follow itself")
            }
            OpKind::Delete { target } | OpKind::Format { target, .. } if *target == self.id => {
                invalid("operation cannot target itself")
            }
            OpKind::Format { key, .. } if key.is_empty() => invalid("attribute key is empty"),
            _ => Ok(()),
        }
    }
}

/// A batch of operations exchanged between replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_to_vec(self)
    }

    /// Decode and validate an update payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (update, read): (Update, usize) =
            bincode::serde::decode_from_slice(bytes, wire_config())?;
        if read != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - read));
        }
        for op in &update.ops {
            op.validate()?;
        }
        Ok(update)
    }
}
