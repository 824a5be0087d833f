//! Per-replica summary of causal knowledge.
//!
//! Maps each replica to the highest counter that has been *contiguously*
//! integrated. Operations buffered out of order are not reflected here, so a
//! peer diffing against this vector always receives everything we lack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DecodeError;
use crate::id::{OpId, ReplicaId};
use crate::op::{encode_to_vec, wire_config};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest integrated counter for `replica` (0 = nothing seen).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    /// Whether the operation `id` is covered by this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        id.counter <= self.get(id.replica)
    }

    /// Record `id` as integrated. Counters never move backwards.
    pub fn advance(&mut self, id: OpId) {
        let entry = self.0.entry(id.replica).or_insert(0);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    /// True when every operation covered by `other` is also covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(replica, counter)| self.get(*replica) >= *counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(r, c)| (*r, *c))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (sv, read): (StateVector, usize) =
            bincode::serde::decode_from_slice(bytes, wire_config())?;
        if read != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - read));
        }
        Ok(sv)
    }
}
