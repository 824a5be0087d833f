//! Identifiers for replicas and operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Uniquely identifies one editing replica (a client document or a server room).
pub type ReplicaId = u64;

/// Draw a fresh random replica id.
pub fn random_replica() -> ReplicaId {
    let (hi, lo) = Uuid::new_v4().as_u64_pair();
    // zero is kept free so a default-constructed id is never a live replica
    (hi ^ lo).max(1)
}

/// Identity of a single operation: `counter` is strictly monotonic per replica,
/// starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// The operation issued just before this one by the same replica.
    pub fn predecessor(&self) -> Option<OpId> {
        (self.counter > 1).then(|| OpId::new(self.replica, self.counter - 1))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}

/// Lamport timestamp with the replica id as tie-breaker.
///
/// Field order matters: the derived `Ord` compares `lamport` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub lamport: u64,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(lamport: u64, replica: ReplicaId) -> Self {
        Self { lamport, replica }
    }
}
