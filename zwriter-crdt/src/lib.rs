//! # zwriter-crdt: replicated document model for ZWriter collaboration
//!
//! A sequence CRDT in the RGA family. Every change is an immutable operation
//! tagged with `(replica, counter)`; replicas exchange operations as encoded
//! [`Update`]s and converge to the same text regardless of delivery order.
//!
//! ## Architecture
//!
//! ```text
//!  local edit ──► Document::insert/delete/format ──► Update (bincode)
//!                        │                              │
//!                        ▼                              ▼
//!                 observers (Local)               peer.apply_update
//!                                                       │
//!                                     ┌─────────────────┴──────┐
//!                                     ▼                        ▼
//!                            deps present: integrate   deps missing: pending
//! ```
//!
//! ## Modules
//!
//! - [`id`]: replica ids, operation ids, Lamport stamps
//! - [`state_vector`]: per-replica causal summary
//! - [`op`]: operations and the update wire codec
//! - [`doc`]: the [`Document`] itself
//!
//! ## Ordering
//!
//! Concurrent inserts after the same element are ordered by descending
//! `(lamport, replica, counter)`: at equal Lamport time the higher replica id
//! ends up first. Two replicas 1 and 2 typing "hello" and "world" at the start
//! of an empty document converge to `"worldhello"`.
//!
//! ## Limits
//!
//! Remote updates are checked before they touch the document. An update is
//! rejected whole when an operation's Lamport time lies more than
//! [`MAX_CLOCK_JUMP`] ahead of the local clock, or when it would leave more
//! than [`MAX_PENDING_OPS`] operations waiting for dependencies. Local edits
//! stop once the clock reaches [`MAX_LAMPORT`].

pub mod doc;
pub mod error;
pub mod id;
pub mod op;
pub mod state_vector;

pub use doc::{Document, Origin, SubscriptionId, UpdateEvent, MAX_CLOCK_JUMP, MAX_PENDING_OPS};
pub use error::DecodeError;
pub use id::{OpId, ReplicaId, Stamp};
pub use op::{Op, OpKind, Update, MAX_LAMPORT};
pub use state_vector::StateVector;
