//! The replicated text document.
//!
//! A [`Document`] keeps every integrated operation in `history` (causal
//! order) and materializes inserts into a linked sequence indexed by
//! operation id, so integrating a remote insert costs one lookup plus the
//! concurrent siblings it has to skip. Remote operations whose dependencies
//! are missing wait in `pending`, keyed under the dependency they wait for,
//! until it arrives.
//!
//! Untrusted input is bounded before it touches the document: an update may
//! not push the Lamport clock more than [`MAX_CLOCK_JUMP`] ahead, nor leave
//! more than [`MAX_PENDING_OPS`] operations buffered.

use log::{debug, trace, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::DecodeError;
use crate::id::{random_replica, OpId, ReplicaId, Stamp};
use crate::op::{Op, OpKind, Update, MAX_LAMPORT};
use crate::state_vector::StateVector;

/// Operations that may wait for missing dependencies at any one time.
pub const MAX_PENDING_OPS: usize = 16_384;

/// How far ahead of the local clock a remote operation's Lamport time may be.
pub const MAX_CLOCK_JUMP: u64 = 1 << 32;

/// Who caused a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by this document's own editing methods.
    Local,
    /// Merged from an untagged remote update.
    Remote,
    /// Merged from a tagged source (the server tags by connection).
    Peer(u128),
}

/// Delivered to observers after a transaction integrated at least one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
    pub origin: Origin,
    /// Number of operations integrated by the transaction.
    pub applied: usize,
    /// Encoded [`Update`] holding exactly the integrated operations.
    pub update: Vec<u8>,
    /// Encoded [`Update`] holding the subset that was buffered by earlier
    /// transactions and only became ready now. The origin never sent these.
    pub backlog: Option<Vec<u8>>,
}

pub type SubscriptionId = u64;

type Observer = Box<dyn Fn(&UpdateEvent) + Send>;

#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    lamport: u64,
    content: char,
    deleted: bool,
    attributes: BTreeMap<String, (Stamp, Option<String>)>,
    /// Slot of the following element in sequence order.
    next: Option<usize>,
}

impl Element {
    /// Sibling order key: larger sorts further left.
    fn priority(&self) -> (u64, ReplicaId, u64) {
        (self.lamport, self.id.replica, self.id.counter)
    }
}

#[derive(Debug)]
struct Buffered {
    op: Op,
    transaction: u64,
}

pub struct Document {
    replica: ReplicaId,
    /// Highest Lamport time seen locally or remotely.
    lamport: u64,
    /// Element slots in arrival order; sequence order follows `head`/`next`.
    elements: Vec<Element>,
    head: Option<usize>,
    /// Insert id to its slot in `elements`.
    slots: HashMap<OpId, usize>,
    visible: usize,
    history: Vec<Op>,
    state: StateVector,
    pending: HashMap<OpId, Buffered>,
    /// Missing dependency to the buffered operations blocked on it.
    waiting: HashMap<OpId, Vec<OpId>>,
    transaction: u64,
    observers: Vec<(SubscriptionId, Observer)>,
    next_subscription: SubscriptionId,
}

impl Document {
    /// Create an empty document with a random replica id.
    pub fn new() -> Self {
        Self::with_replica(random_replica())
    }

    /// Create an empty document with an explicit replica id.
    ///
    /// The id must be unique among all replicas editing the same document.
    pub fn with_replica(replica: ReplicaId) -> Self {
        Self {
            replica,
            lamport: 0,
            elements: Vec::new(),
            head: None,
            slots: HashMap::new(),
            visible: 0,
            history: Vec::new(),
            state: StateVector::new(),
            pending: HashMap::new(),
            waiting: HashMap::new(),
            transaction: 0,
            observers: Vec::new(),
            next_subscription: 1,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Visible text.
    pub fn text(&self) -> String {
        self.sequence()
            .filter(|e| !e.deleted)
            .map(|e| e.content)
            .collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Attributes currently set on the visible character at `index`.
    pub fn attributes_at(&self, index: usize) -> BTreeMap<String, String> {
        self.sequence()
            .filter(|e| !e.deleted)
            .nth(index)
            .map(|e| {
                e.attributes
                    .iter()
                    .filter_map(|(k, (_, v))| v.clone().map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state
    }

    /// Snapshot of local causal knowledge, sent so a peer can reply with what we miss.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state.encode()
    }

    /// Operations received but still waiting for their dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Operations integrated so far.
    pub fn operation_count(&self) -> usize {
        self.history.len()
    }

    /// True once the Lamport clock cannot advance; local edits are refused.
    pub fn clock_exhausted(&self) -> bool {
        self.lamport >= MAX_LAMPORT
    }

    fn sequence(&self) -> impl Iterator<Item = &Element> + '_ {
        std::iter::successors(self.head.map(|slot| &self.elements[slot]), move |e| {
            e.next.map(|slot| &self.elements[slot])
        })
    }

    // ── Merging ────────────────────────────────────────────────────

    /// Merge a remote update. Already known operations are ignored.
    ///
    /// Returns the number of operations integrated by this call, which may
    /// include previously buffered operations unblocked by this update.
    /// A rejected update leaves the document untouched.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<usize, DecodeError> {
        self.apply_update_with_origin(update, Origin::Remote)
    }

    /// Like [`apply_update`](Self::apply_update), tagging the observer event with `origin`.
    pub fn apply_update_with_origin(
        &mut self,
        update: &[u8],
        origin: Origin,
    ) -> Result<usize, DecodeError> {
        let update = Update::decode(update)?;
        self.admit(&update)?;

        self.transaction += 1;
        let start = self.history.len();
        let mut backlog = Vec::new();
        for op in update.ops {
            self.receive(op, &mut backlog);
        }

        let applied = self.history.len() - start;
        if applied > 0 {
            debug!(
                "replica {} integrated {applied} ops ({} pending)",
                self.replica,
                self.pending.len()
            );
            if !self.observers.is_empty() {
                let update = Update::new(self.history[start..].to_vec()).encode();
                let backlog = (!backlog.is_empty()).then(|| Update::new(backlog).encode());
                self.notify(UpdateEvent {
                    origin,
                    applied,
                    update,
                    backlog,
                });
            }
        }
        Ok(applied)
    }

    /// Minimal update that brings a peer at `peer_state_vector` (empty when
    /// `None`) up to the current state.
    pub fn encode_state_as_update(
        &self,
        peer_state_vector: Option<&[u8]>,
    ) -> Result<Vec<u8>, DecodeError> {
        let peer = match peer_state_vector {
            Some(bytes) => StateVector::decode(bytes)?,
            None => StateVector::new(),
        };
        Ok(self.diff(&peer).encode())
    }

    /// Operations not covered by `peer`, in causal order.
    pub fn diff(&self, peer: &StateVector) -> Update {
        Update::new(
            self.history
                .iter()
                .filter(|op| !peer.contains(&op.id))
                .cloned()
                .collect(),
        )
    }

    /// Full state as a single update.
    pub fn snapshot(&self) -> Vec<u8> {
        self.diff(&StateVector::new()).encode()
    }

    /// Check an update against the clock and buffer limits without
    /// changing anything.
    ///
    /// Readiness is simulated in one pass over the update, which is exact
    /// for updates in causal order (everything this crate produces).
    fn admit(&self, update: &Update) -> Result<(), DecodeError> {
        let mut clock = self.lamport;
        let mut advanced: HashMap<ReplicaId, u64> = HashMap::new();
        let covered = |advanced: &HashMap<ReplicaId, u64>, id: &OpId| {
            self.state.contains(id) || advanced.get(&id.replica).is_some_and(|c| id.counter <= *c)
        };

        let mut blocked = 0;
        for op in &update.ops {
            if op.lamport > clock.saturating_add(MAX_CLOCK_JUMP) {
                return Err(DecodeError::InvalidOp {
                    id: op.id,
                    reason: "lamport time too far ahead",
                });
            }
            clock = clock.max(op.lamport);

            if covered(&advanced, &op.id) || self.pending.contains_key(&op.id) {
                continue;
            }
            if op.dependencies().all(|dep| covered(&advanced, &dep)) {
                advanced.insert(op.id.replica, op.id.counter);
            } else {
                blocked += 1;
            }
        }

        let pending = self.pending.len() + blocked;
        if pending > MAX_PENDING_OPS {
            return Err(DecodeError::PendingOverflow {
                pending,
                limit: MAX_PENDING_OPS,
            });
        }
        Ok(())
    }

    fn missing_dependency(&self, op: &Op) -> Option<OpId> {
        op.dependencies().find(|dep| !self.state.contains(dep))
    }

    fn receive(&mut self, op: Op, backlog: &mut Vec<Op>) {
        if self.state.contains(&op.id) || self.pending.contains_key(&op.id) {
            trace!("replica {} skipping known op {}", self.replica, op.id);
            return;
        }
        match self.missing_dependency(&op) {
            None => self.integrate_ready(op, backlog),
            Some(dep) => self.buffer(op, dep, self.transaction),
        }
    }

    fn buffer(&mut self, op: Op, dep: OpId, transaction: u64) {
        trace!("replica {} buffering {} until {dep}", self.replica, op.id);
        self.waiting.entry(dep).or_default().push(op.id);
        self.pending.insert(op.id, Buffered { op, transaction });
    }

    /// Integrate `op` and everything that was waiting on it, transitively.
    fn integrate_ready(&mut self, op: Op, backlog: &mut Vec<Op>) {
        let mut ready = vec![op];
        while let Some(op) = ready.pop() {
            let id = op.id;
            self.integrate(op);

            for blocked in self.waiting.remove(&id).unwrap_or_default() {
                let Some(Buffered { op, transaction }) = self.pending.remove(&blocked) else {
                    continue;
                };
                match self.missing_dependency(&op) {
                    Some(dep) => self.buffer(op, dep, transaction),
                    None => {
                        if transaction != self.transaction {
                            backlog.push(op.clone());
                        }
                        ready.push(op);
                    }
                }
            }
        }
    }

    fn integrate(&mut self, op: Op) {
        self.lamport = self.lamport.max(op.lamport);
        match &op.kind {
            OpKind::Insert { origin, content } => {
                self.integrate_insert(op.id, op.lamport, *origin, *content)
            }
            OpKind::Delete { target } => self.integrate_delete(*target),
            OpKind::Format { target, key, value } => {
                self.integrate_format(*target, op.stamp(), key, value)
            }
        }
        self.state.advance(op.id);
        self.history.push(op);
    }

    fn integrate_insert(&mut self, id: OpId, lamport: u64, origin: Option<OpId>, content: char) {
        // An origin that names a non-insert operation anchors at the start.
        let mut prev = origin.and_then(|o| self.slots.get(&o).copied());
        let priority = (lamport, id.replica, id.counter);
        loop {
            let next = match prev {
                Some(slot) => self.elements[slot].next,
                None => self.head,
            };
            match next {
                Some(slot) if self.elements[slot].priority() > priority => prev = Some(slot),
                _ => break,
            }
        }

        let slot = self.elements.len();
        let next = match prev {
            Some(p) => self.elements[p].next.replace(slot),
            None => self.head.replace(slot),
        };
        self.elements.push(Element {
            id,
            lamport,
            content,
            deleted: false,
            attributes: BTreeMap::new(),
            next,
        });
        self.slots.insert(id, slot);
        self.visible += 1;
    }

    fn integrate_delete(&mut self, target: OpId) {
        if let Some(&slot) = self.slots.get(&target) {
            let element = &mut self.elements[slot];
            if !element.deleted {
                element.deleted = true;
                self.visible -= 1;
            }
        }
    }

    fn integrate_format(&mut self, target: OpId, stamp: Stamp, key: &str, value: &Option<String>) {
        let Some(&slot) = self.slots.get(&target) else {
            return;
        };
        let attributes = &mut self.elements[slot].attributes;
        match attributes.get(key) {
            Some((current, _)) if *current >= stamp => {}
            _ => {
                attributes.insert(key.to_string(), (stamp, value.clone()));
            }
        }
    }

    // ── Local editing ──────────────────────────────────────────────
    //
    // Editing stops early once the clock is exhausted; the returned update
    // then holds only the operations that were created.

    /// Insert `text` before the visible character at `index` (clamped to
    /// the length). Returns the encoded update to send to peers.
    pub fn insert(&mut self, index: usize, text: &str) -> Vec<u8> {
        let index = index.min(self.visible);
        let mut origin = if index == 0 {
            None
        } else {
            self.visible_ids().nth(index - 1)
        };

        let mut ops = Vec::new();
        for content in text.chars() {
            let Some(op) = self.next_op(OpKind::Insert { origin, content }) else {
                break;
            };
            origin = Some(op.id);
            ops.push(op.clone());
            self.integrate(op);
        }
        self.commit_local(ops)
    }

    /// Delete `len` visible characters starting at `index`.
    pub fn delete(&mut self, index: usize, len: usize) -> Vec<u8> {
        let targets: Vec<OpId> = self.visible_ids().skip(index).take(len).collect();
        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(op) = self.next_op(OpKind::Delete { target }) else {
                break;
            };
            ops.push(op.clone());
            self.integrate(op);
        }
        self.commit_local(ops)
    }

    /// Set (`Some`) or clear (`None`) attribute `key` on `len` characters from `index`.
    pub fn format(&mut self, index: usize, len: usize, key: &str, value: Option<&str>) -> Vec<u8> {
        let targets: Vec<OpId> = self.visible_ids().skip(index).take(len).collect();
        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(op) = self.next_op(OpKind::Format {
                target,
                key: key.to_string(),
                value: value.map(str::to_string),
            }) else {
                break;
            };
            ops.push(op.clone());
            self.integrate(op);
        }
        self.commit_local(ops)
    }

    fn visible_ids(&self) -> impl Iterator<Item = OpId> + '_ {
        self.sequence().filter(|e| !e.deleted).map(|e| e.id)
    }

    fn next_op(&self, kind: OpKind) -> Option<Op> {
        let counter = self.state.get(self.replica).checked_add(1);
        let lamport = self.lamport.checked_add(1).filter(|l| *l <= MAX_LAMPORT);
        match (counter, lamport) {
            (Some(counter), Some(lamport)) => Some(Op {
                id: OpId::new(self.replica, counter),
                lamport,
                kind,
            }),
            _ => {
                warn!("replica {} clock exhausted, refusing local edit", self.replica);
                None
            }
        }
    }

    fn commit_local(&mut self, ops: Vec<Op>) -> Vec<u8> {
        let applied = ops.len();
        let encoded = Update::new(ops).encode();
        if applied > 0 {
            self.notify(UpdateEvent {
                origin: Origin::Local,
                applied,
                update: encoded.clone(),
                backlog: None,
            });
        }
        encoded
    }

    // ── Observers ──────────────────────────────────────────────────

    /// Register a listener invoked synchronously after every transaction that
    /// changed the document.
    pub fn observe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(&UpdateEvent) + Send + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sid, _)| *sid != id);
        self.observers.len() != before
    }

    fn notify(&self, event: UpdateEvent) {
        for (_, observer) in &self.observers {
            observer(&event);
        }
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("replica", &self.replica)
            .field("len", &self.visible)
            .field("operations", &self.history.len())
            .field("pending", &self.pending.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
