//! Document sessions and their registry.
//!
//! ```text
//! SessionRegistry ── DocumentId ──► Session
//!                                     ├── Document      (authoritative replica)
//!                                     ├── AwarenessStore
//!                                     └── peers: ConnectionId ──► bounded mpsc ──► connection task
//! ```
//!
//! A session is created by the first `join` and evicted by the `leave` of
//! its last peer, at which point the persistence hook receives the final
//! snapshot. All session state sits behind one mutex that is never held
//! across an await, so a sender's updates are relayed in the order they
//! were applied.
//!
//! Fan-out reuses one pre-encoded message body (`Arc<Vec<u8>>`) for every
//! recipient. A recipient whose queue is full is dropped from the session
//! instead of silently missing updates; its connection task sees the closed
//! channel and tears itself down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, RwLock};
use zwriter_crdt::{DecodeError, Document, Origin, UpdateEvent};

use crate::awareness::{AwarenessChange, AwarenessStore, AwarenessUpdate};
use crate::persistence::PersistenceHook;
use crate::protocol::{ConnectionId, DocumentId, SyncMessage};
use crate::sync::Replica;

/// Encoded message bodies queued for one connection.
pub type Outbound = Arc<Vec<u8>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn outbound(msg: &SyncMessage) -> Option<Outbound> {
    match msg.encode() {
        Ok(body) => Some(Arc::new(body)),
        Err(e) => {
            error!("dropping {} message: {e}", msg.kind());
            None
        }
    }
}

/// Session-side handle of a connected peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    sender: mpsc::Sender<Outbound>,
    principal: Option<String>,
}

impl PeerHandle {
    pub fn new(sender: mpsc::Sender<Outbound>, principal: Option<String>) -> Self {
        Self { sender, principal }
    }

    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

struct SessionState {
    doc: Document,
    awareness: AwarenessStore,
    peers: HashMap<ConnectionId, PeerHandle>,
    /// Fed by the document observer, drained after every apply.
    events: std_mpsc::Receiver<UpdateEvent>,
}

/// Counters for one session (lock-free reads).
#[derive(Debug, Default)]
struct AtomicSessionStats {
    updates_applied: AtomicU64,
    messages_relayed: AtomicU64,
    slow_consumers: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub updates_applied: u64,
    pub messages_relayed: u64,
    pub slow_consumers: u64,
    pub peers: usize,
}

/// One live document and the peers editing it.
pub struct Session {
    document_id: DocumentId,
    state: Mutex<SessionState>,
    stats: AtomicSessionStats,
}

impl Session {
    /// Create a session, seeding the document from `snapshot` if given.
    pub fn new(document_id: DocumentId, snapshot: Option<&[u8]>) -> Self {
        let mut doc = Document::new();
        if let Some(snapshot) = snapshot {
            match doc.apply_update(snapshot) {
                Ok(applied) => info!("restored {applied} ops for {document_id}"),
                Err(e) => warn!("discarding unreadable snapshot of {document_id}: {e}"),
            }
        }

        let (tx, rx) = std_mpsc::channel();
        doc.observe(move |event: &UpdateEvent| {
            // receiver lives in the same SessionState; send only fails during drop
            let _ = tx.send(event.clone());
        });

        Self {
            document_id,
            state: Mutex::new(SessionState {
                doc,
                awareness: AwarenessStore::new(ConnectionId::new()),
                peers: HashMap::new(),
                events: rx,
            }),
            stats: AtomicSessionStats::default(),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    /// Register a peer. Returns true if `connection_id` was already present.
    pub fn add_peer(&self, connection_id: ConnectionId, peer: PeerHandle) -> bool {
        self.state().peers.insert(connection_id, peer).is_some()
    }

    /// Unregister a peer and broadcast the removal of its awareness entry.
    ///
    /// Returns the removal delta if the peer had a live entry.
    pub fn remove_peer(&self, connection_id: &ConnectionId) -> Option<AwarenessUpdate> {
        let mut state = self.state();
        state.peers.remove(connection_id);
        let removal = state.awareness.remove_local(*connection_id)?;
        if let Some(body) = outbound(&removal.clone().into_message()) {
            self.fan_out(&mut state, Some(connection_id), body);
        }
        Some(removal)
    }

    pub fn has_peer(&self, connection_id: &ConnectionId) -> bool {
        self.state().peers.contains_key(connection_id)
    }

    pub fn peer_count(&self) -> usize {
        self.state().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().peers.is_empty()
    }

    pub fn text(&self) -> String {
        self.state().doc.text()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.state().doc.snapshot()
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.state().doc.encode_state_vector()
    }

    pub fn encode_state_as_update(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DecodeError> {
        self.state().doc.encode_state_as_update(Some(peer_state_vector))
    }

    /// Merge an update sent by `from` and relay what was new to everyone else.
    pub fn apply_update(&self, from: ConnectionId, update: &[u8]) -> Result<usize, DecodeError> {
        let mut state = self.state();
        let applied = state
            .doc
            .apply_update_with_origin(update, Origin::Peer(from.as_u128()))?;
        if applied > 0 {
            self.stats
                .updates_applied
                .fetch_add(applied as u64, Ordering::Relaxed);
        }
        self.relay_events(&mut state);
        Ok(applied)
    }

    /// Store an awareness update from `from` and relay it if it was not stale.
    ///
    /// The entry is attributed to `from` and the principal its connection
    /// was opened with, whatever the message claimed.
    pub fn apply_awareness(
        &self,
        from: ConnectionId,
        seq: u64,
        entry: Option<Vec<u8>>,
    ) -> Option<AwarenessChange> {
        let mut state = self.state();
        let principal = state
            .peers
            .get(&from)
            .and_then(|p| p.principal.clone());
        let change = state
            .awareness
            .apply_remote(from, entry.clone(), seq, principal.clone())?;
        trace!("awareness {change:?} from {from} on {} (seq {seq})", self.document_id);

        let msg = SyncMessage::Awareness {
            connection_id: from.to_string(),
            seq,
            entry,
            principal,
        };
        if let Some(body) = outbound(&msg) {
            self.fan_out(&mut state, Some(&from), body);
        }
        Some(change)
    }

    /// Awareness messages describing every live entry.
    pub fn awareness_snapshot(&self) -> Vec<SyncMessage> {
        self.state()
            .awareness
            .snapshot()
            .into_iter()
            .map(AwarenessUpdate::into_message)
            .collect()
    }

    /// Deliver `msg` to every peer except `sender`. Returns the number of
    /// peers it was queued for.
    pub fn broadcast(&self, sender: Option<&ConnectionId>, msg: &SyncMessage) -> usize {
        let Some(body) = outbound(msg) else {
            return 0;
        };
        let mut state = self.state();
        self.fan_out(&mut state, sender, body)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            updates_applied: self.stats.updates_applied.load(Ordering::Relaxed),
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            slow_consumers: self.stats.slow_consumers.load(Ordering::Relaxed),
            peers: self.peer_count(),
        }
    }

    /// Forward queued document events as `SyncStep2` to every peer but the
    /// one that caused them. That peer still gets the buffered operations
    /// its update unblocked, since it never sent those.
    fn relay_events(&self, state: &mut SessionState) {
        while let Ok(event) = state.events.try_recv() {
            let origin = match event.origin {
                Origin::Peer(raw) => Some(ConnectionId::from_u128(raw)),
                Origin::Local | Origin::Remote => None,
            };
            let Some(body) = outbound(&SyncMessage::sync_step2(event.update)) else {
                continue;
            };
            let mut delivered = self.fan_out(state, origin.as_ref(), body);
            if let (Some(origin), Some(backlog)) = (origin, event.backlog) {
                if let Some(body) = outbound(&SyncMessage::sync_step2(backlog)) {
                    delivered += self.deliver(state, |id| *id == origin, body);
                }
            }
            debug!(
                "relayed {} ops on {} to {delivered} peers",
                event.applied, self.document_id
            );
        }
    }

    fn fan_out(
        &self,
        state: &mut SessionState,
        sender: Option<&ConnectionId>,
        body: Outbound,
    ) -> usize {
        self.deliver(state, |id| Some(id) != sender, body)
    }

    /// Queue `body` for every peer matching `target`, dropping peers whose
    /// queue is full or closed.
    fn deliver(
        &self,
        state: &mut SessionState,
        target: impl Fn(&ConnectionId) -> bool,
        body: Outbound,
    ) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, peer) in &state.peers {
            if !target(id) {
                continue;
            }
            match peer.sender.try_send(Arc::clone(&body)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("disconnecting slow consumer {id} on {}", self.document_id);
                    self.stats.slow_consumers.fetch_add(1, Ordering::Relaxed);
                    dropped.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("peer {id} on {} already gone", self.document_id);
                    dropped.push(*id);
                }
            }
        }
        // dropping the handle closes the peer's queue, which ends its connection
        for id in dropped {
            state.peers.remove(&id);
        }
        self.stats
            .messages_relayed
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

/// [`Replica`] view of a session bound to one connection, so updates are
/// tagged with (and not echoed back to) that connection.
pub struct SessionReplica<'a> {
    session: &'a Session,
    connection_id: ConnectionId,
}

impl<'a> SessionReplica<'a> {
    pub fn new(session: &'a Session, connection_id: ConnectionId) -> Self {
        Self {
            session,
            connection_id,
        }
    }
}

impl Replica for SessionReplica<'_> {
    fn state_vector(&self) -> Vec<u8> {
        self.session.state_vector()
    }

    fn encode_state_as_update(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DecodeError> {
        self.session.encode_state_as_update(peer_state_vector)
    }

    fn apply_update(&self, update: &[u8]) -> Result<usize, DecodeError> {
        self.session.apply_update(self.connection_id, update)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub leaves: u64,
    pub hook_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicRegistryStats {
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    leaves: AtomicU64,
    hook_failures: AtomicU64,
}

/// Maps documents to their live session. One session per document.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<DocumentId, Arc<Session>>>,
    hook: Option<Arc<dyn PersistenceHook>>,
    stats: Arc<AtomicRegistryStats>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            hook: None,
            stats: Arc::new(AtomicRegistryStats::default()),
        }
    }

    pub fn with_hook(hook: Arc<dyn PersistenceHook>) -> Self {
        Self {
            hook: Some(hook),
            ..Self::new()
        }
    }

    /// Register `peer` as `connection_id` on the document's session,
    /// creating the session on first join.
    ///
    /// Registering the same connection id twice is a bug in the caller:
    /// debug builds panic, release builds replace the old handle.
    pub async fn join(
        &self,
        document_id: &DocumentId,
        connection_id: ConnectionId,
        peer: PeerHandle,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        let session = match sessions.get(document_id) {
            Some(session) => Arc::clone(session),
            None => {
                let snapshot = self
                    .hook
                    .as_ref()
                    .and_then(|hook| hook.load_snapshot(document_id));
                let session = Arc::new(Session::new(document_id.clone(), snapshot.as_deref()));
                sessions.insert(document_id.clone(), Arc::clone(&session));
                self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
                info!("created session {document_id}");
                session
            }
        };

        if session.add_peer(connection_id, peer) {
            debug_assert!(
                false,
                "connection {connection_id} joined {document_id} twice"
            );
            warn!("connection {connection_id} joined {document_id} twice, replacing old handle");
        }
        debug!(
            "{connection_id} joined {document_id} ({} peers)",
            session.peer_count()
        );
        session
    }

    /// Remove a connection from its session, evicting the session when it
    /// was the last peer. Returns true if the session was evicted.
    pub async fn leave(&self, document_id: &DocumentId, connection_id: &ConnectionId) -> bool {
        self.stats.leaves.fetch_add(1, Ordering::Relaxed);
        let evicted = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get(document_id).cloned() else {
                debug!("{connection_id} left unknown session {document_id}");
                return false;
            };
            session.remove_peer(connection_id);
            debug!(
                "{connection_id} left {document_id} ({} peers)",
                session.peer_count()
            );
            if !session.is_empty() {
                return false;
            }
            sessions.remove(document_id);
            session
        };

        self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
        info!("evicting session {document_id}");
        if let Some(hook) = &self.hook {
            self.run_evict_hook(Arc::clone(hook), document_id.clone(), evicted.snapshot())
                .await;
        }
        true
    }

    /// Deliver `msg` to every peer of the document except `sender`.
    pub async fn broadcast(
        &self,
        document_id: &DocumentId,
        sender: Option<&ConnectionId>,
        msg: &SyncMessage,
    ) -> usize {
        match self.session(document_id).await {
            Some(session) => session.broadcast(sender, msg),
            None => 0,
        }
    }

    pub async fn session(&self, document_id: &DocumentId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(document_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            sessions_created: self.stats.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.stats.sessions_evicted.load(Ordering::Relaxed),
            leaves: self.stats.leaves.load(Ordering::Relaxed),
            hook_failures: self.stats.hook_failures.load(Ordering::Relaxed),
        }
    }

    /// Hand the final snapshot to the hook on the blocking pool. Errors and
    /// panics are logged; eviction has already happened either way.
    async fn run_evict_hook(
        &self,
        hook: Arc<dyn PersistenceHook>,
        document_id: DocumentId,
        snapshot: Vec<u8>,
    ) {
        let id = document_id.clone();
        let outcome =
            tokio::task::spawn_blocking(move || hook.on_session_evict(&id, &snapshot)).await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => "hook panicked".to_string(),
            Err(join) => join.to_string(),
        };
        self.stats.hook_failures.fetch_add(1, Ordering::Relaxed);
        error!("persistence hook failed for {document_id}: {failure}");
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
