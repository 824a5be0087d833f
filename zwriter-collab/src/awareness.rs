//! Ephemeral presence state (cursor, selection, display name).
//!
//! Each connection owns one opaque entry versioned by a sequence number the
//! connection increments on every change. Conflicts resolve by last write
//! wins on that sequence number:
//! ```text
//! seq 1 {cursor: 4} ──► applied
//! seq 3 {cursor: 9} ──► applied
//! seq 2 {cursor: 6} ──► stale, dropped
//! ```
//! Removing an entry keeps its sequence high-water mark so a delayed update
//! cannot resurrect a connection that already left. Remote updates may use
//! sequence numbers up to [`MAX_SEQ`]; the value above it is left for the
//! removal delta.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ConnectionId, SyncMessage};

/// Highest sequence number accepted from the network.
pub const MAX_SEQ: u64 = u64::MAX - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    /// Opaque state blob; `None` once removed.
    pub state: Option<Vec<u8>>,
    pub seq: u64,
    pub last_seen: Instant,
    /// Principal token attached by the transport, passed through verbatim.
    pub principal: Option<String>,
}

impl AwarenessEntry {
    pub fn is_live(&self) -> bool {
        self.state.is_some()
    }
}

/// A change to broadcast: new state, or removal when `state` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub connection_id: ConnectionId,
    pub seq: u64,
    pub state: Option<Vec<u8>>,
    pub principal: Option<String>,
}

impl AwarenessUpdate {
    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }

    pub fn into_message(self) -> SyncMessage {
        SyncMessage::Awareness {
            connection_id: self.connection_id.to_string(),
            seq: self.seq,
            entry: self.state,
            principal: self.principal,
        }
    }
}

/// What an accepted remote update did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessChange {
    Added,
    Updated,
    Removed,
}

#[derive(Debug)]
pub struct AwarenessStore {
    local_id: ConnectionId,
    entries: HashMap<ConnectionId, AwarenessEntry>,
}

impl AwarenessStore {
    pub fn new(local_id: ConnectionId) -> Self {
        Self {
            local_id,
            entries: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    /// Replace the local entry, bumping its sequence number.
    pub fn set_local(&mut self, state: Vec<u8>) -> AwarenessUpdate {
        let id = self.local_id;
        let seq = self.entries.get(&id).map_or(0, |e| e.seq).saturating_add(1);
        let principal = self.entries.get(&id).and_then(|e| e.principal.clone());
        self.entries.insert(
            id,
            AwarenessEntry {
                state: Some(state.clone()),
                seq,
                last_seen: Instant::now(),
                principal: principal.clone(),
            },
        );
        AwarenessUpdate {
            connection_id: id,
            seq,
            state: Some(state),
            principal,
        }
    }

    /// Current local state, if any.
    pub fn local_state(&self) -> Option<&[u8]> {
        self.entries.get(&self.local_id)?.state.as_deref()
    }

    /// Merge an update received from the network.
    ///
    /// Returns `None` when the update is stale (`seq` not greater than the
    /// last one applied for that connection) or `seq` exceeds [`MAX_SEQ`].
    pub fn apply_remote(
        &mut self,
        connection_id: ConnectionId,
        state: Option<Vec<u8>>,
        seq: u64,
        principal: Option<String>,
    ) -> Option<AwarenessChange> {
        if seq > MAX_SEQ {
            log::debug!("dropping out of range awareness seq {seq} for {connection_id}");
            return None;
        }
        let previous = self.entries.get(&connection_id);
        if previous.is_some_and(|e| seq <= e.seq) {
            log::trace!("dropping stale awareness seq {seq} for {connection_id}");
            return None;
        }
        let was_live = previous.is_some_and(AwarenessEntry::is_live);
        let change = match (&state, was_live) {
            (None, _) => AwarenessChange::Removed,
            (Some(_), true) => AwarenessChange::Updated,
            (Some(_), false) => AwarenessChange::Added,
        };
        self.entries.insert(
            connection_id,
            AwarenessEntry {
                state,
                seq,
                last_seen: Instant::now(),
                principal,
            },
        );
        Some(change)
    }

    /// Remove the live entry of `connection_id`, producing the removal delta
    /// (`seq = last + 1`). Returns `None` if there was no live entry.
    pub fn remove_local(&mut self, connection_id: ConnectionId) -> Option<AwarenessUpdate> {
        let entry = self.entries.get_mut(&connection_id)?;
        if !entry.is_live() {
            return None;
        }
        entry.seq = entry.seq.saturating_add(1);
        entry.state = None;
        entry.last_seen = Instant::now();
        Some(AwarenessUpdate {
            connection_id,
            seq: entry.seq,
            state: None,
            principal: entry.principal.clone(),
        })
    }

    /// All live entries, as sent to a joining peer.
    pub fn snapshot(&self) -> Vec<AwarenessUpdate> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_live())
            .map(|(id, e)| AwarenessUpdate {
                connection_id: *id,
                seq: e.seq,
                state: e.state.clone(),
                principal: e.principal.clone(),
            })
            .collect()
    }

    /// Remove remote entries not refreshed within `timeout` and forget
    /// removal markers older than that. Returns the removal deltas.
    pub fn expire(&mut self, timeout: Duration) -> Vec<AwarenessUpdate> {
        let local_id = self.local_id;
        let stale: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(id, e)| **id != local_id && e.is_live() && e.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        let removed: Vec<AwarenessUpdate> = stale
            .into_iter()
            .filter_map(|id| self.remove_local(id))
            .collect();

        // removal markers only need to outlive delayed duplicates
        self.entries
            .retain(|_, e| e.is_live() || e.last_seen.elapsed() <= timeout);
        removed
    }

    /// Drop every remote entry (used when a client reconnects and receives a
    /// fresh snapshot).
    pub fn clear_remote(&mut self) {
        let local_id = self.local_id;
        self.entries.retain(|id, _| *id == local_id);
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&AwarenessEntry> {
        self.entries.get(connection_id).filter(|e| e.is_live())
    }

    /// Live remote entries.
    pub fn remote_states(&self) -> impl Iterator<Item = (&ConnectionId, &[u8])> + '_ {
        self.entries
            .iter()
            .filter(move |(id, _)| **id != self.local_id)
            .filter_map(|(id, e)| e.state.as_deref().map(|s| (id, s)))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AwarenessStore {
        AwarenessStore::new(ConnectionId::new())
    }

    #[test]
    fn test_last_write_wins_by_seq() {
        let mut store = store();
        let peer = ConnectionId::new();
        for seq in [1u64, 3, 2] {
            store.apply_remote(peer, Some(vec![seq as u8]), seq, None);
        }
        let entry = store.get(&peer).unwrap();
        assert_eq!(entry.seq, 3);
        assert_eq!(entry.state.as_deref(), Some(&[3u8][..]));
    }

    #[test]
    fn test_change_kinds() {
        let mut store = store();
        let peer = ConnectionId::new();
        assert_eq!(store.apply_remote(peer, Some(vec![1]), 1, None), Some(AwarenessChange::Added));
        assert_eq!(store.apply_remote(peer, Some(vec![2]), 2, None), Some(AwarenessChange::Updated));
        assert_eq!(store.apply_remote(peer, Some(vec![3]), 2, None), None);
        assert_eq!(store.apply_remote(peer, None, 3, None), Some(AwarenessChange::Removed));
        assert!(store.get(&peer).is_none());
    }

    #[test]
    fn test_removal_blocks_stale_resurrection() {
        let mut store = store();
        let peer = ConnectionId::new();
        store.apply_remote(peer, Some(vec![1]), 4, Some("bob".into()));
        let removal = store.remove_local(peer).unwrap();
        assert_eq!(removal.seq, 5);
        assert!(removal.is_removal());
        assert_eq!(removal.principal.as_deref(), Some("bob"));

        assert_eq!(store.apply_remote(peer, Some(vec![9]), 5, None), None);
        assert!(store.is_empty());
        assert_eq!(store.remove_local(peer), None);
    }

    #[test]
    fn test_seq_ceiling_leaves_room_for_removal() {
        let mut store = store();
        let peer = ConnectionId::new();
        assert_eq!(store.apply_remote(peer, Some(vec![1]), u64::MAX, None), None);
        assert!(store.get(&peer).is_none());

        assert_eq!(
            store.apply_remote(peer, Some(vec![1]), MAX_SEQ, None),
            Some(AwarenessChange::Added)
        );
        let removal = store.remove_local(peer).unwrap();
        assert_eq!(removal.seq, u64::MAX);
        assert!(store.is_empty());
        assert_eq!(store.apply_remote(peer, Some(vec![2]), u64::MAX, None), None);
        assert_eq!(store.remove_local(peer), None);
    }

    #[test]
    fn test_set_local_bumps_seq() {
        let mut store = store();
        assert_eq!(store.set_local(b"a".to_vec()).seq, 1);
        let update = store.set_local(b"b".to_vec());
        assert_eq!(update.seq, 2);
        assert_eq!(update.connection_id, store.local_id());
        assert_eq!(store.local_state(), Some(&b"b"[..]));
    }

    #[test]
    fn test_snapshot_only_live_entries() {
        let mut store = store();
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        store.apply_remote(a, Some(vec![1]), 1, None);
        store.apply_remote(b, Some(vec![2]), 1, None);
        store.remove_local(b);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].connection_id, a);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expire_removes_idle_remote_entries() {
        let mut store = store();
        store.set_local(vec![0]);
        let peer = ConnectionId::new();
        store.apply_remote(peer, Some(vec![1]), 1, None);

        std::thread::sleep(Duration::from_millis(20));
        let removed = store.expire(Duration::from_millis(5));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].connection_id, peer);
        assert!(store.get(&peer).is_none());
        assert!(store.local_state().is_some());
    }

    #[test]
    fn test_clear_remote_keeps_local() {
        let mut store = store();
        store.set_local(vec![0]);
        store.apply_remote(ConnectionId::new(), Some(vec![1]), 1, None);
        store.clear_remote();
        assert_eq!(store.len(), 1);
        assert_eq!(store.remote_states().count(), 0);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;
        use proptest::prelude::prop;

        fn deliveries() -> impl Strategy<Value = Vec<(u64, Option<u8>)>> {
            prop::collection::vec(prop::option::of(any::<u8>()), 1..24).prop_flat_map(|states| {
                let tagged: Vec<(u64, Option<u8>)> = states
                    .into_iter()
                    .enumerate()
                    .map(|(i, s)| (i as u64 + 1, s))
                    .collect();
                Just(tagged).prop_shuffle()
            })
        }

        proptest! {
            #[test]
            fn test_highest_seq_wins_in_any_order(order in deliveries()) {
                let mut store = store();
                let peer = ConnectionId::new();
                for (seq, state) in &order {
                    store.apply_remote(peer, state.map(|b| vec![b]), *seq, None);
                }
                let (_, newest) = order.iter().max_by_key(|(seq, _)| *seq).copied().unwrap();
                let held = store.get(&peer).and_then(|e| e.state.clone());
                prop_assert_eq!(held, newest.map(|b| vec![b]));
            }
        }
    }
}
