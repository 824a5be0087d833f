//! Pluggable persistence for evicted sessions.
//!
//! The server keeps documents in memory only. When the last peer leaves a
//! session, its final snapshot is handed to the [`PersistenceHook`] before
//! the session is dropped; a later join asks the hook for that snapshot.
//! Durable storage is the embedder's business.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::protocol::DocumentId;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

pub trait PersistenceHook: Send + Sync {
    /// Called at most once per eviction with the document's full state.
    fn on_session_evict(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), HookError>;

    /// Initial state for a session being created.
    fn load_snapshot(&self, _document_id: &DocumentId) -> Option<Vec<u8>> {
        None
    }
}

/// In-process snapshot store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<DocumentId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, document_id: &DocumentId) -> Option<Vec<u8>> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceHook for MemoryStore {
    fn on_session_evict(&self, document_id: &DocumentId, snapshot: &[u8]) -> Result<(), HookError> {
        log::debug!("storing {} byte snapshot of {document_id}", snapshot.len());
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.clone(), snapshot.to_vec());
        Ok(())
    }

    fn load_snapshot(&self, document_id: &DocumentId) -> Option<Vec<u8>> {
        self.get(document_id)
    }
}
