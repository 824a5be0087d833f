//! # zwriter-collab: real-time collaboration server and client
//!
//! Keeps replicas of a [`zwriter_crdt::Document`] in sync over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ SyncServer   │
//! │ (per user)   │   SyncMessage      │ (connection  │
//! └──────┬───────┘   [+LZ4 frames]    │  manager)    │
//!        │                            └──────┬───────┘
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ SyncEngine   │                    │ SyncEngine   │ one per connection
//! │ + Document   │                    └──────┬───────┘
//! └──────────────┘                           ▼
//!                                     ┌──────────────┐
//!                                     │ Session      │ one per document
//!                                     │ Document     │
//!                                     │ Awareness    │──► PersistenceHook
//!                                     │ peer queues  │    (on eviction)
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages, document and connection ids
//! - [`codec`]: frame size limits and LZ4 framing
//! - [`sync`]: the per-connection handshake state machine
//! - [`awareness`]: last-writer-wins presence store
//! - [`session`]: sessions, fan-out and the session registry
//! - [`persistence`]: eviction hook and an in-memory store
//! - [`server`]: WebSocket connection manager
//! - [`client`]: client bridge with reconnects
//! - [`config`]: server (environment) and client configuration

pub mod awareness;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sync;

pub use awareness::{AwarenessChange, AwarenessEntry, AwarenessStore, AwarenessUpdate, MAX_SEQ};
pub use client::{ClientEvent, CollabClient, ConnectionStatus};
pub use codec::{Compression, FrameCodec, SUBPROTOCOL_LZ4, SUBPROTOCOL_PLAIN};
pub use config::{ClientConfig, ServerConfig};
pub use error::CollabError;
pub use persistence::{HookError, MemoryStore, PersistenceHook};
pub use protocol::{ConnectionId, DocumentId, SyncMessage};
pub use server::{ServerStats, SyncServer, Teardown};
pub use session::{PeerHandle, RegistryStats, Session, SessionRegistry, SessionStats};
pub use sync::{Action, Replica, SyncEngine, SyncState};
