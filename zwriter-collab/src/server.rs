//! WebSocket sync server with per-document sessions.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌── Session (doc-1) ── Document + Awareness
//!             ├── /doc-1 ──────┤        │
//! Client B ──┘                 │        └── bounded queue per peer ──► Client A, B
//!                              │
//! Client C ──── /doc-2 ────────┴── Session (doc-2) ...
//! ```
//!
//! Each connection task:
//! 1. validates the request path and negotiates framing during the handshake
//! 2. joins the document's session and starts the sync handshake
//! 3. pumps inbound frames, queued outbound frames and the idle deadline in
//!    one `select!` loop
//! 4. leaves the session exactly once, however the loop ended

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::codec::{self, FrameCodec};
use crate::config::ServerConfig;
use crate::error::CollabError;
use crate::protocol::{ConnectionId, DocumentId, SyncMessage};
use crate::session::{Outbound, PeerHandle, Session, SessionRegistry, SessionReplica};
use crate::sync::{Action, SyncEngine};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    malformed_messages: AtomicU64,
}

/// What the handshake callback learned about the request.
struct Handshake {
    document_id: DocumentId,
    principal: Option<String>,
    subprotocol: Option<&'static str>,
}

/// Runs `leave()` for one connection at most once, whichever path asks first.
///
/// Dropping a guard that never ran (the connection task panicked or was
/// cancelled) schedules the leave on the current runtime.
pub struct Teardown {
    registry: Arc<SessionRegistry>,
    document_id: DocumentId,
    connection_id: ConnectionId,
    done: AtomicBool,
}

impl Teardown {
    pub fn new(
        registry: Arc<SessionRegistry>,
        document_id: DocumentId,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            registry,
            document_id,
            connection_id,
            done: AtomicBool::new(false),
        }
    }

    /// Leave the session. Returns false if teardown already ran.
    pub async fn run(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.registry
            .leave(&self.document_id, &self.connection_id)
            .await;
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let document_id = self.document_id.clone();
        let connection_id = self.connection_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("{connection_id} dropped without leaving {document_id}, leaving now");
                handle.spawn(async move {
                    registry.leave(&document_id, &connection_id).await;
                });
            }
            Err(_) => warn!("{connection_id} cannot leave {document_id}: no runtime"),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Default configuration, no persistence hook.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(SessionRegistry::new()))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            malformed_messages: self.stats.malformed_messages.load(Ordering::Relaxed),
            active_rooms: self.registry.session_count().await,
        }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), CollabError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let config = Arc::clone(&self.config);
            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, config, registry, stats).await
                {
                    match e {
                        CollabError::Transport(_) | CollabError::Io(_) => {
                            debug!("Connection from {addr} ended: {e}")
                        }
                        _ => info!("Connection from {addr} closed: {e}"),
                    }
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: Arc<ServerConfig>,
        registry: Arc<SessionRegistry>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), CollabError> {
        let mut handshake: Option<Handshake> = None;
        let callback = |request: &Request, mut response: Response| {
            let document_id = match DocumentId::from_path(request.uri().path()) {
                Ok(id) => id,
                Err(e) => return Err(bad_request(e.to_string())),
            };
            let principal = request
                .headers()
                .get(config.principal_header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let offered = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok());
            let subprotocol = codec::negotiate(offered);
            if let Some(selected) = subprotocol {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(selected));
            }
            handshake = Some(Handshake {
                document_id,
                principal,
                subprotocol,
            });
            Ok(response)
        };

        // tungstenite gets headroom above our limit so oversized messages
        // reach us and can be answered with a capacity-exceeded error
        let transport_limit = config.max_message_size.saturating_mul(2).max(64 * 1024);
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(transport_limit))
            .max_frame_size(Some(transport_limit));

        let ws_stream =
            match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
                .await
            {
                Ok(ws) => ws,
                Err(e) => {
                    stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    info!("Rejected handshake from {addr}: {e}");
                    return Err(e.into());
                }
            };
        let Some(Handshake {
            document_id,
            principal,
            subprotocol,
        }) = handshake
        else {
            return Err(CollabError::ProtocolViolation("handshake incomplete".into()));
        };

        let codec = FrameCodec::for_subprotocol(
            subprotocol,
            config.compression_threshold,
            config.max_message_size,
        );
        let connection_id = ConnectionId::new();
        info!(
            "{connection_id} from {addr} opened {document_id} ({:?}, principal {:?})",
            codec.compression(),
            principal
        );

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(config.peer_queue_capacity);
        let session = registry
            .join(&document_id, connection_id, PeerHandle::new(tx, principal))
            .await;
        let teardown = Teardown::new(Arc::clone(&registry), document_id.clone(), connection_id);

        let connection = Connection {
            connection_id,
            session: &session,
            codec,
            config: &config,
            stats: &stats,
        };
        let result = connection.pump(ws_stream, rx).await;

        teardown.run().await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        info!("{connection_id} left {document_id}");
        result
    }
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// State of one accepted connection while it is pumping frames.
struct Connection<'a> {
    connection_id: ConnectionId,
    session: &'a Arc<Session>,
    codec: FrameCodec,
    config: &'a ServerConfig,
    stats: &'a AtomicServerStats,
}

impl Connection<'_> {
    async fn pump(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) -> Result<(), CollabError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let replica = SessionReplica::new(self.session, self.connection_id);
        let mut engine = SyncEngine::new(self.config.max_malformed_messages);

        for action in engine.start(&replica)? {
            if let Action::Send(msg) = action {
                self.send(&mut ws_sender, &msg).await?;
            }
        }
        for msg in self.session.awareness_snapshot() {
            self.send(&mut ws_sender, &msg).await?;
        }

        let idle_timeout = self.config.idle_timeout;
        let mut deadline = Instant::now() + idle_timeout;

        let result = loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    let data = match inbound {
                        Some(Ok(Message::Binary(data))) => data,
                        // tungstenite answers pings itself
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            deadline = Instant::now() + idle_timeout;
                            continue;
                        }
                        Some(Ok(Message::Text(_))) => {
                            deadline = Instant::now() + idle_timeout;
                            let err = engine.malformed(zwriter_crdt::DecodeError::Malformed(
                                "text frame".into(),
                            ));
                            match self.survive(&mut ws_sender, err).await {
                                Ok(()) => continue,
                                Err(e) => break Err(e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("{} closed by peer", self.connection_id);
                            break Ok(());
                        }
                        Some(Ok(Message::Frame(_))) => continue,
                        Some(Err(e)) => break Err(CollabError::Transport(e)),
                    };

                    deadline = Instant::now() + idle_timeout;
                    self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    self.stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                    match self.on_frame(&mut engine, &replica, &data) {
                        Ok(replies) => {
                            for msg in replies {
                                self.send(&mut ws_sender, &msg).await?;
                            }
                        }
                        Err(err) => {
                            if let Err(fatal) = self.survive(&mut ws_sender, err).await {
                                break Err(fatal);
                            }
                        }
                    }
                }

                queued = outbound.recv() => match queued {
                    Some(body) => {
                        let frame = self.codec.encode(&body);
                        ws_sender.send(Message::Binary(frame.into())).await?;
                    }
                    None => {
                        // the session dropped our handle: we fell behind
                        let err = CollabError::SlowConsumer;
                        self.close_with(&mut ws_sender, &err).await;
                        break Err(err);
                    }
                },

                _ = sleep_until(deadline) => {
                    info!("{} idle for {idle_timeout:?}, closing", self.connection_id);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break Err(CollabError::IdleTimeout(idle_timeout));
                }
            }
        };

        engine.close();
        result
    }

    /// Decode and process one binary frame, returning the replies to send.
    fn on_frame(
        &self,
        engine: &mut SyncEngine,
        replica: &SessionReplica<'_>,
        frame: &[u8],
    ) -> Result<Vec<SyncMessage>, CollabError> {
        let msg = match self.codec.decode_message(frame) {
            Ok(msg) => msg,
            Err(CollabError::Decode(e)) => return Err(engine.malformed(e)),
            Err(e) => return Err(e),
        };
        debug!("{} <- {}", self.connection_id, msg.kind());

        let mut replies = Vec::new();
        for action in engine.handle(replica, msg)? {
            match action {
                Action::Send(reply) => replies.push(reply),
                Action::Applied(applied) => {
                    debug!("{} applied {applied} ops", self.connection_id)
                }
                Action::Synced => info!(
                    "{} synced {}",
                    self.connection_id,
                    self.session.document_id()
                ),
                // the claimed connection id is ignored; entries belong to the sender
                Action::Awareness { seq, entry, .. } => {
                    self.session.apply_awareness(self.connection_id, seq, entry);
                }
            }
        }
        Ok(replies)
    }

    /// Log a non-fatal error and carry on, or report a fatal one to the peer.
    async fn survive(&self, sink: &mut WsSink, err: CollabError) -> Result<(), CollabError> {
        if let CollabError::Decode(_) | CollabError::MalformedQuota { .. } = err {
            self.stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
        }
        if !err.is_fatal() {
            warn!("{}: {err}", self.connection_id);
            return Ok(());
        }
        warn!("closing {}: {err}", self.connection_id);
        self.close_with(sink, &err).await;
        Err(err)
    }

    async fn send(&self, sink: &mut WsSink, msg: &SyncMessage) -> Result<(), CollabError> {
        let frame = self.codec.encode_message(msg)?;
        sink.send(Message::Binary(frame.into())).await?;
        Ok(())
    }

    /// Best-effort `Error` message followed by a close frame.
    async fn close_with(&self, sink: &mut WsSink, err: &CollabError) {
        if let Err(e) = self.send(sink, &SyncMessage::error(err)).await {
            debug!("{} could not report {}: {e}", self.connection_id, err.code());
        }
        if let Err(e) = sink.send(Message::Close(None)).await {
            debug!("{} close failed: {e}", self.connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::AwarenessChange;

    #[test]
    fn test_server_config_default() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.config().bind_addr, "127.0.0.1:1234");
        assert_eq!(server.config().max_message_size, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats, ServerStats::default());
    }

    #[test]
    fn test_bad_request_status() {
        let response = bad_request("invalid document id".into());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_teardown_runs_leave_once() {
        let registry = Arc::new(SessionRegistry::new());
        let id = DocumentId::parse("doc-1").unwrap();
        let (leaving, staying) = (ConnectionId::new(), ConnectionId::new());
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let session = registry.join(&id, leaving, PeerHandle::new(tx_a, None)).await;
        registry.join(&id, staying, PeerHandle::new(tx_b, None)).await;
        assert_eq!(
            session.apply_awareness(leaving, 1, Some(vec![1])),
            Some(AwarenessChange::Added)
        );
        rx_b.try_recv().unwrap();

        let teardown = Teardown::new(Arc::clone(&registry), id.clone(), leaving);
        let (first, second) = tokio::join!(teardown.run(), teardown.run());
        assert!(first ^ second);
        assert!(!teardown.run().await);
        assert!(teardown.is_done());

        assert_eq!(registry.stats().leaves, 1);
        let removal = SyncMessage::decode(&rx_b.try_recv().unwrap()).unwrap();
        assert!(matches!(removal, SyncMessage::Awareness { entry: None, .. }));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(session.peer_count(), 1);
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !check() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_teardown_leaves_when_connection_task_panics() {
        let registry = Arc::new(SessionRegistry::new());
        let id = DocumentId::parse("doc-1").unwrap();
        let (leaving, staying) = (ConnectionId::new(), ConnectionId::new());
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let session = registry.join(&id, leaving, PeerHandle::new(tx_a, None)).await;
        registry.join(&id, staying, PeerHandle::new(tx_b, None)).await;

        // the largest seq is refused, the one below it still gets a removal
        assert_eq!(session.apply_awareness(leaving, u64::MAX, Some(vec![1])), None);
        assert_eq!(
            session.apply_awareness(leaving, crate::awareness::MAX_SEQ, Some(vec![1])),
            Some(AwarenessChange::Added)
        );
        rx_b.try_recv().unwrap();

        let task = tokio::spawn({
            let registry = Arc::clone(&registry);
            let id = id.clone();
            async move {
                let _teardown = Teardown::new(registry, id, leaving);
                panic!("connection task failed");
            }
        });
        assert!(task.await.unwrap_err().is_panic());
        eventually(|| !session.has_peer(&leaving)).await;
        assert_eq!(registry.stats().leaves, 1);
        match SyncMessage::decode(&rx_b.try_recv().unwrap()).unwrap() {
            SyncMessage::Awareness { entry, seq, .. } => {
                assert_eq!(entry, None);
                assert_eq!(seq, u64::MAX);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
        assert_eq!(session.awareness_snapshot(), Vec::new());
    }

    #[tokio::test]
    async fn test_dropped_teardown_evicts_last_peer() {
        let registry = Arc::new(SessionRegistry::new());
        let id = DocumentId::parse("doc-2").unwrap();
        let only = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(8);
        registry.join(&id, only, PeerHandle::new(tx, None)).await;

        let teardown = Teardown::new(Arc::clone(&registry), id.clone(), only);
        assert!(!teardown.is_done());
        drop(teardown);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while registry.session(&id).await.is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.stats().leaves, 1);
    }
}
