//! WebSocket client bridging a local document to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - The same handshake the server runs, against a local [`Document`]
//! - Local edits forwarded as incremental updates
//! - Awareness (cursor/selection) state with periodic renewal
//!
//! Edits made while the connection is down stay in the local document; the
//! handshake after reconnecting sends whatever the server is missing, so no
//! separate offline queue is needed.

use std::sync::{Arc, Mutex};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use zwriter_crdt::{DecodeError, Document, Origin};

use crate::awareness::{AwarenessStore, AwarenessUpdate};
use crate::codec::{FrameCodec, OFFERED_SUBPROTOCOLS};
use crate::config::ClientConfig;
use crate::error::CollabError;
use crate::protocol::{ConnectionId, DocumentId, SyncMessage};
use crate::session::lock;
use crate::sync::{Action, Replica, SyncEngine};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StatusChanged(ConnectionStatus),
    /// Handshake with the server completed
    Synced,
    /// Remote operations were merged into the local document
    Update { text: String, applied: usize },
    /// A remote awareness entry changed; `state: None` means it was removed
    AwarenessChanged {
        connection_id: String,
        state: Option<Vec<u8>>,
        principal: Option<String>,
    },
}

enum Command {
    Update(Vec<u8>),
    Awareness(SyncMessage),
    Disconnect,
}

/// State shared between the handle and the connection task.
struct Shared {
    url: String,
    config: ClientConfig,
    doc: Mutex<Document>,
    awareness: Mutex<AwarenessStore>,
    status: RwLock<ConnectionStatus>,
    events: mpsc::Sender<ClientEvent>,
}

impl Shared {
    async fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.status.write().await;
        if *current != status {
            *current = status;
            self.emit(ClientEvent::StatusChanged(status));
        }
    }

    /// Events are notifications; a full queue drops them rather than
    /// stalling the connection.
    fn emit(&self, event: ClientEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            warn!("event queue full, dropping {event:?}");
        }
    }
}

struct LocalReplica<'a>(&'a Mutex<Document>);

impl Replica for LocalReplica<'_> {
    fn state_vector(&self) -> Vec<u8> {
        lock(self.0).encode_state_vector()
    }

    fn encode_state_as_update(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DecodeError> {
        lock(self.0).encode_state_as_update(Some(peer_state_vector))
    }

    fn apply_update(&self, update: &[u8]) -> Result<usize, DecodeError> {
        lock(self.0).apply_update(update)
    }
}

/// Handle to a collaborative document.
pub struct CollabClient {
    document_id: DocumentId,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::Receiver<ClientEvent>>,
    driver: Option<JoinHandle<()>>,
}

impl CollabClient {
    /// Connect to `endpoint` (e.g. `ws://127.0.0.1:1234`) and join `document_id`.
    ///
    /// The first connection attempt must succeed; later losses are retried
    /// in the background.
    pub async fn connect(
        document_id: &str,
        endpoint: &str,
        config: ClientConfig,
    ) -> Result<Self, CollabError> {
        let document_id = DocumentId::parse(document_id)?;
        let url = format!("{}/{}", endpoint.trim_end_matches('/'), document_id);
        let doc = match config.replica_id {
            Some(replica) => Document::with_replica(replica),
            None => Document::new(),
        };
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));

        let shared = Arc::new(Shared {
            url,
            config,
            doc: Mutex::new(doc),
            awareness: Mutex::new(AwarenessStore::new(ConnectionId::new())),
            status: RwLock::new(ConnectionStatus::Connecting),
            events: event_tx,
        });

        let (ws, codec) = match open(&shared).await {
            Ok(conn) => conn,
            Err(e) => {
                *shared.status.write().await = ConnectionStatus::Disconnected;
                return Err(e);
            }
        };
        info!("Connected to {}", shared.url);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(Arc::clone(&shared), ws, codec, command_rx));

        Ok(Self {
            document_id,
            shared,
            commands,
            events: Some(event_rx),
            driver: Some(driver),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events.take()
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.shared.status.read().await
    }

    pub fn text(&self) -> String {
        lock(&self.shared.doc).text()
    }

    /// Run `f` against the local replica.
    pub fn with_document<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&lock(&self.shared.doc))
    }

    /// Merge an update produced by the local editor and send it to the server.
    pub fn local_update(&self, update: &[u8]) -> Result<usize, CollabError> {
        let applied = lock(&self.shared.doc).apply_update_with_origin(update, Origin::Local)?;
        self.send(Command::Update(update.to_vec()))?;
        Ok(applied)
    }

    pub fn insert(&self, index: usize, text: &str) -> Result<(), CollabError> {
        self.edit(|doc| doc.insert(index, text))
    }

    pub fn delete(&self, index: usize, len: usize) -> Result<(), CollabError> {
        self.edit(|doc| doc.delete(index, len))
    }

    pub fn format(
        &self,
        index: usize,
        len: usize,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), CollabError> {
        self.edit(|doc| doc.format(index, len, key, value))
    }

    /// Apply a local edit and send the resulting update. An edit that runs
    /// out of clock midway still sends the operations it created.
    fn edit(&self, f: impl FnOnce(&mut Document) -> Vec<u8>) -> Result<(), CollabError> {
        let update = {
            let mut doc = lock(&self.shared.doc);
            if doc.clock_exhausted() {
                return Err(CollabError::ClockExhausted);
            }
            f(&mut doc)
        };
        self.send(Command::Update(update))
    }

    /// Publish our presence state.
    pub fn set_local_awareness(&self, state: Vec<u8>) -> Result<(), CollabError> {
        let update = lock(&self.shared.awareness).set_local(state);
        self.send(Command::Awareness(update.into_message()))
    }

    pub fn clear_local_awareness(&self) -> Result<(), CollabError> {
        let removal = {
            let mut store = lock(&self.shared.awareness);
            let local_id = store.local_id();
            store.remove_local(local_id)
        };
        match removal {
            Some(removal) => self.send(Command::Awareness(removal.into_message())),
            None => Ok(()),
        }
    }

    /// Number of other participants with a live awareness entry.
    pub fn peers(&self) -> usize {
        lock(&self.shared.awareness).remote_states().count()
    }

    /// Remote awareness states keyed by server connection id.
    pub fn awareness_states(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.shared.awareness)
            .remote_states()
            .map(|(id, state)| (id.to_string(), state.to_vec()))
            .collect()
    }

    /// Close the connection and stop reconnecting.
    pub async fn disconnect(mut self) {
        let _ = self.commands.send(Command::Disconnect);
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                warn!("connection task for {} failed: {e}", self.document_id);
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), CollabError> {
        if let Command::Update(update) = &command {
            // editing methods return an empty update when nothing changed
            if update.len() <= 1 {
                return Ok(());
            }
        }
        self.commands
            .send(command)
            .map_err(|_| CollabError::ConnectionClosed)
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Open a WebSocket to the document, offering both framings.
async fn open(shared: &Shared) -> Result<(WsStream, FrameCodec), CollabError> {
    let config = &shared.config;
    let mut request = shared.url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OFFERED_SUBPROTOCOLS),
    );
    if let Some(principal) = &config.principal {
        let name = HeaderName::from_bytes(config.principal_header.as_bytes())
            .map_err(|e| CollabError::Config(format!("principal header: {e}")))?;
        let value = HeaderValue::from_str(principal)
            .map_err(|e| CollabError::Config(format!("principal: {e}")))?;
        headers.insert(name, value);
    }

    let limit = config.max_message_size.saturating_mul(2).max(64 * 1024);
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(limit))
        .max_frame_size(Some(limit));
    let (ws, response) =
        tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await?;

    let selected = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    let codec = FrameCodec::for_subprotocol(
        selected,
        config.compression_threshold,
        config.max_message_size,
    );
    debug!("{} negotiated {:?}", shared.url, codec.compression());
    Ok((ws, codec))
}

/// Connection task: pump until stopped, reconnecting after losses.
async fn drive(
    shared: Arc<Shared>,
    mut ws: WsStream,
    mut codec: FrameCodec,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        match pump(&shared, ws, codec, &mut commands).await {
            Ok(()) => {
                info!("Disconnected from {}", shared.url);
                break;
            }
            Err(e) => {
                info!("Lost connection to {}: {e}", shared.url);
                match reconnect(&shared, &mut commands).await {
                    Some((new_ws, new_codec)) => {
                        ws = new_ws;
                        codec = new_codec;
                    }
                    None => break,
                }
            }
        }
    }
    shared.set_status(ConnectionStatus::Disconnected).await;
}

async fn reconnect(
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Option<(WsStream, FrameCodec)> {
    shared.set_status(ConnectionStatus::Reconnecting).await;
    let mut attempt = 0u32;
    loop {
        if shared
            .config
            .max_reconnect_attempts
            .is_some_and(|max| attempt >= max)
        {
            warn!("Giving up on {} after {attempt} attempts", shared.url);
            return None;
        }
        let wake = tokio::time::sleep(shared.config.backoff(attempt));
        tokio::pin!(wake);
        attempt += 1;

        // edits made meanwhile stay in the document and go out with the next handshake
        loop {
            tokio::select! {
                _ = &mut wake => break,
                command = commands.recv() => match command {
                    None | Some(Command::Disconnect) => return None,
                    Some(_) => {}
                },
            }
        }

        match open(shared).await {
            Ok(conn) => {
                info!("Reconnected to {} (attempt {attempt})", shared.url);
                return Some(conn);
            }
            Err(e) => debug!("Reconnect attempt {attempt} to {} failed: {e}", shared.url),
        }
    }
}

/// Run one connection. `Ok` means the user asked to disconnect.
async fn pump(
    shared: &Shared,
    ws: WsStream,
    codec: FrameCodec,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<(), CollabError> {
    let (mut sink, mut stream) = ws.split();
    let replica = LocalReplica(&shared.doc);
    let mut engine = SyncEngine::new(shared.config.max_malformed_messages);

    for action in engine.start(&replica)? {
        if let Action::Send(msg) = action {
            send(&mut sink, &codec, &msg).await?;
        }
    }
    // the server sends a fresh snapshot of everyone else
    let renewal = {
        let mut store = lock(&shared.awareness);
        store.clear_remote();
        renew_local(&mut store)
    };
    if let Some(update) = renewal {
        send(&mut sink, &codec, &update.into_message()).await?;
    }
    shared.set_status(ConnectionStatus::Connected).await;

    let period = shared.config.heartbeat_interval;
    let mut heartbeat = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    match handle_frame(shared, &codec, &mut engine, &replica, &data) {
                        Ok(replies) => {
                            for msg in replies {
                                send(&mut sink, &codec, &msg).await?;
                            }
                        }
                        Err(e) if !e.is_fatal() => warn!("Ignoring message from server: {e}"),
                        Err(e) => return Err(e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(CollabError::ConnectionClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },

            command = commands.recv() => match command {
                Some(Command::Update(update)) => {
                    send(&mut sink, &codec, &SyncMessage::sync_step2(update)).await?;
                }
                Some(Command::Awareness(msg)) => send(&mut sink, &codec, &msg).await?,
                Some(Command::Disconnect) | None => {
                    let removal = {
                        let mut store = lock(&shared.awareness);
                        let local_id = store.local_id();
                        store.remove_local(local_id)
                    };
                    if let Some(removal) = removal {
                        let _ = send(&mut sink, &codec, &removal.into_message()).await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    engine.close();
                    return Ok(());
                }
            },

            _ = heartbeat.tick() => {
                sink.send(Message::Ping(Vec::new().into())).await?;
                let (renewal, expired) = {
                    let mut store = lock(&shared.awareness);
                    let renewal = renew_local(&mut store);
                    (renewal, store.expire(shared.config.awareness_timeout))
                };
                if let Some(update) = renewal {
                    send(&mut sink, &codec, &update.into_message()).await?;
                }
                for removal in expired {
                    shared.emit(ClientEvent::AwarenessChanged {
                        connection_id: removal.connection_id.to_string(),
                        state: None,
                        principal: removal.principal,
                    });
                }
            }
        }
    }
}

/// Re-publish the local awareness state (if any) with a fresh sequence number.
fn renew_local(store: &mut AwarenessStore) -> Option<AwarenessUpdate> {
    let state = store.local_state()?.to_vec();
    Some(store.set_local(state))
}

fn handle_frame(
    shared: &Shared,
    codec: &FrameCodec,
    engine: &mut SyncEngine,
    replica: &LocalReplica<'_>,
    frame: &[u8],
) -> Result<Vec<SyncMessage>, CollabError> {
    let msg = match codec.decode_message(frame) {
        Ok(msg) => msg,
        Err(CollabError::Decode(e)) => return Err(engine.malformed(e)),
        Err(e) => return Err(e),
    };

    let mut replies = Vec::new();
    for action in engine.handle(replica, msg)? {
        match action {
            Action::Send(reply) => replies.push(reply),
            Action::Applied(0) => {}
            Action::Applied(applied) => {
                let text = lock(&shared.doc).text();
                shared.emit(ClientEvent::Update { text, applied });
            }
            Action::Synced => {
                debug!("Synced {}", shared.url);
                shared.emit(ClientEvent::Synced);
            }
            Action::Awareness {
                connection_id,
                seq,
                entry,
                principal,
            } => {
                let Ok(id) = connection_id.parse::<ConnectionId>() else {
                    warn!("Ignoring awareness for invalid connection id {connection_id:?}");
                    continue;
                };
                let change = lock(&shared.awareness).apply_remote(
                    id,
                    entry.clone(),
                    seq,
                    principal.clone(),
                );
                if change.is_some() {
                    shared.emit(ClientEvent::AwarenessChanged {
                        connection_id,
                        state: entry,
                        principal,
                    });
                }
            }
        }
    }
    Ok(replies)
}

async fn send(sink: &mut WsSink, codec: &FrameCodec, msg: &SyncMessage) -> Result<(), CollabError> {
    sink.send(Message::Binary(codec.encode_message(msg)?.into()))
        .await?;
    Ok(())
}
