//! Helpers shared by the integration tests: a real server on an ephemeral
//! port, raw protocol connections and event waiting.

#![allow(dead_code)]

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use zwriter_collab::{
    ClientConfig, ClientEvent, CollabClient, DocumentId, ServerConfig, SessionRegistry,
    SyncMessage, SyncServer, SUBPROTOCOL_PLAIN,
};

pub type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub port: u16,
    pub registry: Arc<SessionRegistry>,
}

impl TestServer {
    pub fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }
}

/// Start a server with `config` on a free port.
pub async fn start_server(config: ServerConfig) -> TestServer {
    start_server_with_registry(config, Arc::new(SessionRegistry::new())).await
}

pub async fn start_server_with_registry(
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(config, Arc::clone(&registry));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    TestServer { port, registry }
}

pub fn client_config(replica: u64) -> ClientConfig {
    ClientConfig {
        replica_id: Some(replica),
        ..ClientConfig::default()
    }
}

/// Connect a client and wait until its handshake completed.
pub async fn connect_synced(
    server: &TestServer,
    doc: &str,
    config: ClientConfig,
) -> (CollabClient, mpsc::Receiver<ClientEvent>) {
    let mut client = CollabClient::connect(doc, &server.endpoint(), config)
        .await
        .unwrap();
    let mut events = client.take_events().unwrap();
    wait_event(&mut events, |e| *e == ClientEvent::Synced).await;
    (client, events)
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_event(
    events: &mut mpsc::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `check` until it holds.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let waited = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Open a protocol-level connection with plain framing.
pub async fn raw_connect(server: &TestServer, doc: &str) -> RawSocket {
    let mut request = format!("{}/{doc}", server.endpoint())
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL_PLAIN));
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

pub async fn raw_send(ws: &mut RawSocket, msg: &SyncMessage) {
    raw_send_bytes(ws, msg.encode().unwrap()).await;
}

pub async fn raw_send_bytes(ws: &mut RawSocket, bytes: Vec<u8>) {
    ws.send(Message::Binary(bytes.into())).await.unwrap();
}

/// Next protocol message, or `None` once the server closed the connection.
pub async fn raw_recv(ws: &mut RawSocket) -> Option<SyncMessage> {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Some(SyncMessage::decode(&data).expect("server sent garbage"))
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for server")
}

/// Read until the server reports an error; returns its code.
pub async fn expect_error(ws: &mut RawSocket) -> String {
    loop {
        match raw_recv(ws).await {
            Some(SyncMessage::Error { code, .. }) => return code,
            Some(_) => continue,
            None => panic!("connection closed without an error message"),
        }
    }
}

/// Wait until the registry holds exactly `count` sessions.
pub async fn wait_sessions(registry: &SessionRegistry, count: usize) {
    let waited = timeout(WAIT, async {
        while registry.session_count().await != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {count} sessions");
}

/// Wait until the server-side replica of `doc` reads `text`.
pub async fn wait_session_text(registry: &SessionRegistry, doc: &str, text: &str) {
    let id: DocumentId = doc.parse().unwrap();
    let waited = timeout(WAIT, async {
        loop {
            if let Some(session) = registry.session(&id).await {
                if session.text() == text {
                    return;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {doc} to read {text:?}");
}
