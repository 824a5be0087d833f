//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

mod common;

use common::*;
use std::time::Duration;
use tokio_tungstenite::tungstenite;
use zwriter_collab::{ClientConfig, ClientEvent, ConnectionStatus, ServerConfig, SyncMessage};
use zwriter_crdt::Document;

#[tokio::test]
async fn test_invalid_document_rejected_at_handshake() {
    let server = start_server(ServerConfig::default()).await;

    for path in ["/bad%20id", "/", "/a/b"] {
        let url = format!("{}{path}", server.endpoint());
        match tokio_tungstenite::connect_async(&url).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 400, "{path}")
            }
            Err(other) => panic!("unexpected error for {path}: {other}"),
            Ok(_) => panic!("{path} should be rejected"),
        }
    }
    assert_eq!(server.registry.session_count().await, 0);
}

#[tokio::test]
async fn test_client_connects_and_syncs() {
    let server = start_server(ServerConfig::default()).await;
    let (client, _events) = connect_synced(&server, "doc-1", client_config(1)).await;

    assert_eq!(client.status().await, ConnectionStatus::Connected);
    assert_eq!(client.text(), "");
    assert_eq!(server.registry.session_count().await, 1);
}

#[tokio::test]
async fn test_two_clients_exchange_edits() {
    let server = start_server(ServerConfig::default()).await;
    let (alice, _) = connect_synced(&server, "doc-1", client_config(1)).await;
    let (bob, mut bob_events) = connect_synced(&server, "doc-1", client_config(2)).await;

    alice.insert(0, "hello").unwrap();
    let event = wait_event(&mut bob_events, |e| matches!(e, ClientEvent::Update { .. })).await;
    assert_eq!(
        event,
        ClientEvent::Update {
            text: "hello".into(),
            applied: 5
        }
    );

    bob.delete(0, 1).unwrap();
    bob.insert(0, "j").unwrap();
    wait_until("alice sees bob's edit", || alice.text() == "jello").await;
}

#[tokio::test]
async fn test_three_clients_converge_concurrent_inserts() {
    let server = start_server(ServerConfig::default()).await;
    let (a, _) = connect_synced(&server, "doc-1", client_config(1)).await;
    let (b, _) = connect_synced(&server, "doc-1", client_config(2)).await;
    let (c, _) = connect_synced(&server, "doc-1", client_config(3)).await;

    a.insert(0, "hello").unwrap();
    b.insert(0, "world").unwrap();

    for (name, client) in [("a", &a), ("b", &b), ("c", &c)] {
        wait_until(name, || client.text() == "worldhello").await;
    }
    let session = server.registry.session(&"doc-1".parse().unwrap()).await.unwrap();
    assert_eq!(session.text(), "worldhello");
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let server = start_server(ServerConfig::default()).await;
    let (author, _) = connect_synced(&server, "doc-1", client_config(1)).await;
    author.insert(0, "draft").unwrap();
    author.format(0, 5, "bold", Some("true")).unwrap();

    wait_session_text(&server.registry, "doc-1", "draft").await;

    let (reader, _) = connect_synced(&server, "doc-1", client_config(2)).await;
    assert_eq!(reader.text(), "draft");
    reader.with_document(|doc| {
        assert_eq!(doc.attributes_at(4).get("bold").map(String::as_str), Some("true"));
    });
}

#[tokio::test]
async fn test_offline_edits_reach_server_through_handshake() {
    let server = start_server(ServerConfig::default()).await;
    let (online, _) = connect_synced(&server, "doc-1", client_config(1)).await;

    // edits made by a replica before it ever connected
    let mut offline = Document::with_replica(2);
    let update = offline.insert(0, "offline ");

    let (late, _) = connect_synced(&server, "doc-1", client_config(3)).await;
    assert_eq!(late.local_update(&update).unwrap(), 8);
    wait_until("online client merged", || online.text() == "offline ").await;
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let server = start_server(ServerConfig::default()).await;
    let (one, _) = connect_synced(&server, "doc-1", client_config(1)).await;
    let (two, _) = connect_synced(&server, "doc-2", client_config(2)).await;

    one.insert(0, "first").unwrap();
    two.insert(0, "second").unwrap();
    wait_session_text(&server.registry, "doc-1", "first").await;
    wait_session_text(&server.registry, "doc-2", "second").await;
    wait_sessions(&server.registry, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(one.text(), "first");
    assert_eq!(two.text(), "second");
}

#[tokio::test]
async fn test_large_update_uses_compressed_frames() {
    let server = start_server(ServerConfig::default()).await;
    let (writer, _) = connect_synced(&server, "doc-1", client_config(1)).await;
    let (reader, _) = connect_synced(&server, "doc-1", client_config(2)).await;

    let text = "lorem ipsum ".repeat(500);
    writer.insert(0, &text).unwrap();
    wait_until("reader receives 6000 chars", || reader.text() == text).await;
}

#[tokio::test]
async fn test_step2_before_step1_is_protocol_violation() {
    let server = start_server(ServerConfig::default()).await;
    let mut ws = raw_connect(&server, "doc-1").await;

    assert!(matches!(raw_recv(&mut ws).await, Some(SyncMessage::SyncStep1 { .. })));
    raw_send(&mut ws, &SyncMessage::sync_step2(Document::with_replica(1).insert(0, "x"))).await;
    assert_eq!(expect_error(&mut ws).await, "protocol-violation");
    assert!(raw_recv(&mut ws).await.is_none());
}

#[tokio::test]
async fn test_oversized_message_closes_with_capacity_error() {
    let config = ServerConfig {
        max_message_size: 1024,
        ..ServerConfig::default()
    };
    let server = start_server(config).await;
    let mut ws = raw_connect(&server, "doc-1").await;

    raw_send_bytes(&mut ws, vec![0u8; 4096]).await;
    assert_eq!(expect_error(&mut ws).await, "capacity-exceeded");
}

#[tokio::test]
async fn test_malformed_messages_are_tolerated_until_quota() {
    let config = ServerConfig {
        max_malformed_messages: 2,
        ..ServerConfig::default()
    };
    let server = start_server(config).await;
    let mut ws = raw_connect(&server, "doc-1").await;
    assert!(matches!(raw_recv(&mut ws).await, Some(SyncMessage::SyncStep1 { .. })));

    for _ in 0..2 {
        raw_send_bytes(&mut ws, vec![9, 1, 2]).await;
    }
    // still usable: a valid handshake message is answered
    raw_send(&mut ws, &SyncMessage::sync_step1(Vec::from([0u8]))).await;
    assert!(matches!(raw_recv(&mut ws).await, Some(SyncMessage::SyncStep2 { .. })));

    raw_send_bytes(&mut ws, vec![9, 1, 2]).await;
    assert_eq!(expect_error(&mut ws).await, "malformed-quota");
}

#[tokio::test]
async fn test_idle_connection_is_closed_and_session_evicted() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let server = start_server(config).await;
    let mut ws = raw_connect(&server, "doc-1").await;

    let mut closed = false;
    for _ in 0..10 {
        if raw_recv(&mut ws).await.is_none() {
            closed = true;
            break;
        }
    }
    assert!(closed, "idle connection should be closed");
    wait_sessions(&server.registry, 0).await;
}

#[tokio::test]
async fn test_heartbeat_keeps_connection_alive() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    };
    let server = start_server(config).await;
    let config = ClientConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..client_config(1)
    };
    let (client, mut events) = connect_synced(&server, "doc-1", config).await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(client.status().await, ConnectionStatus::Connected);
    assert!(events.try_recv().is_err(), "no status changes expected");
}

#[tokio::test]
async fn test_client_reconnects_after_server_closes() {
    let config = ServerConfig {
        idle_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let server = start_server(config).await;
    let (watcher, _) = connect_synced(
        &server,
        "doc-1",
        ClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..client_config(1)
        },
    )
    .await;
    // no heartbeat: the server will drop it for idleness
    let (sleepy, mut events) = connect_synced(
        &server,
        "doc-1",
        ClientConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..client_config(2)
        },
    )
    .await;

    wait_event(&mut events, |e| {
        *e == ClientEvent::StatusChanged(ConnectionStatus::Reconnecting)
    })
    .await;
    wait_event(&mut events, |e| *e == ClientEvent::Synced).await;

    sleepy.insert(0, "back").unwrap();
    wait_until("watcher sees edit after reconnect", || watcher.text() == "back").await;
}

#[tokio::test]
async fn test_disconnect_stops_client() {
    let server = start_server(ServerConfig::default()).await;
    let (client, _) = connect_synced(&server, "doc-1", client_config(1)).await;
    client.disconnect().await;

    wait_sessions(&server.registry, 0).await;
}
