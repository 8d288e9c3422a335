// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Transport tests against an in-process websocket server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;

use agentlink::auth::{AuthenticationService, Permission};
use agentlink::config::{AuthConfig, TerminalConfig, TransportConfig};
use agentlink::error::TransportError;
use agentlink::gateway::RemoteGateway;
use agentlink::terminal::{SessionOptions, TerminalCommand, TerminalResponse, TerminalSessionManager};
use agentlink::transport::{
    ConnectionManager, ConnectionStatus, FrameType, SocketConnection, WebSocketMessage,
};

/// Echo every text frame back. Aborting the handle drops all clients.
async fn echo_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut clients = JoinSet::new();
        while let Ok((stream, _)) = listener.accept().await {
            clients.spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = socket.next().await {
                    if message.is_text() {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    } else if message.is_close() {
                        break;
                    }
                }
            });
        }
    });
    (addr, handle)
}

/// Accept clients, dropping each of the first `drops` links without a close
/// frame shortly after the handshake
async fn flaky_server(drops: usize) -> (SocketAddr, Arc<AtomicUsize>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let handle = tokio::spawn(async move {
        let mut clients = JoinSet::new();
        while let Ok((stream, _)) = listener.accept().await {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            clients.spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                if n <= drops {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    return;
                }
                while let Some(Ok(message)) = socket.next().await {
                    if message.is_close() {
                        break;
                    }
                }
            });
        }
    });
    (addr, accepted, handle)
}

fn quick_config() -> TransportConfig {
    TransportConfig {
        connection_timeout_ms: 500,
        message_timeout_ms: 500,
        reconnect_base_delay_ms: 10,
        max_reconnect_delay_ms: 50,
        auto_reconnect: false,
        ..TransportConfig::default()
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_send_and_receive_echo() {
    let (addr, _server) = echo_server().await;
    let conn = SocketConnection::new("c", quick_config());

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    conn.on_message(move |frame| sink.lock().unwrap().push(frame.clone()));

    conn.connect(&format!("ws://{}", addr)).await.unwrap();
    assert_eq!(conn.status(), ConnectionStatus::Connected);

    let frame = WebSocketMessage::command(json!({"op": "ping"}));
    conn.send(&frame).await.unwrap();

    assert!(wait_for(|| !received.lock().unwrap().is_empty()).await);
    assert_eq!(received.lock().unwrap()[0], frame);

    conn.disconnect().await;
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(conn.send(&frame).await, Err(TransportError::NotConnected));
}

#[tokio::test]
async fn test_heartbeat_echo_measures_latency() {
    let (addr, _server) = echo_server().await;
    let conn = SocketConnection::new(
        "c",
        TransportConfig {
            heartbeat_interval_ms: 50,
            ..quick_config()
        },
    );
    conn.connect(&format!("ws://{}", addr)).await.unwrap();

    assert!(wait_for(|| conn.state().latency.is_some()).await);
    assert!(conn.state().last_heartbeat.is_some());
    conn.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_counts_attempts_until_fresh_connect() {
    let (addr, _server) = echo_server().await;
    let url = format!("ws://{}", addr);
    let conn = SocketConnection::new(
        "c",
        TransportConfig {
            max_reconnect_attempts: 2,
            ..quick_config()
        },
    );
    conn.connect(&url).await.unwrap();

    conn.reconnect().await.unwrap();
    assert_eq!(conn.state().reconnect_attempts, 1);
    conn.reconnect().await.unwrap();
    assert_eq!(conn.state().reconnect_attempts, 2);
    assert_eq!(
        conn.reconnect().await,
        Err(TransportError::MaxReconnectAttemptsExceeded { max: 2 })
    );
    assert_eq!(conn.status(), ConnectionStatus::Error);

    conn.connect(&url).await.unwrap();
    assert_eq!(conn.state().reconnect_attempts, 0);
    conn.disconnect().await;
}

#[tokio::test]
async fn test_server_loss_triggers_auto_reconnect() {
    let (addr, server) = echo_server().await;
    let conn = SocketConnection::new(
        "c",
        TransportConfig {
            auto_reconnect: true,
            max_reconnect_attempts: 2,
            ..quick_config()
        },
    );

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&statuses);
    conn.on_state_change(move |state| seen.lock().unwrap().push(state.status));

    conn.connect(&format!("ws://{}", addr)).await.unwrap();
    server.abort();

    assert!(
        wait_for(|| conn.state().reconnect_attempts > 2 && conn.status() == ConnectionStatus::Error)
            .await
    );
    assert!(statuses.lock().unwrap().contains(&ConnectionStatus::Error));
}

#[tokio::test]
async fn test_auto_reconnect_survives_repeated_drops() {
    let (addr, accepted, _server) = flaky_server(4).await;
    let conn = SocketConnection::new(
        "c",
        TransportConfig {
            auto_reconnect: true,
            max_reconnect_attempts: 2,
            ..quick_config()
        },
    );

    conn.connect(&format!("ws://{}", addr)).await.unwrap();

    assert!(
        wait_for(|| {
            accepted.load(Ordering::SeqCst) == 5
                && conn.is_connected()
                && conn.state().reconnect_attempts == 0
        })
        .await
    );
    conn.disconnect().await;
}

#[tokio::test]
async fn test_panicking_listener_does_not_stop_delivery() {
    let (addr, _server) = echo_server().await;
    let conn = SocketConnection::new("c", quick_config());
    let calls = Arc::new(AtomicUsize::new(0));

    conn.on_message(|_| panic!("bad listener"));
    let counter = Arc::clone(&calls);
    conn.on_message(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    conn.connect(&format!("ws://{}", addr)).await.unwrap();
    conn.send(&WebSocketMessage::command(json!({}))).await.unwrap();
    conn.send(&WebSocketMessage::command(json!({}))).await.unwrap();

    assert!(wait_for(|| calls.load(Ordering::SeqCst) == 2).await);
    assert!(conn.is_connected());
    conn.disconnect().await;
}

#[tokio::test]
async fn test_manager_tracks_connections() {
    let (addr, _server) = echo_server().await;
    let manager = ConnectionManager::new(quick_config());

    manager.connect("a", &format!("ws://{}", addr)).await.unwrap();
    manager.create_connection("b").unwrap();

    assert_eq!(manager.get_active_connections(), vec!["a".to_string()]);
    let states = manager.get_connection_states();
    assert_eq!(states.len(), 2);
    assert_eq!(states[1].status, ConnectionStatus::Disconnected);

    assert_eq!(manager.close_all_connections().await, 2);
    assert!(manager.get_active_connections().is_empty());
}

#[tokio::test]
async fn test_remote_command_through_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let auth = Arc::new(AuthenticationService::new(AuthConfig::default()));
    let sessions = Arc::new(TerminalSessionManager::new(TerminalConfig::default()));
    sessions
        .create_session("default", SessionOptions::in_directory(dir.path()))
        .unwrap();
    let token = auth.generate_token("remote", &[Permission::Execute]).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Arc::new(RemoteGateway::new(auth, sessions));
    let _server = tokio::spawn(gateway.serve(listener));

    let conn = SocketConnection::new("client", quick_config());
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&replies);
    conn.on_message(move |frame| sink.lock().unwrap().push(frame.clone()));
    conn.connect(&format!("ws://{}", addr)).await.unwrap();

    let command = TerminalCommand::new("echo").with_args(["over", "the", "wire"]);
    let frame = WebSocketMessage::command(json!({
        "token": token,
        "sessionId": "default",
        "command": command,
    }));
    conn.send(&frame).await.unwrap();

    assert!(wait_for(|| !replies.lock().unwrap().is_empty()).await);
    let reply = replies.lock().unwrap()[0].clone();
    assert_eq!(reply.id, frame.id);
    assert_eq!(reply.frame_type, FrameType::Response);

    let response: TerminalResponse = serde_json::from_value(reply.payload).unwrap();
    assert_eq!(response.command_id, command.id);
    assert_eq!(response.stdout.trim(), "over the wire");
    conn.disconnect().await;
}

#[tokio::test]
async fn test_raw_client_gets_error_frame_for_garbage() {
    let auth = Arc::new(AuthenticationService::new(AuthConfig::default()));
    let sessions = Arc::new(TerminalSessionManager::new(TerminalConfig::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(Arc::new(RemoteGateway::new(auth, sessions)).serve(listener));

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    socket.send(Message::Text("not json".into())).await.unwrap();

    let reply = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => break text.to_string(),
            Some(Ok(_)) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    };
    let frame: WebSocketMessage = serde_json::from_str(&reply).unwrap();
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.payload["code"], "INVALID_FRAME");
}
