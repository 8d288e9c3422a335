// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Server side of remote terminal access
//!
//! A client sends a `command` frame whose payload is
//! `{"token": ..., "sessionId": ..., "command": TerminalCommand}`. The
//! gateway requires a direct `execute` grant on the token, runs the command
//! on the named session and answers with a `response` frame carrying the
//! [`TerminalResponse`] under the same frame id. Failures answer with an
//! `error` frame `{code, message, commandId?}`.
//!
//! When a queue is attached, a payload of `{"token": ..., "queue": {"op": ...}}`
//! reaches the agent's mailbox instead. Ops are `send`, `broadcast`,
//! `receive`, `peek`, `acknowledge` and `fail`; see [`QueueAccess`] for the
//! permission each one needs.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::auth::{AuthenticationService, Permission};
use crate::error::{AgentLinkError, AuthError, QueueError, SandboxError};
use crate::queue::{MessagePriority, MessageQueue, QueueAccess};
use crate::terminal::{TerminalCommand, TerminalResponse, TerminalSessionManager};
use crate::transport::{FrameType, WebSocketMessage};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GatewayRequest {
    Queue(QueueRequest),
    Terminal(CommandRequest),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest {
    token: String,
    session_id: String,
    command: TerminalCommand,
}

#[derive(Debug, Deserialize)]
struct QueueRequest {
    token: String,
    queue: QueueOp,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum QueueOp {
    Send {
        to: String,
        content: Value,
        #[serde(default)]
        priority: MessagePriority,
    },
    Broadcast {
        content: Value,
        #[serde(default)]
        priority: MessagePriority,
    },
    Receive,
    Peek,
    Acknowledge {
        id: String,
    },
    Fail {
        id: String,
        error: String,
    },
}

struct Rejection {
    code: &'static str,
    message: String,
}

impl Rejection {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<AuthError> for Rejection {
    fn from(err: AuthError) -> Self {
        let code = match &err {
            AuthError::InvalidToken => "INVALID_TOKEN",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::TokenRevoked => "TOKEN_REVOKED",
            AuthError::Forbidden { .. } => "FORBIDDEN",
        };
        Self::new(code, err.to_string())
    }
}

impl From<QueueError> for Rejection {
    fn from(err: QueueError) -> Self {
        let code = match &err {
            QueueError::ValidationFailed(_) => "INVALID_REQUEST",
            QueueError::QueueCapacityExceeded { .. } => "QUEUE_FULL",
            QueueError::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
        };
        Self::new(code, err.to_string())
    }
}

impl From<AgentLinkError> for Rejection {
    fn from(err: AgentLinkError) -> Self {
        match err {
            AgentLinkError::Auth(err) => err.into(),
            AgentLinkError::Queue(err) => err.into(),
            AgentLinkError::Sandbox(err) => err.into(),
            other => Self::new("INTERNAL_ERROR", other.to_string()),
        }
    }
}

impl From<SandboxError> for Rejection {
    fn from(err: SandboxError) -> Self {
        let code = match &err {
            SandboxError::CommandNotAllowed(_) => "COMMAND_NOT_ALLOWED",
            SandboxError::AccessDenied(_) => "ACCESS_DENIED",
            SandboxError::ProcessLimitExceeded { .. } => "PROCESS_LIMIT_EXCEEDED",
            SandboxError::SessionNotActive(_) => "SESSION_NOT_ACTIVE",
            SandboxError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SandboxError::InvalidTransition { .. } | SandboxError::SessionAlreadyExists(_) => {
                "SANDBOX_ERROR"
            }
        };
        Self::new(code, err.to_string())
    }
}

/// Dispatches authenticated command frames to terminal sessions and,
/// when attached, the message queue
pub struct RemoteGateway {
    auth: Arc<AuthenticationService>,
    sessions: Arc<TerminalSessionManager>,
    queue: Option<QueueAccess>,
}

impl RemoteGateway {
    pub fn new(auth: Arc<AuthenticationService>, sessions: Arc<TerminalSessionManager>) -> Self {
        Self {
            auth,
            sessions,
            queue: None,
        }
    }

    /// Serve queue operations from `queue`, gated by this gateway's tokens
    pub fn with_queue(mut self, queue: MessageQueue) -> Self {
        self.queue = Some(QueueAccess::new(Arc::clone(&self.auth), queue));
        self
    }

    pub fn auth(&self) -> &Arc<AuthenticationService> {
        &self.auth
    }

    pub fn sessions(&self) -> &Arc<TerminalSessionManager> {
        &self.sessions
    }

    /// Answer one inbound frame. Heartbeats are echoed; responses and
    /// errors from the client need no reply.
    pub async fn handle_message(&self, frame: WebSocketMessage) -> Option<WebSocketMessage> {
        match frame.frame_type {
            FrameType::Heartbeat => Some(frame),
            FrameType::Command => Some(self.handle_command(frame).await),
            FrameType::Response | FrameType::Error => None,
        }
    }

    async fn handle_command(&self, frame: WebSocketMessage) -> WebSocketMessage {
        let request = match serde_json::from_value(frame.payload) {
            Ok(GatewayRequest::Terminal(request)) => request,
            Ok(GatewayRequest::Queue(request)) => {
                return match self.handle_queue(request) {
                    Ok(payload) => WebSocketMessage::response(frame.id, payload),
                    Err(rejection) => {
                        WebSocketMessage::error(frame.id, rejection.code, rejection.message, None)
                    }
                };
            }
            Err(_) => {
                return WebSocketMessage::error(
                    frame.id,
                    "INVALID_REQUEST",
                    "Malformed command payload: expected a terminal command or a queue operation",
                    None,
                );
            }
        };

        let command_id = request.command.id.clone();
        match self.execute(request).await {
            Ok(response) => match serde_json::to_value(&response) {
                Ok(payload) => WebSocketMessage::response(frame.id, payload),
                Err(e) => WebSocketMessage::error(
                    frame.id,
                    "INTERNAL_ERROR",
                    e.to_string(),
                    Some(&command_id),
                ),
            },
            Err(rejection) => WebSocketMessage::error(
                frame.id,
                rejection.code,
                rejection.message,
                Some(&command_id),
            ),
        }
    }

    async fn execute(&self, request: CommandRequest) -> Result<TerminalResponse, Rejection> {
        // Direct grant only; the hierarchy lets `read` satisfy `execute`
        let agent_id = self
            .auth
            .authorize_token(&request.token, Permission::Execute)?;

        let session = self
            .sessions
            .get_session(&request.session_id)
            .ok_or_else(|| SandboxError::SessionNotFound(request.session_id.clone()))?;

        tracing::debug!(
            agent_id = %agent_id,
            session = %request.session_id,
            command = %request.command.command,
            "executing remote command"
        );
        Ok(session.execute_command(request.command).await?)
    }

    fn handle_queue(&self, request: QueueRequest) -> Result<Value, Rejection> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| Rejection::new("QUEUE_UNAVAILABLE", "No message queue is attached"))?;
        let token = request.token.as_str();

        let payload = match request.queue {
            QueueOp::Send {
                to,
                content,
                priority,
            } => {
                let id = queue.send(token, &to, content, priority)?;
                json!({ "id": id })
            }
            QueueOp::Broadcast { content, priority } => {
                let id = queue.broadcast(token, content, priority)?;
                json!({ "id": id })
            }
            QueueOp::Receive => {
                let message = queue.receive(token)?;
                json!({ "message": message })
            }
            QueueOp::Peek => {
                let message = queue.peek(token)?;
                json!({ "message": message })
            }
            QueueOp::Acknowledge { id } => {
                queue.acknowledge(token, &id)?;
                json!({ "id": id })
            }
            QueueOp::Fail { id, error } => {
                queue.mark_failed(token, &id, &error)?;
                json!({ "id": id })
            }
        };
        Ok(payload)
    }

    /// Accept websocket clients until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "gateway listening");
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_client(stream, peer).await {
                    tracing::debug!(%peer, error = %e, "client disconnected");
                }
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), tungstenite::Error> {
        let socket = tokio_tungstenite::accept_async(stream).await?;
        tracing::debug!(%peer, "client connected");
        let (mut writer, mut reader) = socket.split();

        while let Some(message) = reader.next().await {
            let text = match message? {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Close(_) => break,
                _ => continue,
            };

            let reply = match serde_json::from_str::<WebSocketMessage>(&text) {
                Ok(frame) => self.handle_message(frame).await,
                Err(e) => Some(WebSocketMessage::error(
                    "unknown",
                    "INVALID_FRAME",
                    format!("Malformed frame: {}", e),
                    None,
                )),
            };

            if let Some(reply) = reply {
                let Ok(text) = serde_json::to_string(&reply) else {
                    continue;
                };
                writer.send(Message::Text(text.into())).await?;
            }
        }

        tracing::debug!(%peer, "client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, TerminalConfig};
    use crate::terminal::SessionOptions;
    use serde_json::json;

    fn gateway(dir: &std::path::Path) -> RemoteGateway {
        let auth = Arc::new(AuthenticationService::new(AuthConfig::default()));
        let sessions = Arc::new(TerminalSessionManager::new(TerminalConfig {
            restricted_paths: vec!["/etc".into()],
            ..TerminalConfig::default()
        }));
        sessions
            .create_session("default", SessionOptions::in_directory(dir))
            .unwrap();
        RemoteGateway::new(auth, sessions)
    }

    fn command_frame(token: &str, session: &str, command: TerminalCommand) -> WebSocketMessage {
        WebSocketMessage::command(json!({
            "token": token,
            "sessionId": session,
            "command": command,
        }))
    }

    #[tokio::test]
    async fn test_executes_authorized_command() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        let token = gateway
            .auth()
            .generate_token("agent-1", &[Permission::Execute])
            .unwrap();

        let frame = command_frame(&token, "default", TerminalCommand::new("echo").with_args(["hi"]));
        let frame_id = frame.id.clone();
        let reply = gateway.handle_message(frame).await.unwrap();

        assert_eq!(reply.frame_type, FrameType::Response);
        assert_eq!(reply.id, frame_id);
        let response: TerminalResponse = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());

        let reply = gateway
            .handle_message(command_frame("token_nope", "default", TerminalCommand::new("ls")))
            .await
            .unwrap();
        assert_eq!(reply.frame_type, FrameType::Error);
        assert_eq!(reply.payload["code"], "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn test_requires_execute() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        let token = gateway
            .auth()
            .generate_token("reader", &[Permission::Read])
            .unwrap();

        let command = TerminalCommand::new("ls");
        let command_id = command.id.clone();
        let reply = gateway
            .handle_message(command_frame(&token, "default", command))
            .await
            .unwrap();
        assert_eq!(reply.payload["code"], "FORBIDDEN");
        assert_eq!(reply.payload["commandId"], command_id.as_str());
    }

    #[tokio::test]
    async fn test_read_or_write_never_runs_commands() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        let token = gateway
            .auth()
            .generate_token("editor", &[Permission::Read, Permission::Write])
            .unwrap();
        let marker = dir.path().join("created");

        let command = TerminalCommand::new("touch").with_args([marker.to_string_lossy()]);
        let reply = gateway
            .handle_message(command_frame(&token, "default", command))
            .await
            .unwrap();
        assert_eq!(reply.frame_type, FrameType::Error);
        assert_eq!(reply.payload["code"], "FORBIDDEN");
        assert!(!marker.exists());
    }

    fn queue_frame(token: &str, op: serde_json::Value) -> WebSocketMessage {
        WebSocketMessage::command(json!({ "token": token, "queue": op }))
    }

    #[tokio::test]
    async fn test_queue_ops_are_gated() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path()).with_queue(MessageQueue::new(Default::default()));
        let sender = gateway
            .auth()
            .generate_token("a", &[Permission::Direct])
            .unwrap();
        let reader = gateway
            .auth()
            .generate_token("b", &[Permission::Read])
            .unwrap();

        let denied = gateway
            .handle_message(queue_frame(
                &reader,
                json!({"op": "send", "to": "a", "content": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(denied.payload["code"], "FORBIDDEN");

        let sent = gateway
            .handle_message(queue_frame(
                &sender,
                json!({"op": "send", "to": "b", "content": {"task": 7}, "priority": "high"}),
            ))
            .await
            .unwrap();
        assert_eq!(sent.frame_type, FrameType::Response);
        let id = sent.payload["id"].as_str().unwrap().to_string();

        let received = gateway
            .handle_message(queue_frame(&reader, json!({"op": "receive"})))
            .await
            .unwrap();
        assert_eq!(received.payload["message"]["id"], id.as_str());
        assert_eq!(received.payload["message"]["from"], "a");
        assert_eq!(received.payload["message"]["content"]["task"], 7);

        let acked = gateway
            .handle_message(queue_frame(&reader, json!({"op": "acknowledge", "id": id})))
            .await
            .unwrap();
        assert_eq!(acked.frame_type, FrameType::Response);

        let empty = gateway
            .handle_message(queue_frame(&reader, json!({"op": "peek"})))
            .await
            .unwrap();
        assert!(empty.payload["message"].is_null());
    }

    #[tokio::test]
    async fn test_queue_without_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        let token = gateway
            .auth()
            .generate_token("b", &[Permission::Read])
            .unwrap();

        let reply = gateway
            .handle_message(queue_frame(&token, json!({"op": "receive"})))
            .await
            .unwrap();
        assert_eq!(reply.payload["code"], "QUEUE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_sandbox_and_session_errors() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());
        let token = gateway
            .auth()
            .generate_token("agent-1", &[Permission::Admin])
            .unwrap();

        let reply = gateway
            .handle_message(command_frame(
                &token,
                "default",
                TerminalCommand::new("cat").with_args(["/etc/passwd"]),
            ))
            .await
            .unwrap();
        assert_eq!(reply.payload["code"], "ACCESS_DENIED");

        let reply = gateway
            .handle_message(command_frame(&token, "missing", TerminalCommand::new("ls")))
            .await
            .unwrap();
        assert_eq!(reply.payload["code"], "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_heartbeat_echo_and_malformed_payload() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = gateway(dir.path());

        let heartbeat = WebSocketMessage::heartbeat(42);
        let echoed = gateway.handle_message(heartbeat.clone()).await.unwrap();
        assert_eq!(echoed, heartbeat);

        let reply = gateway
            .handle_message(WebSocketMessage::command(json!({"token": 1})))
            .await
            .unwrap();
        assert_eq!(reply.payload["code"], "INVALID_REQUEST");

        let response = WebSocketMessage::response("x", json!({}));
        assert!(gateway.handle_message(response).await.is_none());
    }
}
