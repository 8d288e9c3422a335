// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Frames and connection state for the socket transport

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

use crate::queue::MessagePriority;

/// Kind of a websocket frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Command,
    Response,
    Heartbeat,
    Error,
}

/// A JSON frame exchanged over a [`super::SocketConnection`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<MessagePriority>,
}

impl WebSocketMessage {
    pub fn new(frame_type: FrameType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            frame_type,
            payload,
            timestamp: Utc::now(),
            priority: None,
        }
    }

    pub fn command(payload: Value) -> Self {
        Self::new(FrameType::Command, payload)
    }

    /// A response correlated to the frame `id`
    pub fn response(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ..Self::new(FrameType::Response, payload)
        }
    }

    /// A heartbeat carrying `timestamp_ms` for latency measurement
    pub fn heartbeat(timestamp_ms: i64) -> Self {
        Self::new(FrameType::Heartbeat, json!({ "timestamp": timestamp_ms }))
    }

    /// An error frame correlated to the frame `id`
    pub fn error(
        id: impl Into<String>,
        code: &str,
        message: impl Into<String>,
        command_id: Option<&str>,
    ) -> Self {
        let mut payload = json!({ "code": code, "message": message.into() });
        if let Some(command_id) = command_id {
            payload["commandId"] = json!(command_id);
        }
        Self {
            id: id.into(),
            ..Self::new(FrameType::Error, payload)
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Echoed timestamp of a heartbeat frame
    pub fn heartbeat_timestamp(&self) -> Option<i64> {
        if self.frame_type != FrameType::Heartbeat {
            return None;
        }
        self.payload.get("timestamp").and_then(Value::as_i64)
    }
}

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub id: String,
    pub url: Option<String>,
    pub status: ConnectionStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Round trip of the last echoed heartbeat, in milliseconds
    pub latency: Option<u64>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

impl ConnectionState {
    pub fn new(id: impl Into<String>, max_reconnect_attempts: u32) -> Self {
        Self {
            id: id.into(),
            url: None,
            status: ConnectionStatus::Disconnected,
            last_heartbeat: None,
            latency: None,
            reconnect_attempts: 0,
            max_reconnect_attempts,
        }
    }
}
