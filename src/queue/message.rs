// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Agent message schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Recipient address that marks a broadcast
pub const BROADCAST_RECIPIENT: &str = "*";

/// Priority level for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl MessagePriority {
    /// Numeric weight, higher is delivered first
    pub fn rank(&self) -> u8 {
        match self {
            MessagePriority::Low => 1,
            MessagePriority::Medium => 2,
            MessagePriority::High => 3,
            MessagePriority::Critical => 4,
        }
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Delivery status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Acknowledged,
    Failed,
}

impl Default for MessageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Addressing mode of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Direct,
    Broadcast,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Direct
    }
}

/// A message between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub content: Value,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl AgentMessage {
    /// Create a pending message stamped with the current time
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        content: Value,
        priority: MessagePriority,
    ) -> Self {
        let to = to.into();
        let message_type = if to == BROADCAST_RECIPIENT {
            MessageType::Broadcast
        } else {
            MessageType::Direct
        };

        Self {
            id: Uuid::new_v4().to_string(),
            from: from.into(),
            to,
            content,
            priority,
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            message_type,
            metadata: None,
        }
    }

    /// Create a broadcast message
    pub fn broadcast(from: impl Into<String>, content: Value, priority: MessagePriority) -> Self {
        Self::new(from, BROADCAST_RECIPIENT, content, priority)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_RECIPIENT
    }

    /// How many times this message has been re-enqueued after failure
    pub fn retry_count(&self) -> u32 {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("retryCount"))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(0)
    }

    pub(crate) fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Medium);
        assert!(MessagePriority::Medium > MessagePriority::Low);
        assert_eq!(MessagePriority::Critical.rank(), 4);
    }

    #[test]
    fn test_new_direct_and_broadcast() {
        let direct = AgentMessage::new("a", "b", json!("hi"), MessagePriority::Low);
        assert_eq!(direct.message_type, MessageType::Direct);
        assert_eq!(direct.status, MessageStatus::Pending);
        assert!(!direct.is_broadcast());

        let broadcast = AgentMessage::broadcast("a", json!("all"), MessagePriority::High);
        assert_eq!(broadcast.to, "*");
        assert_eq!(broadcast.message_type, MessageType::Broadcast);
        assert!(broadcast.is_broadcast());
    }

    #[test]
    fn test_wire_format() {
        let msg = AgentMessage::new("a", "b", json!({"task": 1}), MessagePriority::Critical)
            .with_id("m-1")
            .with_metadata("trace", json!("x"));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["id"], "m-1");
        assert_eq!(value["priority"], "critical");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["type"], "direct");
        assert_eq!(value["metadata"]["trace"], "x");
    }

    #[test]
    fn test_illegal_priority_rejected() {
        let raw = json!({
            "id": "m", "from": "a", "to": "b", "content": null,
            "priority": "urgent", "timestamp": "2025-01-01T00:00:00Z"
        });
        assert!(serde_json::from_value::<AgentMessage>(raw).is_err());
    }

    #[test]
    fn test_retry_count_from_metadata() {
        let msg = AgentMessage::new("a", "b", json!(null), MessagePriority::Low);
        assert_eq!(msg.retry_count(), 0);
        let msg = msg.with_metadata("retryCount", json!(2));
        assert_eq!(msg.retry_count(), 2);
    }
}
