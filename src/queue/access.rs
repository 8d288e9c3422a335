// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Token-gated front for the message queue
//!
//! | operation                               | permission  |
//! |-----------------------------------------|-------------|
//! | `send` to a named agent                 | `direct`    |
//! | `broadcast`                             | `broadcast` |
//! | `receive`, `peek`, `acknowledge`, `fail`| `read`      |
//!
//! The caller's identity comes from the token, so an agent can only read
//! and settle messages addressed to itself or broadcast to everyone.

use serde_json::Value;
use std::sync::Arc;

use crate::auth::{AuthenticationService, Permission};
use crate::error::{QueueError, Result};

use super::message::{AgentMessage, MessagePriority, MessageType, BROADCAST_RECIPIENT};
use super::service::MessageQueue;

#[derive(Clone)]
pub struct QueueAccess {
    auth: Arc<AuthenticationService>,
    queue: MessageQueue,
}

impl QueueAccess {
    pub fn new(auth: Arc<AuthenticationService>, queue: MessageQueue) -> Self {
        Self { auth, queue }
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Enqueue a direct message from the token's agent to `to`
    pub fn send(
        &self,
        token: &str,
        to: &str,
        content: Value,
        priority: MessagePriority,
    ) -> Result<String> {
        let from = self.auth.authorize_token(token, Permission::Direct)?;
        if to == BROADCAST_RECIPIENT {
            return Err(QueueError::ValidationFailed(
                "broadcasts need the broadcast operation".to_string(),
            )
            .into());
        }
        Ok(self
            .queue
            .enqueue(AgentMessage::new(from, to, content, priority))?)
    }

    pub fn broadcast(&self, token: &str, content: Value, priority: MessagePriority) -> Result<String> {
        let from = self.auth.authorize_token(token, Permission::Broadcast)?;
        Ok(self
            .queue
            .broadcast(AgentMessage::broadcast(from, content, priority))?)
    }

    /// Dequeue the next message for the token's agent
    pub fn receive(&self, token: &str) -> Result<Option<AgentMessage>> {
        let agent_id = self.auth.authorize_token(token, Permission::Read)?;
        Ok(self.queue.dequeue(&agent_id))
    }

    pub fn peek(&self, token: &str) -> Result<Option<AgentMessage>> {
        let agent_id = self.auth.authorize_token(token, Permission::Read)?;
        Ok(self.queue.peek(&agent_id))
    }

    pub fn acknowledge(&self, token: &str, id: &str) -> Result<()> {
        let agent_id = self.auth.authorize_token(token, Permission::Read)?;
        self.ensure_addressed_to(&agent_id, id)?;
        Ok(self.queue.acknowledge(id)?)
    }

    pub fn mark_failed(&self, token: &str, id: &str, error: &str) -> Result<()> {
        let agent_id = self.auth.authorize_token(token, Permission::Read)?;
        self.ensure_addressed_to(&agent_id, id)?;
        Ok(self.queue.mark_failed(id, error)?)
    }

    /// Other agents' messages are reported as missing
    fn ensure_addressed_to(&self, agent_id: &str, id: &str) -> Result<()> {
        match self.queue.get_message_by_id(id) {
            Some(message)
                if message.message_type == MessageType::Broadcast || message.to == agent_id =>
            {
                Ok(())
            }
            _ => Err(QueueError::MessageNotFound(id.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, QueueConfig};
    use crate::error::{AgentLinkError, AuthError};
    use serde_json::json;

    fn access() -> QueueAccess {
        QueueAccess::new(
            Arc::new(AuthenticationService::new(AuthConfig::default())),
            MessageQueue::new(QueueConfig::default()),
        )
    }

    fn token(access: &QueueAccess, agent_id: &str, permissions: &[Permission]) -> String {
        access.auth.generate_token(agent_id, permissions).unwrap()
    }

    #[test]
    fn test_send_requires_direct() {
        let access = access();
        let reader = token(&access, "reader", &[Permission::Read]);

        let err = access
            .send(&reader, "b", json!("hi"), MessagePriority::Low)
            .unwrap_err();
        assert!(matches!(
            err,
            AgentLinkError::Auth(AuthError::Forbidden {
                permission: Permission::Direct,
                ..
            })
        ));
        assert_eq!(access.queue().get_statistics().total_messages, 0);
    }

    #[test]
    fn test_sender_comes_from_token() {
        let access = access();
        let sender = token(&access, "a", &[Permission::Direct]);
        let receiver = token(&access, "b", &[Permission::Read]);

        let id = access
            .send(&sender, "b", json!({"task": 1}), MessagePriority::High)
            .unwrap();
        let message = access.receive(&receiver).unwrap().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.from, "a");
        access.acknowledge(&receiver, &id).unwrap();
    }

    #[test]
    fn test_send_rejects_star_recipient() {
        let access = access();
        let sender = token(&access, "a", &[Permission::Direct]);
        assert!(matches!(
            access.send(&sender, "*", json!(1), MessagePriority::Low),
            Err(AgentLinkError::Queue(QueueError::ValidationFailed(_)))
        ));
    }

    #[test]
    fn test_broadcast_requires_broadcast() {
        let access = access();
        let direct_only = token(&access, "a", &[Permission::Direct]);
        let announcer = token(&access, "ops", &[Permission::Broadcast]);

        assert!(access
            .broadcast(&direct_only, json!("x"), MessagePriority::Low)
            .is_err());
        assert!(access
            .broadcast(&announcer, json!("x"), MessagePriority::Low)
            .is_ok());
        assert_eq!(access.queue().get_statistics().broadcast_messages, 1);
    }

    #[test]
    fn test_cannot_settle_another_agents_message() {
        let access = access();
        let sender = token(&access, "a", &[Permission::Direct]);
        let intruder = token(&access, "c", &[Permission::Read]);

        let id = access
            .send(&sender, "b", json!("private"), MessagePriority::Low)
            .unwrap();
        assert!(access.peek(&intruder).unwrap().is_none());
        assert!(matches!(
            access.acknowledge(&intruder, &id),
            Err(AgentLinkError::Queue(QueueError::MessageNotFound(_)))
        ));
        assert!(access.mark_failed(&intruder, &id, "x").is_err());
        assert_eq!(access.queue().get_queue_size("b"), 1);
    }

    #[test]
    fn test_revoked_token_refused() {
        let access = access();
        let reader = token(&access, "b", &[Permission::Read]);
        access.auth.revoke_token(&reader);
        assert!(matches!(
            access.receive(&reader),
            Err(AgentLinkError::Auth(AuthError::TokenRevoked))
        ));
    }
}
