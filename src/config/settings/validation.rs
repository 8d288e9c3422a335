// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use crate::error::{AgentLinkError, Result};

use super::Settings;

impl Settings {
    /// Get the token signing secret, checking env var first.
    pub fn token_secret(&self) -> Option<String> {
        // Priority: env var > config file.
        std::env::var(&self.auth.token_secret_env)
            .ok()
            .filter(|secret| !secret.is_empty())
            .or_else(|| self.auth.token_secret.clone())
    }

    /// Get the gateway bind address, checking env var first.
    pub fn bind_address(&self) -> String {
        // Priority: env var > config file.
        std::env::var("AGENTLINK_BIND")
            .ok()
            .unwrap_or_else(|| self.server.bind.clone())
    }

    /// Reject settings that would make a service unusable.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 10] = [
            (self.auth.token_expiration_ms > 0, "auth.token_expiration_ms must be > 0"),
            (self.auth.max_tokens_per_agent > 0, "auth.max_tokens_per_agent must be > 0"),
            (self.auth.cleanup_interval_ms > 0, "auth.cleanup_interval_ms must be > 0"),
            (self.queue.max_queue_size > 0, "queue.max_queue_size must be > 0"),
            (self.queue.purge_interval_ms > 0, "queue.purge_interval_ms must be > 0"),
            (self.queue.event_capacity > 0, "queue.event_capacity must be > 0"),
            (self.terminal.max_history_size > 0, "terminal.max_history_size must be > 0"),
            (self.terminal.max_active_processes > 0, "terminal.max_active_processes must be > 0"),
            (self.transport.heartbeat_interval_ms > 0, "transport.heartbeat_interval_ms must be > 0"),
            (!self.server.default_session.trim().is_empty(), "server.default_session must not be empty"),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(AgentLinkError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}
