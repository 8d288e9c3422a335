// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Error types for agentlink
//!
//! Each subsystem has its own matchable error enum; `AgentLinkError` wraps
//! them so callers that don't care about the domain can use `?` throughout.

use thiserror::Error;

use crate::auth::Permission;
use crate::terminal::SessionStatus;

/// Main error type for agentlink operations
#[derive(Error, Debug)]
pub enum AgentLinkError {
    /// Token authentication failures surfaced as errors (e.g. by the gateway)
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Token lifecycle errors
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Message queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Terminal sandbox and session errors
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Socket transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(String),
}

/// Reasons a token is refused.
///
/// `authenticate` reports these inside [`crate::auth::AuthResult`] and never
/// returns `Err`; `authorize_token` returns them directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token has been revoked")]
    TokenRevoked,

    #[error("Agent {agent_id} lacks the {permission} permission")]
    Forbidden {
        agent_id: String,
        permission: Permission,
    },
}

/// Token management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Agent {agent_id} already holds the maximum of {limit} tokens")]
    TokenLimitExceeded { agent_id: String, limit: usize },

    #[error("Invalid permission: {0}")]
    InvalidPermission(String),

    #[error("Token not found")]
    TokenNotFound,

    #[error("Cannot refresh a revoked token")]
    CannotRefreshRevoked,

    #[error("Token does not need refreshing yet ({remaining_ms} ms until expiry)")]
    RefreshNotNeeded { remaining_ms: i64 },

    #[error("Token refresh is disabled")]
    RefreshDisabled,
}

/// Message queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Message validation failed: {0}")]
    ValidationFailed(String),

    #[error("Queue capacity of {max} messages exceeded")]
    QueueCapacityExceeded { max: usize },

    #[error("Message not found: {0}")]
    MessageNotFound(String),
}

/// Terminal sandbox and session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Process limit of {limit} active processes exceeded")]
    ProcessLimitExceeded { limit: usize },

    #[error("Session is not active (status: {0})")]
    SessionNotActive(SessionStatus),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Socket transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection timed out after {timeout_ms} ms")]
    ConnectionTimeout { timeout_ms: u64 },

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send timed out after {timeout_ms} ms")]
    SendTimeout { timeout_ms: u64 },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Maximum reconnect attempts ({max}) exceeded")]
    MaxReconnectAttemptsExceeded { max: u32 },

    #[error("No URL to reconnect to")]
    MissingUrl,

    #[error("Connection already exists: {0}")]
    ConnectionAlreadyExists(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),
}

/// Result type alias for agentlink operations
pub type Result<T> = std::result::Result<T, AgentLinkError>;

impl From<toml::de::Error> for AgentLinkError {
    fn from(err: toml::de::Error) -> Self {
        AgentLinkError::Toml(err.to_string())
    }
}

impl From<toml::ser::Error> for AgentLinkError {
    fn from(err: toml::ser::Error) -> Self {
        AgentLinkError::Toml(err.to_string())
    }
}
