// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Settings management for agentlink
//!
//! Handles loading and saving settings from ~/.agentlink/settings.json.
//! Every section and field has a default, so a partial file (or none at
//! all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod io;
mod validation;

/// Main settings structure, stored in ~/.agentlink/settings.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Token issuing and validation
    #[serde(default)]
    pub auth: AuthConfig,

    /// Agent mailbox settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Terminal session sandbox settings
    #[serde(default)]
    pub terminal: TerminalConfig,

    /// Socket transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Gateway server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Authentication service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token lifetime in milliseconds
    #[serde(default = "default_token_expiration_ms")]
    pub token_expiration_ms: u64,

    /// Maximum number of live tokens per agent
    #[serde(default = "default_max_tokens_per_agent")]
    pub max_tokens_per_agent: usize,

    /// Whether tokens may be refreshed close to expiry
    #[serde(default = "default_true")]
    pub enable_refresh_tokens: bool,

    /// How close to expiry (ms) a token must be before it can be refreshed
    #[serde(default = "default_refresh_window_ms")]
    pub refresh_window_ms: u64,

    /// Interval between expired-token sweeps
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Token signing secret (if stored directly, not recommended)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,

    /// Environment variable name for the token signing secret
    #[serde(default = "default_token_secret_env")]
    pub token_secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expiration_ms: default_token_expiration_ms(),
            max_tokens_per_agent: default_max_tokens_per_agent(),
            enable_refresh_tokens: true,
            refresh_window_ms: default_refresh_window_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            token_secret: None,
            token_secret_env: default_token_secret_env(),
        }
    }
}

impl AuthConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Message queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of messages held across all mailboxes
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Messages older than this (ms) are purged
    #[serde(default = "default_max_message_age_ms")]
    pub max_message_age_ms: u64,

    /// How many times a failed message is re-enqueued
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before a failed message is re-enqueued (ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Keep messages that exhausted their retries
    #[serde(default = "default_true")]
    pub dead_letter_enabled: bool,

    /// Maximum dead letters kept (oldest evicted first)
    #[serde(default = "default_max_dead_letters")]
    pub max_dead_letters: usize,

    /// Interval between expired-message sweeps (ms)
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,

    /// Buffer size of the queue event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_message_age_ms: default_max_message_age_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            dead_letter_enabled: true,
            max_dead_letters: default_max_dead_letters(),
            purge_interval_ms: default_purge_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

/// Terminal session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Number of commands kept in history
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,

    /// Default per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Maximum concurrently running commands per session
    #[serde(default = "default_max_active_processes")]
    pub max_active_processes: usize,

    /// Programs that may be run (empty = any)
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    /// Paths that commands and working directories may not touch
    #[serde(default)]
    pub restricted_paths: Vec<PathBuf>,

    /// Captured bytes per output stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_history_size: default_max_history_size(),
            command_timeout_ms: default_command_timeout_ms(),
            max_active_processes: default_max_active_processes(),
            allowed_commands: Vec::new(),
            restricted_paths: Vec::new(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// Socket transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum reconnect attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Heartbeat cadence in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Deadline for the websocket handshake
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Deadline for a single frame write
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// First reconnect back-off step (doubled per attempt)
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Back-off cap
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Reconnect automatically after an abnormal close
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            auto_reconnect: true,
        }
    }
}

impl TransportConfig {
    /// Back-off before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let exponential_ms = self
            .reconnect_base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(exponential_ms.min(self.max_reconnect_delay_ms))
    }
}

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Session created at startup
    #[serde(default = "default_session")]
    pub default_session: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_session: default_session(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_token_expiration_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_max_tokens_per_agent() -> usize {
    5
}

fn default_refresh_window_ms() -> u64 {
    60 * 60 * 1000
}

fn default_cleanup_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_token_secret_env() -> String {
    "AGENTLINK_TOKEN_SECRET".to_string()
}

fn default_max_queue_size() -> usize {
    10_000
}

fn default_max_message_age_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_dead_letters() -> usize {
    1000
}

fn default_purge_interval_ms() -> u64 {
    60 * 1000
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_history_size() -> usize {
    1000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_max_active_processes() -> usize {
    10
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_session() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_auth_config_default() {
        let config = AuthConfig::default();
        assert_eq!(config.token_expiration_ms, 86_400_000);
        assert_eq!(config.max_tokens_per_agent, 5);
        assert!(config.enable_refresh_tokens);
        assert_eq!(config.refresh_window_ms, 3_600_000);
        assert_eq!(config.token_secret_env, "AGENTLINK_TOKEN_SECRET");
    }

    #[test]
    fn test_terminal_config_default() {
        let config = TerminalConfig::default();
        assert_eq!(config.max_history_size, 1000);
        assert_eq!(config.command_timeout_ms, 30_000);
        assert_eq!(config.max_active_processes, 10);
        assert!(config.allowed_commands.is_empty());
        assert!(config.restricted_paths.is_empty());
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.connection_timeout_ms, 10_000);
        assert_eq!(config.message_timeout_ms, 5_000);
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = TransportConfig::default();
        assert_eq!(config.backoff_delay(1).as_millis(), 1000);
        assert_eq!(config.backoff_delay(2).as_millis(), 2000);
        assert_eq!(config.backoff_delay(3).as_millis(), 4000);
        assert_eq!(config.backoff_delay(5).as_millis(), 16000);
        assert_eq!(config.backoff_delay(6).as_millis(), 30000);
        assert_eq!(config.backoff_delay(60).as_millis(), 30000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"auth": {"max_tokens_per_agent": 2}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.auth.max_tokens_per_agent, 2);
        assert_eq!(settings.auth.token_expiration_ms, 86_400_000);
        assert_eq!(settings.queue.retry_attempts, 3);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.terminal.allowed_commands = vec!["ls".to_string(), "pwd".to_string()];
        settings.server.bind = "0.0.0.0:9000".to_string();
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.terminal.allowed_commands, vec!["ls", "pwd"]);
        assert_eq!(loaded.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_load_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agentlink.toml");
        std::fs::write(
            &path,
            "[terminal]\nrestricted_paths = [\"/etc\"]\n\n[queue]\nmax_queue_size = 3\n",
        )
        .unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.terminal.restricted_paths, vec![PathBuf::from("/etc")]);
        assert_eq!(loaded.queue.max_queue_size, 3);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Settings::load_from(&temp_dir.path().join("nope.json")).unwrap();
        assert_eq!(loaded.server.default_session, "default");
    }
}
