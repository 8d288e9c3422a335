// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Terminal command and session types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// A command to run inside a terminal session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCommand {
    pub id: String,
    /// Program, optionally followed by whitespace-separated arguments
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides the session working directory for this command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    /// Extra variables layered over the session environment
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Timeout in milliseconds, overriding the session default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl TerminalCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            environment: HashMap::new(),
            timestamp: Utc::now(),
            timeout: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// The command string with `args` appended
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of a command. Execution failures are reported here, not as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResponse {
    pub command_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall time in milliseconds
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
}

impl TerminalResponse {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle state of a terminal session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Suspended,
    Terminated,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Active => "active",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Terminated => "terminated",
            SessionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Options applied when a session is initialized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(default)]
    pub environment: Option<HashMap<String, String>>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl SessionOptions {
    pub fn in_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            environment: None,
            working_directory: Some(dir.into()),
        }
    }
}

/// Snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSessionState {
    pub id: String,
    pub status: SessionStatus,
    pub environment: HashMap<String, String>,
    pub working_directory: PathBuf,
    pub command_history: Vec<String>,
    pub active_processes: usize,
    pub last_activity: DateTime<Utc>,
}
