// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Sandboxed terminal session
//!
//! Commands are spawned directly (no shell): the first whitespace token of
//! `TerminalCommand::command` is the program and everything else becomes
//! its arguments. Each command holds a process slot for as long as it runs;
//! the slot is released on completion, timeout, or session termination.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::TerminalConfig;
use crate::error::SandboxError;

use super::sandbox::{resolve_path, SandboxPolicy};
use super::types::{
    SessionOptions, SessionStatus, TerminalCommand, TerminalResponse, TerminalSessionState,
};

#[derive(Debug)]
struct SessionInner {
    status: SessionStatus,
    environment: HashMap<String, String>,
    working_directory: PathBuf,
    history: VecDeque<String>,
    active_processes: usize,
    last_activity: DateTime<Utc>,
}

enum Outcome {
    Finished {
        status: std::io::Result<ExitStatus>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    Cancelled,
}

/// A sandboxed command-execution context
pub struct TerminalSession {
    id: String,
    config: TerminalConfig,
    policy: SandboxPolicy,
    inner: Mutex<SessionInner>,
    cancel: watch::Sender<bool>,
}

/// Holds one process slot; released on drop
struct ProcessSlot<'a> {
    session: &'a TerminalSession,
}

impl Drop for ProcessSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.inner();
        inner.active_processes = inner.active_processes.saturating_sub(1);
        inner.last_activity = Utc::now();
    }
}

impl TerminalSession {
    /// Create a session in the `initializing` state
    pub fn new(id: impl Into<String>, config: TerminalConfig) -> Self {
        let policy = SandboxPolicy::from_config(&config);
        let (cancel, _) = watch::channel(false);
        let working_directory = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

        Self {
            id: id.into(),
            config,
            policy,
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Initializing,
                environment: HashMap::new(),
                working_directory,
                history: VecDeque::new(),
                active_processes: 0,
                last_activity: Utc::now(),
            }),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(session = %self.id, "Session lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.inner().status
    }

    /// Apply options and move to `active`.
    ///
    /// A restricted working directory leaves the session in `error`.
    pub fn initialize(&self, options: SessionOptions) -> Result<(), SandboxError> {
        let mut inner = self.inner();
        if inner.status != SessionStatus::Initializing {
            return Err(SandboxError::InvalidTransition {
                from: inner.status,
                to: SessionStatus::Active,
            });
        }

        if let Some(environment) = options.environment {
            inner.environment.extend(environment);
        }

        let working_directory = match options.working_directory {
            Some(dir) => resolve_path(&dir.to_string_lossy(), &inner.working_directory),
            None => inner.working_directory.clone(),
        };
        if let Err(e) = self.policy.check_path(&working_directory) {
            inner.status = SessionStatus::Error;
            tracing::warn!(session = %self.id, error = %e, "session initialization failed");
            return Err(e);
        }

        inner.working_directory = working_directory;
        inner.status = SessionStatus::Active;
        inner.last_activity = Utc::now();
        tracing::info!(
            session = %self.id,
            cwd = %inner.working_directory.display(),
            "terminal session active"
        );
        Ok(())
    }

    /// Run a command.
    ///
    /// Only sandbox and state violations are returned as errors. Spawn
    /// failures, non-zero exits and timeouts are reported in the response.
    pub async fn execute_command(
        &self,
        command: TerminalCommand,
    ) -> Result<TerminalResponse, SandboxError> {
        let started = Instant::now();
        let mut tokens = command.command.split_whitespace();
        let program = tokens.next().unwrap_or_default().to_string();
        let inline_args: Vec<String> = tokens.map(str::to_string).collect();

        let (cwd, environment, slot) = {
            let mut inner = self.inner();
            if inner.status != SessionStatus::Active {
                return Err(SandboxError::SessionNotActive(inner.status));
            }
            if inner.active_processes >= self.config.max_active_processes {
                tracing::warn!(
                    session = %self.id,
                    active = inner.active_processes,
                    "process limit reached"
                );
                return Err(SandboxError::ProcessLimitExceeded {
                    limit: self.config.max_active_processes,
                });
            }
            if program.is_empty() {
                return Err(SandboxError::CommandNotAllowed(String::new()));
            }
            self.policy.check_command(&program)?;

            let cwd = match &command.working_directory {
                Some(dir) => resolve_path(&dir.to_string_lossy(), &inner.working_directory),
                None => inner.working_directory.clone(),
            };
            self.policy.check_path(&cwd)?;
            self.policy.check_command_line(&command.command_line(), &cwd)?;

            inner.history.push_back(program.clone());
            while inner.history.len() > self.config.max_history_size {
                inner.history.pop_front();
            }
            inner.active_processes += 1;
            inner.last_activity = Utc::now();

            let mut environment = inner.environment.clone();
            environment.extend(command.environment.clone());
            (cwd, environment, ProcessSlot { session: self })
        };

        let timeout_ms = command.timeout.unwrap_or(self.config.command_timeout_ms);
        tracing::debug!(
            session = %self.id,
            command_id = %command.id,
            program = %program,
            cwd = %cwd.display(),
            "executing command"
        );

        let (exit_code, stdout, stderr) = self
            .run(&program, &inline_args, &command.args, &cwd, &environment, timeout_ms)
            .await;
        drop(slot);

        Ok(TerminalResponse {
            command_id: command.id,
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        })
    }

    async fn run(
        &self,
        program: &str,
        inline_args: &[String],
        args: &[String],
        cwd: &Path,
        environment: &HashMap<String, String>,
        timeout_ms: u64,
    ) -> (i32, String, String) {
        let mut child = match Command::new(program)
            .args(inline_args)
            .args(args)
            .current_dir(cwd)
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!(session = %self.id, program, error = %e, "spawn failed");
                return (-1, String::new(), format!("Failed to spawn command: {}", e));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.config.max_output_bytes;
        let mut cancelled = self.cancel.subscribe();

        let outcome = {
            let run = async {
                let (stdout, stderr) =
                    tokio::join!(read_capped(stdout, limit), read_capped(stderr, limit));
                let status = child.wait().await;
                (status, stdout, stderr)
            };

            tokio::select! {
                result = timeout(Duration::from_millis(timeout_ms), run) => match result {
                    Ok((status, stdout, stderr)) => Outcome::Finished { status, stdout, stderr },
                    Err(_) => Outcome::TimedOut,
                },
                _ = async {
                    let _ = cancelled.wait_for(|cancelled| *cancelled).await;
                } => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Finished {
                status: Ok(status),
                stdout,
                stderr,
            } => (status.code().unwrap_or(-1), stdout, stderr),
            Outcome::Finished {
                status: Err(e),
                stdout,
                stderr,
            } => {
                let mut stderr = stderr;
                stderr.push_str(&format!("Failed to execute command: {}", e));
                (-1, stdout, stderr)
            }
            Outcome::TimedOut => {
                let _ = child.kill().await;
                tracing::warn!(session = %self.id, program, timeout_ms, "command timed out");
                (
                    -1,
                    String::new(),
                    format!("Command timed out after {} ms", timeout_ms),
                )
            }
            Outcome::Cancelled => {
                let _ = child.kill().await;
                (
                    -1,
                    String::new(),
                    "Command cancelled: session terminated".to_string(),
                )
            }
        }
    }

    /// Stop the session and kill running commands. Idempotent.
    pub fn terminate(&self) {
        let mut inner = self.inner();
        if inner.status == SessionStatus::Terminated {
            return;
        }
        inner.status = SessionStatus::Terminated;
        inner.active_processes = 0;
        inner.last_activity = Utc::now();
        drop(inner);

        self.cancel.send_replace(true);
        tracing::info!(session = %self.id, "terminal session terminated");
    }

    pub fn suspend(&self) -> Result<(), SandboxError> {
        self.transition(SessionStatus::Active, SessionStatus::Suspended)
    }

    pub fn resume(&self) -> Result<(), SandboxError> {
        self.transition(SessionStatus::Suspended, SessionStatus::Active)
    }

    fn transition(&self, from: SessionStatus, to: SessionStatus) -> Result<(), SandboxError> {
        let mut inner = self.inner();
        if inner.status != from {
            return Err(SandboxError::InvalidTransition {
                from: inner.status,
                to,
            });
        }
        inner.status = to;
        inner.last_activity = Utc::now();
        tracing::debug!(session = %self.id, %from, %to, "session transition");
        Ok(())
    }

    fn ensure_open(inner: &SessionInner) -> Result<(), SandboxError> {
        if inner.status == SessionStatus::Terminated {
            return Err(SandboxError::SessionNotActive(inner.status));
        }
        Ok(())
    }

    /// Merge variables into the session environment
    pub fn set_environment(&self, variables: HashMap<String, String>) -> Result<(), SandboxError> {
        let mut inner = self.inner();
        Self::ensure_open(&inner)?;
        inner.environment.extend(variables);
        inner.last_activity = Utc::now();
        Ok(())
    }

    /// Change the working directory, subject to path restrictions
    pub fn change_directory(&self, path: impl AsRef<Path>) -> Result<PathBuf, SandboxError> {
        let mut inner = self.inner();
        Self::ensure_open(&inner)?;

        let target = resolve_path(
            &path.as_ref().to_string_lossy(),
            &inner.working_directory,
        );
        self.policy.check_path(&target)?;

        inner.working_directory = target.clone();
        inner.last_activity = Utc::now();
        Ok(target)
    }

    pub fn get_command_history(&self) -> Vec<String> {
        self.inner().history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner().history.clear();
    }

    pub fn state(&self) -> TerminalSessionState {
        let inner = self.inner();
        TerminalSessionState {
            id: self.id.clone(),
            status: inner.status,
            environment: inner.environment.clone(),
            working_directory: inner.working_directory.clone(),
            command_history: inner.history.iter().cloned().collect(),
            active_processes: inner.active_processes,
            last_activity: inner.last_activity,
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes. The rest is drained
/// so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };

    let mut output = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(output.len());
                output.extend_from_slice(&buf[..n.min(room)]);
                truncated |= n > room;
            }
            Err(_) => break,
        }
    }

    let mut text = String::from_utf8_lossy(&output).into_owned();
    if truncated {
        text.push_str("\n... (output truncated)");
    }
    text
}
