// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Command and path restrictions for terminal sessions
//!
//! Paths are compared component-wise after lexical normalisation, so a
//! restriction on `/etc` covers `/etc/passwd` and `/tmp/../etc` but not
//! `/etcetera`. Symlinks are not resolved.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use crate::config::TerminalConfig;
use crate::error::SandboxError;

/// Absolute or home-relative path anywhere in a command line, including
/// after `=` as in `--file=/etc/hosts`
static PATH_TOKEN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s='"(:])(?P<path>(?:~|/)[^\s'"`;|&()]*)"#).ok()
});

/// Allow-list of programs and deny-list of paths
#[derive(Debug, Clone, Default)]
pub struct SandboxPolicy {
    allowed_commands: HashSet<String>,
    restricted_paths: Vec<PathBuf>,
}

impl SandboxPolicy {
    pub fn new<S: AsRef<str>, P: AsRef<Path>>(
        allowed_commands: &[S],
        restricted_paths: &[P],
    ) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self {
            allowed_commands: allowed_commands
                .iter()
                .map(|c| c.as_ref().trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            restricted_paths: restricted_paths
                .iter()
                .map(|p| resolve_path(&p.as_ref().to_string_lossy(), &cwd))
                .collect(),
        }
    }

    pub fn from_config(config: &TerminalConfig) -> Self {
        Self::new(
            config.allowed_commands.as_slice(),
            config.restricted_paths.as_slice(),
        )
    }

    pub fn restricted_paths(&self) -> &[PathBuf] {
        &self.restricted_paths
    }

    /// Reject `program` unless the allow-list is empty or names it.
    /// `/bin/ls` matches an allow-list entry of `ls`.
    pub fn check_command(&self, program: &str) -> Result<(), SandboxError> {
        if self.allowed_commands.is_empty() || self.allowed_commands.contains(program) {
            return Ok(());
        }

        let base = Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        if base.is_some_and(|base| self.allowed_commands.contains(&base)) {
            return Ok(());
        }

        tracing::warn!(program, "command not in allow-list");
        Err(SandboxError::CommandNotAllowed(program.to_string()))
    }

    /// Reject a path inside any restricted directory
    pub fn check_path(&self, path: &Path) -> Result<(), SandboxError> {
        let normalized = normalize_path(path);
        match self
            .restricted_paths
            .iter()
            .find(|restricted| normalized.starts_with(restricted))
        {
            Some(restricted) => {
                tracing::warn!(
                    path = %normalized.display(),
                    restricted = %restricted.display(),
                    "path is restricted"
                );
                Err(SandboxError::AccessDenied(normalized.display().to_string()))
            }
            None => Ok(()),
        }
    }

    /// Check every path-like token of a command line, resolving relative
    /// tokens against `cwd`
    pub fn check_command_line(&self, command_line: &str, cwd: &Path) -> Result<(), SandboxError> {
        if self.restricted_paths.is_empty() {
            return Ok(());
        }

        for token in command_tokens(command_line) {
            self.check_path(&resolve_path(token, cwd))?;
        }

        if let Some(regex) = PATH_TOKEN.as_ref() {
            for capture in regex.captures_iter(command_line) {
                self.check_path(&resolve_path(&capture["path"], cwd))?;
            }
        }
        Ok(())
    }
}

/// Operands of a command line: split on whitespace and shell separators,
/// quotes stripped, option flags dropped except for their `=value` part
fn command_tokens(command_line: &str) -> impl Iterator<Item = &str> {
    command_line
        .split(|ch: char| ch.is_whitespace() || [';', '|', '&', '(', ')'].contains(&ch))
        .map(|token| token.trim_matches(|ch: char| ch == '"' || ch == '\'' || ch == '`'))
        .filter_map(|token| {
            if token.starts_with('-') {
                token.split_once('=').map(|(_, value)| value)
            } else {
                Some(token)
            }
        })
        .filter(|token| !token.is_empty())
}

/// Expand `~`, anchor relative paths at `cwd` and normalise
pub fn resolve_path(token: &str, cwd: &Path) -> PathBuf {
    let expanded = if token == "~" || token.starts_with("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(token.trim_start_matches('~').trim_start_matches('/')),
            None => PathBuf::from(token),
        }
    } else {
        PathBuf::from(token)
    };

    if expanded.is_absolute() {
        normalize_path(&expanded)
    } else {
        normalize_path(&cwd.join(expanded))
    }
}

/// Lexically remove `.` and `..` components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
