// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Registry of named terminal sessions

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::TerminalConfig;
use crate::error::SandboxError;

use super::session::TerminalSession;
use super::types::{SessionOptions, SessionStatus, TerminalSessionState};

/// Creates, looks up and tears down terminal sessions by id
pub struct TerminalSessionManager {
    config: TerminalConfig,
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
}

impl TerminalSessionManager {
    /// `config` is used for sessions created without their own
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<TerminalSession>>> {
        match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Session table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<TerminalSession>>> {
        match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Session table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Create and initialize a session with the manager's default config
    pub fn create_session(
        &self,
        id: &str,
        options: SessionOptions,
    ) -> Result<Arc<TerminalSession>, SandboxError> {
        self.create_session_with_config(id, self.config.clone(), options)
    }

    /// Create and initialize a session. Nothing is registered if
    /// initialization fails.
    pub fn create_session_with_config(
        &self,
        id: &str,
        config: TerminalConfig,
        options: SessionOptions,
    ) -> Result<Arc<TerminalSession>, SandboxError> {
        let mut sessions = self.write();
        if sessions.contains_key(id) {
            return Err(SandboxError::SessionAlreadyExists(id.to_string()));
        }

        let session = Arc::new(TerminalSession::new(id, config));
        session.initialize(options)?;
        sessions.insert(id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.read().get(id).cloned()
    }

    /// Terminate and forget a session
    pub fn terminate_session(&self, id: &str) -> Result<(), SandboxError> {
        let session = self
            .write()
            .remove(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        session.terminate();
        Ok(())
    }

    /// Terminate every session. Returns how many were terminated.
    pub fn terminate_all_sessions(&self) -> usize {
        let sessions: Vec<Arc<TerminalSession>> =
            self.write().drain().map(|(_, session)| session).collect();
        for session in &sessions {
            session.terminate();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "terminated all sessions");
        }
        sessions.len()
    }

    /// Ids of sessions currently `active`, sorted
    pub fn get_active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .values()
            .filter(|session| session.status() == SessionStatus::Active)
            .map(|session| session.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshots of every registered session, sorted by id
    pub fn get_session_states(&self) -> Vec<TerminalSessionState> {
        let mut states: Vec<TerminalSessionState> =
            self.read().values().map(|session| session.state()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub fn session_count(&self) -> usize {
        self.read().len()
    }
}

impl Drop for TerminalSessionManager {
    fn drop(&mut self) {
        self.terminate_all_sessions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_create_and_duplicate() {
        let manager = TerminalSessionManager::new(TerminalConfig::default());
        let session = manager.create_session("a", SessionOptions::default()).unwrap();
        assert_eq!(session.status(), SessionStatus::Active);

        assert!(matches!(
            manager.create_session("a", SessionOptions::default()),
            Err(SandboxError::SessionAlreadyExists(id)) if id == "a"
        ));
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn test_failed_initialize_not_registered() {
        let manager = TerminalSessionManager::new(TerminalConfig {
            restricted_paths: vec![PathBuf::from("/etc")],
            ..TerminalConfig::default()
        });
        let result = manager.create_session("bad", SessionOptions::in_directory("/etc"));
        assert!(matches!(result, Err(SandboxError::AccessDenied(_))));
        assert!(manager.get_session("bad").is_none());
    }

    #[test]
    fn test_active_sessions_and_states() {
        let manager = TerminalSessionManager::new(TerminalConfig::default());
        manager.create_session("b", SessionOptions::default()).unwrap();
        manager.create_session("a", SessionOptions::default()).unwrap();
        manager.get_session("b").unwrap().suspend().unwrap();

        assert_eq!(manager.get_active_sessions(), vec!["a".to_string()]);
        let states = manager.get_session_states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].id, "a");
        assert_eq!(states[1].status, SessionStatus::Suspended);
    }

    #[test]
    fn test_terminate() {
        let manager = TerminalSessionManager::new(TerminalConfig::default());
        let session = manager.create_session("a", SessionOptions::default()).unwrap();
        manager.create_session("b", SessionOptions::default()).unwrap();

        manager.terminate_session("a").unwrap();
        assert_eq!(session.status(), SessionStatus::Terminated);
        assert!(manager.get_session("a").is_none());
        assert_eq!(
            manager.terminate_session("a"),
            Err(SandboxError::SessionNotFound("a".to_string()))
        );

        assert_eq!(manager.terminate_all_sessions(), 1);
        assert_eq!(manager.session_count(), 0);
    }
}
