// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Token lifecycle and authorization
//!
//! All token state lives in one store behind a single mutex, so issuing,
//! revoking and the per-agent live-token counter are updated atomically.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;

use crate::clock::{system_clock, Clock};
use crate::config::AuthConfig;
use crate::error::{AuthError, TokenError};

use super::permission::{grants_directly, parse_permissions, permits, Permission, PermissionSet};
use super::token::{mint_token, random_secret, redact, AgentCredentials};

/// Outcome of [`AuthenticationService::authenticate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub error: Option<AuthError>,
}

impl AuthResult {
    fn granted(creds: &AgentCredentials) -> Self {
        Self {
            success: true,
            agent_id: Some(creds.agent_id.clone()),
            permissions: Some(creds.permissions.clone()),
            expires_at: Some(creds.expires_at),
            error: None,
        }
    }

    fn denied(error: AuthError) -> Self {
        Self {
            success: false,
            agent_id: None,
            permissions: None,
            expires_at: None,
            error: Some(error),
        }
    }
}

/// Snapshot of the token store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatistics {
    /// Live (possibly expired) plus revoked tokens
    pub total_tokens: usize,
    pub expired_tokens: usize,
    pub revoked_tokens: usize,
    pub active_tokens: usize,
    /// Active (unexpired, unrevoked) tokens per agent
    pub tokens_by_agent: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct TokenStore {
    tokens: HashMap<String, AgentCredentials>,
    /// Revoked token -> the expiry it was issued with
    revoked: HashMap<String, DateTime<Utc>>,
    agent_token_counts: HashMap<String, usize>,
}

impl TokenStore {
    /// Move a live token to the revoked set. Returns false if it was not live.
    fn revoke(&mut self, token: &str) -> bool {
        let Some(creds) = self.tokens.remove(token) else {
            return false;
        };
        self.revoked.insert(token.to_string(), creds.expires_at);

        if let Some(count) = self.agent_token_counts.get_mut(&creds.agent_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.agent_token_counts.remove(&creds.agent_id);
            }
        }
        true
    }
}

/// Issues, validates, refreshes and revokes agent capability tokens
pub struct AuthenticationService {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
    secret: String,
    store: Mutex<TokenStore>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl AuthenticationService {
    /// Create a service using the system clock
    pub fn new(config: AuthConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a service with an explicit time source
    pub fn with_clock(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        let secret = config.token_secret.clone().unwrap_or_else(random_secret);
        Self {
            config,
            clock,
            secret,
            store: Mutex::new(TokenStore::default()),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Create a shared service and start its periodic expired-token sweep.
    /// Must be called from within a tokio runtime.
    pub fn start(config: AuthConfig) -> Arc<Self> {
        let service = Arc::new(Self::new(config));
        service.start_cleanup_task();
        service
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn store(&self) -> MutexGuard<'_, TokenStore> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Token store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn token_lifetime(&self) -> Duration {
        Duration::milliseconds(self.config.token_expiration_ms as i64)
    }

    /// Issue a token for `agent_id` carrying `permissions`
    pub fn generate_token(
        &self,
        agent_id: &str,
        permissions: &[Permission],
    ) -> Result<String, TokenError> {
        let permissions: PermissionSet = permissions.iter().copied().collect();
        let mut store = self.store();
        self.issue_locked(&mut store, agent_id, permissions)
    }

    /// Issue a token from permission names, rejecting unknown names
    pub fn generate_token_from_names<S: AsRef<str>>(
        &self,
        agent_id: &str,
        permissions: &[S],
    ) -> Result<String, TokenError> {
        let permissions = parse_permissions(permissions)?;
        let mut store = self.store();
        self.issue_locked(&mut store, agent_id, permissions)
    }

    fn issue_locked(
        &self,
        store: &mut TokenStore,
        agent_id: &str,
        permissions: PermissionSet,
    ) -> Result<String, TokenError> {
        let live = store.agent_token_counts.get(agent_id).copied().unwrap_or(0);
        if live >= self.config.max_tokens_per_agent {
            tracing::warn!(agent_id, live, "token limit reached");
            return Err(TokenError::TokenLimitExceeded {
                agent_id: agent_id.to_string(),
                limit: self.config.max_tokens_per_agent,
            });
        }

        let issued_at = self.clock.now();
        let token = mint_token(agent_id, &permissions, issued_at, &self.secret);
        let creds = AgentCredentials {
            agent_id: agent_id.to_string(),
            token: token.clone(),
            permissions,
            issued_at,
            expires_at: issued_at + self.token_lifetime(),
        };

        store.tokens.insert(token.clone(), creds);
        *store.agent_token_counts.entry(agent_id.to_string()).or_insert(0) += 1;

        tracing::info!(agent_id, token = %redact(&token), "issued token");
        Ok(token)
    }

    /// Check a token. Never fails; the reason for a rejection is in `error`.
    ///
    /// An expired token is revoked as a side effect, so the next call for the
    /// same token reports `TokenRevoked` rather than `TokenExpired`.
    pub fn authenticate(&self, token: &str) -> AuthResult {
        let now = self.clock.now();
        let mut store = self.store();

        if store.revoked.contains_key(token) {
            return AuthResult::denied(AuthError::TokenRevoked);
        }

        let Some(creds) = store.tokens.get(token) else {
            return AuthResult::denied(AuthError::InvalidToken);
        };

        if creds.is_expired_at(now) {
            let agent_id = creds.agent_id.clone();
            store.revoke(token);
            tracing::debug!(agent_id = %agent_id, token = %redact(token), "token expired, revoked");
            return AuthResult::denied(AuthError::TokenExpired);
        }

        AuthResult::granted(creds)
    }

    /// Whether `token` currently authenticates
    pub fn validate_token(&self, token: &str) -> bool {
        self.authenticate(token).success
    }

    /// Does `agent_id` hold an unexpired token granting `permission`?
    pub fn authorize(&self, agent_id: &str, permission: Permission) -> bool {
        let now = self.clock.now();
        let store = self.store();
        store
            .tokens
            .values()
            .filter(|creds| creds.agent_id == agent_id && !creds.is_expired_at(now))
            .any(|creds| permits(&creds.permissions, permission))
    }

    /// Authenticate `token` and require `permission` on that token itself.
    ///
    /// Only a direct grant or `admin` passes. Other tokens held by the same
    /// agent and the hierarchy table do not count.
    pub fn authorize_token(&self, token: &str, permission: Permission) -> Result<String, AuthError> {
        let result = self.authenticate(token);
        if let Some(err) = result.error {
            return Err(err);
        }
        let (Some(agent_id), Some(held)) = (result.agent_id, result.permissions) else {
            return Err(AuthError::InvalidToken);
        };

        if !grants_directly(&held, permission) {
            tracing::warn!(agent_id = %agent_id, %permission, "token lacks permission");
            return Err(AuthError::Forbidden {
                agent_id,
                permission,
            });
        }
        Ok(agent_id)
    }

    /// Revoke a single token. Returns true if a live token was revoked.
    pub fn revoke_token(&self, token: &str) -> bool {
        let revoked = self.store().revoke(token);
        if revoked {
            tracing::info!(token = %redact(token), "revoked token");
        }
        revoked
    }

    /// Revoke every live token held by `agent_id`
    pub fn revoke_all_tokens_for_agent(&self, agent_id: &str) -> usize {
        let mut store = self.store();
        let tokens: Vec<String> = store
            .tokens
            .values()
            .filter(|creds| creds.agent_id == agent_id)
            .map(|creds| creds.token.clone())
            .collect();

        let count = tokens.iter().filter(|token| store.revoke(token)).count();
        if count > 0 {
            tracing::info!(agent_id, count, "revoked all tokens for agent");
        }
        count
    }

    /// Exchange a token that is close to expiry for a fresh one with the
    /// same permissions. The old token is revoked in the same critical section.
    pub fn refresh_token(&self, token: &str) -> Result<String, TokenError> {
        if !self.config.enable_refresh_tokens {
            return Err(TokenError::RefreshDisabled);
        }

        let now = self.clock.now();
        let mut store = self.store();

        if store.revoked.contains_key(token) {
            return Err(TokenError::CannotRefreshRevoked);
        }

        let (agent_id, permissions, expires_at) = match store.tokens.get(token) {
            Some(creds) => (
                creds.agent_id.clone(),
                creds.permissions.clone(),
                creds.expires_at,
            ),
            None => return Err(TokenError::TokenNotFound),
        };

        let remaining = expires_at - now;
        if remaining > Duration::milliseconds(self.config.refresh_window_ms as i64) {
            return Err(TokenError::RefreshNotNeeded {
                remaining_ms: remaining.num_milliseconds(),
            });
        }

        store.revoke(token);
        let new_token = self.issue_locked(&mut store, &agent_id, permissions)?;
        tracing::info!(
            agent_id = %agent_id,
            old = %redact(token),
            new = %redact(&new_token),
            "refreshed token"
        );
        Ok(new_token)
    }

    /// Revoke every expired live token. Returns how many were revoked.
    ///
    /// Revoked entries are forgotten once they have been past their expiry
    /// for a further token lifetime; such tokens then authenticate as
    /// `InvalidToken`.
    pub fn cleanup_expired_tokens(&self) -> usize {
        let now = self.clock.now();
        let mut store = self.store();
        let expired: Vec<String> = store
            .tokens
            .values()
            .filter(|creds| creds.is_expired_at(now))
            .map(|creds| creds.token.clone())
            .collect();

        let count = expired.iter().filter(|token| store.revoke(token)).count();
        if count > 0 {
            tracing::info!(count, "cleaned up expired tokens");
        }

        let forget_before = now - self.token_lifetime();
        let before = store.revoked.len();
        store.revoked.retain(|_, expires_at| *expires_at >= forget_before);
        let pruned = before - store.revoked.len();
        if pruned > 0 {
            tracing::debug!(pruned, "forgot stale revoked tokens");
        }
        count
    }

    pub fn get_token_statistics(&self) -> TokenStatistics {
        let now = self.clock.now();
        let store = self.store();

        let mut stats = TokenStatistics {
            total_tokens: store.tokens.len() + store.revoked.len(),
            revoked_tokens: store.revoked.len(),
            ..TokenStatistics::default()
        };

        for creds in store.tokens.values() {
            if creds.is_expired_at(now) {
                stats.expired_tokens += 1;
            } else {
                stats.active_tokens += 1;
                *stats
                    .tokens_by_agent
                    .entry(creds.agent_id.clone())
                    .or_insert(0) += 1;
            }
        }

        stats
    }

    /// Start the periodic sweep. Replaces any sweep already running.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.cleanup_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.cleanup_expired_tokens();
            }
        });

        let mut slot = match self.cleanup_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background sweep
    pub fn shutdown(&self) {
        let mut slot = match self.cleanup_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl Drop for AuthenticationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
