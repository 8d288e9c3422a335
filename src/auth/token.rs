// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Token credentials and minting
//!
//! ## Token Format
//!
//! `token_<agentId>_<hex>_<issueTimestampMs>`
//!
//! The hex segment is a SHA-256 digest over the agent id, the sorted
//! permission names, the issue time, a random nonce and the service secret.
//! Tokens are opaque: only the service's store decides whether one is valid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::permission::PermissionSet;

/// A live token and what it grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCredentials {
    pub agent_id: String,
    pub token: String,
    pub permissions: PermissionSet,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AgentCredentials {
    /// Expired strictly after `expires_at`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Mint a new token string
pub(crate) fn mint_token(
    agent_id: &str,
    permissions: &PermissionSet,
    issued_at: DateTime<Utc>,
    secret: &str,
) -> String {
    let nonce: [u8; 16] = rand::random();
    let issued_ms = issued_at.timestamp_millis();

    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update([0u8]);
    for permission in permissions {
        hasher.update(permission.as_str().as_bytes());
        hasher.update([b',']);
    }
    hasher.update(issued_ms.to_be_bytes());
    hasher.update(nonce);
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();

    format!("token_{}_{}_{}", agent_id, hex::encode(&digest[..16]), issued_ms)
}

/// Generate a random signing secret for services started without one
pub(crate) fn random_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Short, log-safe prefix of a token
pub(crate) fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}…", prefix)
}
