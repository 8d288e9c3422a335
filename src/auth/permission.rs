// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Permission vocabulary and hierarchy
//!
//! The hierarchy is keyed by the *required* permission: it lists which held
//! permissions also satisfy a requirement. It is not transitive and it does
//! not flow downward, so holding `execute` alone never grants `read`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::TokenError;

/// A capability an agent token can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Execute,
    Admin,
    Create,
    Delete,
    Update,
    List,
    Broadcast,
    Direct,
    System,
}

/// The set of permissions bound to a token
pub type PermissionSet = BTreeSet<Permission>;

impl Permission {
    /// Every permission in the vocabulary
    pub const ALL: [Permission; 11] = [
        Permission::Read,
        Permission::Write,
        Permission::Execute,
        Permission::Admin,
        Permission::Create,
        Permission::Delete,
        Permission::Update,
        Permission::List,
        Permission::Broadcast,
        Permission::Direct,
        Permission::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Execute => "execute",
            Permission::Admin => "admin",
            Permission::Create => "create",
            Permission::Delete => "delete",
            Permission::Update => "update",
            Permission::List => "list",
            Permission::Broadcast => "broadcast",
            Permission::Direct => "direct",
            Permission::System => "system",
        }
    }

    /// Held permissions that also satisfy a requirement for `self`
    pub fn implied_by(&self) -> &'static [Permission] {
        match self {
            Permission::Write => &[Permission::Read],
            Permission::Execute => &[Permission::Read, Permission::Write],
            Permission::Delete => &[Permission::Read, Permission::Write],
            _ => &[],
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| TokenError::InvalidPermission(s.to_string()))
    }
}

/// Parse a list of permission names, rejecting anything outside the vocabulary
pub fn parse_permissions<S: AsRef<str>>(names: &[S]) -> Result<PermissionSet, TokenError> {
    names.iter().map(|name| name.as_ref().parse()).collect()
}

/// Hierarchy lookup: does any held permission satisfy `required` through the
/// implication table? Direct membership and `admin` are checked by the caller.
pub fn check_permission_hierarchy(held: &PermissionSet, required: Permission) -> bool {
    required.implied_by().iter().any(|p| held.contains(p))
}

/// Full authorization rule for one credential's permission set
pub fn permits(held: &PermissionSet, required: Permission) -> bool {
    grants_directly(held, required) || check_permission_hierarchy(held, required)
}

/// Strict rule for token-gated operations: `admin` or the permission itself.
/// The hierarchy table is not consulted, so `read` never unlocks `execute`.
pub fn grants_directly(held: &PermissionSet, required: Permission) -> bool {
    held.contains(&Permission::Admin) || held.contains(&required)
}
