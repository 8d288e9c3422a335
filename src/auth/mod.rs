// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Agent authentication and authorization
//!
//! Agents obtain a capability token from [`AuthenticationService`], then use
//! it to access the message queue and terminal sessions. Authentication
//! queries never fail with `Err`; token management operations do.

pub mod permission;
pub mod service;
pub mod token;

pub use permission::{
    check_permission_hierarchy, grants_directly, parse_permissions, permits, Permission,
    PermissionSet,
};
pub use service::{AuthResult, AuthenticationService, TokenStatistics};
pub use token::AgentCredentials;
