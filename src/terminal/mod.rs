// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Sandboxed terminal sessions
//!
//! A [`TerminalSession`] runs commands in a fixed working directory and
//! environment, subject to a [`SandboxPolicy`]. The
//! [`TerminalSessionManager`] multiplexes sessions by id.

pub mod manager;
pub mod sandbox;
pub mod session;
pub mod types;

pub use manager::TerminalSessionManager;
pub use sandbox::SandboxPolicy;
pub use session::TerminalSession;
pub use types::{
    SessionOptions, SessionStatus, TerminalCommand, TerminalResponse, TerminalSessionState,
};
