// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! agentlink - remote access and messaging core for autonomous agents.
//!
//! This crate exposes the services used by the `agentlink` gateway binary
//! (`src/main.rs`):
//! - `auth`: capability tokens, permission hierarchy, authorization
//! - `queue`: per-agent prioritized inboxes, broadcasts, retries, dead letters
//! - `terminal`: sandboxed command execution in named sessions
//! - `transport`: reconnecting websocket client with heartbeats
//! - `gateway`: server side that routes authenticated commands to sessions

pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod terminal;
pub mod transport;

pub use error::{AgentLinkError, Result};
