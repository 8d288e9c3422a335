// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Agent message queue
//!
//! Prioritized per-agent mailboxes, a broadcast pool that every agent reads
//! independently, bounded retry and a dead-letter list. [`QueueAccess`]
//! puts the queue behind agent tokens.

pub mod access;
pub mod event;
pub mod message;
pub mod service;

pub use access::QueueAccess;
pub use event::QueueEvent;
pub use message::{AgentMessage, MessagePriority, MessageStatus, MessageType, BROADCAST_RECIPIENT};
pub use service::{MessageQueue, QueueState, QueueStatistics};
