// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

use serde::{Deserialize, Serialize};

/// Notification published on every queue state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { id: String, to: String },
    Delivered { id: String, agent_id: String },
    Acknowledged { id: String },
    Failed { id: String, error: String },
    RetryScheduled { id: String, attempt: u32 },
    Requeued { id: String },
    DeadLettered { id: String },
    Purged { count: usize },
}
