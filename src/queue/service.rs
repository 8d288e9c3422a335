// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Per-agent priority mailboxes with a shared broadcast pool
//!
//! ## Ordering
//!
//! Each mailbox is a `BTreeMap` keyed by (priority descending, timestamp,
//! insertion sequence), so the first entry is always the next to deliver.
//! The sequence number keeps FIFO order stable for identical timestamps.
//!
//! ## Lifecycle
//!
//! ```text
//! enqueue -> pending -> dequeue -> delivered (in flight) -> acknowledge
//!                                        |
//!                                        +-> mark_failed -> retry (pending)
//!                                                        \-> dead letter
//! ```
//!
//! Broadcasts stay in the pool after delivery; every agent sees each
//! broadcast at most once.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{system_clock, Clock};
use crate::config::QueueConfig;
use crate::error::QueueError;

use super::event::QueueEvent;
use super::message::{
    AgentMessage, MessagePriority, MessageStatus, MessageType, BROADCAST_RECIPIENT,
};

/// Counters and per-status breakdown of the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatistics {
    /// Messages currently held (mailboxes, broadcast pool, scheduled retries)
    pub total_messages: usize,
    pub delivered_messages: u64,
    pub failed_messages: u64,
    pub pending: usize,
    pub delivered: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub broadcast_messages: usize,
    pub scheduled_retries: usize,
    pub dead_letters: usize,
    pub queue_sizes: HashMap<String, usize>,
}

/// Immutable snapshot of queue contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    /// Each mailbox in delivery order
    pub mailboxes: HashMap<String, Vec<AgentMessage>>,
    pub broadcasts: Vec<AgentMessage>,
    pub total_messages: usize,
    pub delivered_messages: u64,
    pub failed_messages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<MessagePriority>,
    timestamp: DateTime<Utc>,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Mailbox,
    Broadcast,
}

type Mailbox = BTreeMap<OrderKey, AgentMessage>;

#[derive(Debug, Default)]
struct QueueStore {
    mailboxes: HashMap<String, Mailbox>,
    broadcasts: Mailbox,
    /// Broadcast ids already delivered to each agent
    broadcast_seen: HashMap<String, HashSet<String>>,
    in_flight: HashMap<String, AgentMessage>,
    /// Failed messages waiting for their retry timer
    retrying: HashMap<String, AgentMessage>,
    dead_letters: VecDeque<AgentMessage>,
    delivered_messages: u64,
    failed_messages: u64,
    next_seq: u64,
}

impl QueueStore {
    fn held(&self) -> usize {
        self.mailboxes.values().map(BTreeMap::len).sum::<usize>()
            + self.broadcasts.len()
            + self.retrying.len()
    }

    fn insert(&mut self, message: AgentMessage) {
        let key = OrderKey {
            priority: Reverse(message.priority),
            timestamp: message.timestamp,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if message.message_type == MessageType::Broadcast {
            self.broadcasts.insert(key, message);
        } else {
            self.mailboxes
                .entry(message.to.clone())
                .or_default()
                .insert(key, message);
        }
    }

    /// Next candidate for `agent_id` without mutating anything
    fn next_for(&self, agent_id: &str) -> Option<(Source, OrderKey)> {
        let direct = self
            .mailboxes
            .get(agent_id)
            .and_then(|mailbox| mailbox.keys().next().copied());

        let seen = self.broadcast_seen.get(agent_id);
        let broadcast = self
            .broadcasts
            .iter()
            .find(|(_, m)| seen.map_or(true, |ids| !ids.contains(&m.id)))
            .map(|(key, _)| *key);

        match (direct, broadcast) {
            (Some(d), Some(b)) if b < d => Some((Source::Broadcast, b)),
            (Some(d), _) => Some((Source::Mailbox, d)),
            (None, Some(b)) => Some((Source::Broadcast, b)),
            (None, None) => None,
        }
    }

    /// Remove a pending direct message wherever it is queued
    fn take_pending(&mut self, id: &str) -> Option<AgentMessage> {
        let (agent_id, key) = self.mailboxes.iter().find_map(|(agent_id, mailbox)| {
            mailbox
                .iter()
                .find(|(_, m)| m.id == id)
                .map(|(key, _)| (agent_id.clone(), *key))
        })?;

        let mailbox = self.mailboxes.get_mut(&agent_id)?;
        let message = mailbox.remove(&key);
        if mailbox.is_empty() {
            self.mailboxes.remove(&agent_id);
        }
        message
    }

    fn broadcast_mut(&mut self, id: &str) -> Option<&mut AgentMessage> {
        self.broadcasts.values_mut().find(|m| m.id == id)
    }

    fn push_dead_letter(&mut self, message: AgentMessage, max: usize) {
        if max == 0 {
            return;
        }
        while self.dead_letters.len() >= max {
            if let Some(evicted) = self.dead_letters.pop_front() {
                tracing::debug!(id = %evicted.id, "evicted oldest dead letter");
            }
        }
        self.dead_letters.push_back(message);
    }

    fn all_messages(&self) -> impl Iterator<Item = &AgentMessage> {
        self.mailboxes
            .values()
            .flat_map(BTreeMap::values)
            .chain(self.broadcasts.values())
            .chain(self.in_flight.values())
            .chain(self.retrying.values())
            .chain(self.dead_letters.iter())
    }
}

struct Shared {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    store: Mutex<QueueStore>,
    events: broadcast::Sender<QueueEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn abort_tasks(&self) {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// In-memory message queue shared between agents.
///
/// Cloning yields another handle to the same queue. Background work (retry
/// timers, the expiry sweep) only holds weak references and is aborted when
/// the last handle is dropped or on [`MessageQueue::shutdown`].
#[derive(Clone)]
pub struct MessageQueue {
    shared: Arc<Shared>,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                store: Mutex::new(QueueStore::default()),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a queue and start its expiry sweep.
    /// Must be called from within a tokio runtime.
    pub fn start(config: QueueConfig) -> Self {
        let queue = Self::new(config);
        queue.start_purge_task();
        queue
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Receive a [`QueueEvent`] for every state change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    fn store(&self) -> MutexGuard<'_, QueueStore> {
        match self.shared.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Queue store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is not an error
        let _ = self.shared.events.send(event);
    }

    fn validate(message: &mut AgentMessage) -> Result<(), QueueError> {
        if message.id.trim().is_empty() {
            return Err(QueueError::ValidationFailed("id is required".to_string()));
        }
        if message.from.trim().is_empty() {
            return Err(QueueError::ValidationFailed("from is required".to_string()));
        }
        if message.to.trim().is_empty() {
            return Err(QueueError::ValidationFailed("to is required".to_string()));
        }

        if message.to == BROADCAST_RECIPIENT {
            message.message_type = MessageType::Broadcast;
        } else if message.message_type == MessageType::Broadcast {
            return Err(QueueError::ValidationFailed(format!(
                "broadcast messages must be addressed to '{}'",
                BROADCAST_RECIPIENT
            )));
        }
        Ok(())
    }

    /// Add a message to its recipient's mailbox (or the broadcast pool)
    pub fn enqueue(&self, mut message: AgentMessage) -> Result<String, QueueError> {
        Self::validate(&mut message)?;
        message.status = MessageStatus::Pending;

        let id = message.id.clone();
        let to = message.to.clone();
        {
            let mut store = self.store();
            let held = store.held();
            if held >= self.shared.config.max_queue_size {
                tracing::warn!(held, max = self.shared.config.max_queue_size, "queue full");
                return Err(QueueError::QueueCapacityExceeded {
                    max: self.shared.config.max_queue_size,
                });
            }
            store.insert(message);
        }

        tracing::debug!(id = %id, to = %to, "enqueued message");
        self.emit(QueueEvent::Enqueued {
            id: id.clone(),
            to,
        });
        Ok(id)
    }

    /// Enqueue a message given as raw JSON, rejecting malformed fields
    pub fn enqueue_json(&self, value: Value) -> Result<String, QueueError> {
        let message: AgentMessage = serde_json::from_value(value)
            .map_err(|e| QueueError::ValidationFailed(e.to_string()))?;
        self.enqueue(message)
    }

    /// Address `message` to every agent and enqueue it
    pub fn broadcast(&self, mut message: AgentMessage) -> Result<String, QueueError> {
        message.to = BROADCAST_RECIPIENT.to_string();
        message.message_type = MessageType::Broadcast;
        self.enqueue(message)
    }

    /// Take the next message for `agent_id`.
    ///
    /// Direct messages leave the mailbox and wait in flight for an
    /// acknowledgement. Broadcasts are copied and stay in the pool.
    pub fn dequeue(&self, agent_id: &str) -> Option<AgentMessage> {
        let mut store = self.store();
        let (source, key) = store.next_for(agent_id)?;

        let delivered = match source {
            Source::Mailbox => {
                let mailbox = store.mailboxes.get_mut(agent_id)?;
                let mut message = mailbox.remove(&key)?;
                if mailbox.is_empty() {
                    store.mailboxes.remove(agent_id);
                }
                message.status = MessageStatus::Delivered;
                store.in_flight.insert(message.id.clone(), message.clone());
                message
            }
            Source::Broadcast => {
                let message = store.broadcasts.get_mut(&key)?;
                message.status = MessageStatus::Delivered;
                let copy = message.clone();
                store
                    .broadcast_seen
                    .entry(agent_id.to_string())
                    .or_default()
                    .insert(copy.id.clone());
                copy
            }
        };
        store.delivered_messages += 1;
        drop(store);

        tracing::debug!(id = %delivered.id, agent_id, "delivered message");
        self.emit(QueueEvent::Delivered {
            id: delivered.id.clone(),
            agent_id: agent_id.to_string(),
        });
        Some(delivered)
    }

    /// The message `dequeue` would return, without taking it
    pub fn peek(&self, agent_id: &str) -> Option<AgentMessage> {
        let store = self.store();
        let (source, key) = store.next_for(agent_id)?;
        match source {
            Source::Mailbox => store.mailboxes.get(agent_id)?.get(&key).cloned(),
            Source::Broadcast => store.broadcasts.get(&key).cloned(),
        }
    }

    /// Mark a message as handled. It will not be retried.
    pub fn acknowledge(&self, id: &str) -> Result<(), QueueError> {
        {
            let mut store = self.store();
            let handled = store.in_flight.remove(id).is_some()
                || store.retrying.remove(id).is_some()
                || store.take_pending(id).is_some();
            if !handled {
                let message = store
                    .broadcast_mut(id)
                    .ok_or_else(|| QueueError::MessageNotFound(id.to_string()))?;
                message.status = MessageStatus::Acknowledged;
            }
        }

        tracing::debug!(id, "acknowledged message");
        self.emit(QueueEvent::Acknowledged { id: id.to_string() });
        Ok(())
    }

    /// Record a delivery failure and retry or dead-letter the message
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<(), QueueError> {
        let now = self.shared.clock.now();
        let mut store = self.store();

        let taken = match store.in_flight.remove(id) {
            Some(message) => Some(message),
            None => store.take_pending(id),
        };

        let Some(mut message) = taken else {
            // Broadcasts are shared between agents and are not retried
            let broadcast = store
                .broadcast_mut(id)
                .ok_or_else(|| QueueError::MessageNotFound(id.to_string()))?;
            broadcast.status = MessageStatus::Failed;
            broadcast.set_metadata("error", json!(error));
            broadcast.set_metadata("failedAt", json!(now.to_rfc3339()));
            store.failed_messages += 1;
            drop(store);

            self.emit(QueueEvent::Failed {
                id: id.to_string(),
                error: error.to_string(),
            });
            return Ok(());
        };

        message.status = MessageStatus::Failed;
        message.set_metadata("error", json!(error));
        message.set_metadata("failedAt", json!(now.to_rfc3339()));
        store.failed_messages += 1;

        let attempt = message.retry_count();
        let retry = attempt < self.shared.config.retry_attempts;
        if retry {
            store.retrying.insert(message.id.clone(), message.clone());
        } else if self.shared.config.dead_letter_enabled {
            store.push_dead_letter(message.clone(), self.shared.config.max_dead_letters);
        }
        drop(store);

        self.emit(QueueEvent::Failed {
            id: id.to_string(),
            error: error.to_string(),
        });

        if retry {
            tracing::info!(id, attempt = attempt + 1, "scheduling message retry");
            self.emit(QueueEvent::RetryScheduled {
                id: id.to_string(),
                attempt: attempt + 1,
            });
            self.schedule_retry(id.to_string());
        } else if self.shared.config.dead_letter_enabled {
            tracing::warn!(id, attempts = attempt, "message moved to dead letters");
            self.emit(QueueEvent::DeadLettered { id: id.to_string() });
        } else {
            tracing::warn!(id, attempts = attempt, "message dropped after final failure");
        }
        Ok(())
    }

    fn schedule_retry(&self, id: String) {
        let delay = self.shared.config.retry_delay();
        let runtime = if delay.is_zero() {
            None
        } else {
            tokio::runtime::Handle::try_current().ok()
        };

        let Some(runtime) = runtime else {
            self.requeue_retry(&id);
            return;
        };

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                MessageQueue { shared }.requeue_retry(&id);
            }
        });
        self.track(task);
    }

    /// Move a failed message from the retry table back into its mailbox.
    /// Does nothing if it was acknowledged or cancelled meanwhile.
    fn requeue_retry(&self, id: &str) {
        let now = self.shared.clock.now();
        let attempt = {
            let mut store = self.store();
            let Some(mut message) = store.retrying.remove(id) else {
                return;
            };
            let attempt = message.retry_count() + 1;
            message.status = MessageStatus::Pending;
            message.timestamp = now;
            message.set_metadata("retryCount", json!(attempt));
            // Capacity was reserved when the retry was scheduled
            store.insert(message);
            attempt
        };

        tracing::debug!(id, attempt, "requeued failed message");
        self.emit(QueueEvent::Requeued { id: id.to_string() });
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = match self.shared.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Messages that exhausted their retries, oldest first
    pub fn dead_letters(&self) -> Vec<AgentMessage> {
        self.store().dead_letters.iter().cloned().collect()
    }

    /// Move a dead letter back into its mailbox with a fresh retry budget
    pub fn requeue_dead_letter(&self, id: &str) -> Result<String, QueueError> {
        let now = self.shared.clock.now();
        let mut store = self.store();

        let position = store
            .dead_letters
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| QueueError::MessageNotFound(id.to_string()))?;

        if store.held() >= self.shared.config.max_queue_size {
            return Err(QueueError::QueueCapacityExceeded {
                max: self.shared.config.max_queue_size,
            });
        }

        let Some(mut message) = store.dead_letters.remove(position) else {
            return Err(QueueError::MessageNotFound(id.to_string()));
        };
        message.status = MessageStatus::Pending;
        message.timestamp = now;
        if let Some(metadata) = message.metadata.as_mut() {
            metadata.remove("retryCount");
        }
        store.insert(message);
        drop(store);

        tracing::info!(id, "requeued dead letter");
        self.emit(QueueEvent::Requeued { id: id.to_string() });
        Ok(id.to_string())
    }

    /// Drop every pending message addressed to `agent_id`
    pub fn purge_queue(&self, agent_id: &str) -> usize {
        let removed = self
            .store()
            .mailboxes
            .remove(agent_id)
            .map(|mailbox| mailbox.len())
            .unwrap_or(0);

        if removed > 0 {
            tracing::info!(agent_id, removed, "purged mailbox");
            self.emit(QueueEvent::Purged { count: removed });
        }
        removed
    }

    /// Drop messages older than `max_message_age_ms`
    pub fn purge_expired_messages(&self) -> usize {
        let now = self.shared.clock.now();
        let max_age = Duration::milliseconds(self.shared.config.max_message_age_ms as i64);
        let expired = |m: &AgentMessage| now - m.timestamp > max_age;

        let mut store = self.store();
        let mut removed = 0;

        for mailbox in store.mailboxes.values_mut() {
            let before = mailbox.len();
            mailbox.retain(|_, m| !expired(m));
            removed += before - mailbox.len();
        }
        store.mailboxes.retain(|_, mailbox| !mailbox.is_empty());

        let expired_broadcasts: HashSet<String> = store
            .broadcasts
            .values()
            .filter(|m| expired(m))
            .map(|m| m.id.clone())
            .collect();
        if !expired_broadcasts.is_empty() {
            store.broadcasts.retain(|_, m| !expired_broadcasts.contains(&m.id));
            for seen in store.broadcast_seen.values_mut() {
                seen.retain(|id| !expired_broadcasts.contains(id));
            }
            store.broadcast_seen.retain(|_, seen| !seen.is_empty());
            removed += expired_broadcasts.len();
        }

        // Delivered but never acknowledged
        let before = store.in_flight.len();
        store.in_flight.retain(|_, m| !expired(m));
        removed += before - store.in_flight.len();
        drop(store);

        if removed > 0 {
            tracing::info!(removed, "purged expired messages");
            self.emit(QueueEvent::Purged { count: removed });
        }
        removed
    }

    /// Pending direct messages for `agent_id`
    pub fn get_queue_size(&self, agent_id: &str) -> usize {
        self.store()
            .mailboxes
            .get(agent_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Pending direct messages for `agent_id` in delivery order
    pub fn get_queue_contents(&self, agent_id: &str) -> Vec<AgentMessage> {
        self.store()
            .mailboxes
            .get(agent_id)
            .map(|mailbox| mailbox.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `dequeue` would return something, counting unseen broadcasts
    pub fn has_messages(&self, agent_id: &str) -> bool {
        self.store().next_for(agent_id).is_some()
    }

    pub fn get_message_by_id(&self, id: &str) -> Option<AgentMessage> {
        self.store().all_messages().find(|m| m.id == id).cloned()
    }

    pub fn get_statistics(&self) -> QueueStatistics {
        let store = self.store();
        let mut stats = QueueStatistics {
            total_messages: store.held(),
            delivered_messages: store.delivered_messages,
            failed_messages: store.failed_messages,
            in_flight: store.in_flight.len(),
            broadcast_messages: store.broadcasts.len(),
            scheduled_retries: store.retrying.len(),
            dead_letters: store.dead_letters.len(),
            queue_sizes: store
                .mailboxes
                .iter()
                .map(|(agent_id, mailbox)| (agent_id.clone(), mailbox.len()))
                .collect(),
            ..QueueStatistics::default()
        };

        for message in store.all_messages() {
            match message.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Delivered => stats.delivered += 1,
                MessageStatus::Acknowledged => stats.acknowledged += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn snapshot(&self) -> QueueState {
        let store = self.store();
        QueueState {
            mailboxes: store
                .mailboxes
                .iter()
                .map(|(agent_id, mailbox)| (agent_id.clone(), mailbox.values().cloned().collect()))
                .collect(),
            broadcasts: store.broadcasts.values().cloned().collect(),
            total_messages: store.held(),
            delivered_messages: store.delivered_messages,
            failed_messages: store.failed_messages,
        }
    }

    /// Start the periodic expiry sweep
    pub fn start_purge_task(&self) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let interval = self.shared.config.purge_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                MessageQueue { shared }.purge_expired_messages();
            }
        });
        self.track(task);
    }

    /// Stop the expiry sweep and cancel pending retries
    pub fn shutdown(&self) {
        self.shared.abort_tasks();
        let mut store = self.store();
        if !store.retrying.is_empty() {
            tracing::debug!(cancelled = store.retrying.len(), "cancelled pending retries");
            store.retrying.clear();
        }
    }
}
