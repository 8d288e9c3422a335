// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Reconnecting websocket client
//!
//! ## State machine
//!
//! ```text
//! disconnected -> connecting -> connected -> disconnected   (clean close)
//!                     |             |
//!                     v             v
//!                   error <------ error      (connect/send failure, abnormal close)
//!                     |
//!                     +--> connecting        (reconnect)
//! ```
//!
//! Each established link gets a generation number. Reader and heartbeat
//! tasks carry the generation they were started for and go quiet once it is
//! superseded, so a dying link never clobbers the state of its replacement.

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::TransportConfig;
use crate::error::TransportError;

use super::message::{ConnectionState, ConnectionStatus, WebSocketMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Handle returned by listener registration
pub type ListenerId = u64;

type MessageListener = Arc<dyn Fn(&WebSocketMessage) + Send + Sync>;
type StateListener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    on_message: Vec<(ListenerId, MessageListener)>,
    on_state: Vec<(ListenerId, StateListener)>,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_link(&mut self) {
        for task in [self.reader.take(), self.heartbeat.take()].into_iter().flatten() {
            task.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_link();
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

enum LinkEnd {
    Closed,
    Failed(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Connection lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

struct Inner {
    id: String,
    config: TransportConfig,
    state: Mutex<ConnectionState>,
    writer: AsyncMutex<Option<WsSink>>,
    listeners: Mutex<Listeners>,
    tasks: Mutex<Tasks>,
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        lock(&self.tasks).abort_all();
    }
}

/// A duplex JSON frame channel over a websocket.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct SocketConnection {
    inner: Arc<Inner>,
}

impl SocketConnection {
    pub fn new(id: impl Into<String>, config: TransportConfig) -> Self {
        let id = id.into();
        let state = ConnectionState::new(id.clone(), config.max_reconnect_attempts);
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                state: Mutex::new(state),
                writer: AsyncMutex::new(None),
                listeners: Mutex::new(Listeners::default()),
                tasks: Mutex::new(Tasks::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn update_state(&self, change: impl FnOnce(&mut ConnectionState)) {
        let (before, after) = {
            let mut state = lock(&self.inner.state);
            let before = state.status;
            change(&mut state);
            (before, state.clone())
        };

        if before != after.status {
            tracing::info!(
                connection = %self.inner.id,
                from = %before,
                to = %after.status,
                "connection state changed"
            );
        }
        self.notify_state(&after);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.update_state(|state| state.status = status);
    }

    /// Register a callback for every inbound frame
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&WebSocketMessage) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.on_message.push((id, Arc::new(listener)));
        id
    }

    /// Register a callback for every state change
    pub fn on_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.on_state.push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.on_message.len() + listeners.on_state.len();
        listeners.on_message.retain(|(listener_id, _)| *listener_id != id);
        listeners.on_state.retain(|(listener_id, _)| *listener_id != id);
        before != listeners.on_message.len() + listeners.on_state.len()
    }

    fn notify_message(&self, message: &WebSocketMessage) {
        let listeners: Vec<MessageListener> = lock(&self.inner.listeners)
            .on_message
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(message))).is_err() {
                tracing::warn!(connection = %self.inner.id, "message listener panicked");
            }
        }
    }

    fn notify_state(&self, state: &ConnectionState) {
        let listeners: Vec<StateListener> = lock(&self.inner.listeners)
            .on_state
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                tracing::warn!(connection = %self.inner.id, "state listener panicked");
            }
        }
    }

    /// Open a connection to `url`, resetting the reconnect counter
    pub async fn connect(&self, url: &str) -> Result<(), TransportError> {
        self.establish(url, true).await
    }

    async fn establish(&self, url: &str, fresh: bool) -> Result<(), TransportError> {
        self.update_state(|state| {
            state.status = ConnectionStatus::Connecting;
            state.url = Some(url.to_string());
        });

        let timeout_ms = self.inner.config.connection_timeout_ms;
        let stream = match timeout(Duration::from_millis(timeout_ms), connect_async(url)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                tracing::warn!(connection = %self.inner.id, url, error = %e, "connect failed");
                self.set_status(ConnectionStatus::Error);
                return Err(TransportError::ConnectFailed(e.to_string()));
            }
            Err(_) => {
                tracing::warn!(connection = %self.inner.id, url, timeout_ms, "connect timed out");
                self.set_status(ConnectionStatus::Error);
                return Err(TransportError::ConnectionTimeout { timeout_ms });
            }
        };

        let (sink, source) = stream.split();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.inner.tasks).abort_link();
        *self.inner.writer.lock().await = Some(sink);

        let now = Utc::now();
        self.update_state(|state| {
            state.status = ConnectionStatus::Connected;
            state.last_heartbeat = Some(now);
            if fresh {
                state.reconnect_attempts = 0;
            }
        });

        let reader = self.spawn_reader(generation, source);
        let heartbeat = self.spawn_heartbeat(generation);
        {
            let mut tasks = lock(&self.inner.tasks);
            tasks.reader = Some(reader);
            tasks.heartbeat = Some(heartbeat);
        }

        tracing::debug!(connection = %self.inner.id, url, generation, "link established");
        Ok(())
    }

    /// Send one frame, bounded by `message_timeout_ms`
    pub async fn send(&self, message: &WebSocketMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let text = serde_json::to_string(message)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let timeout_ms = self.inner.config.message_timeout_ms;

        let result = {
            let mut writer = self.inner.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            timeout(
                Duration::from_millis(timeout_ms),
                sink.send(Message::Text(text.into())),
            )
            .await
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.connection_lost(&format!("send failed: {}", e));
                Err(TransportError::SendFailed(e.to_string()))
            }
            Err(_) => {
                self.connection_lost("send timed out");
                Err(TransportError::SendTimeout { timeout_ms })
            }
        }
    }

    /// Reconnect to the last URL after an exponential back-off.
    ///
    /// Every call counts as an attempt; the counter is only reset by a
    /// fresh [`SocketConnection::connect`] or when the background loop
    /// started by `auto_reconnect` recovers the link.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let url = lock(&self.inner.state)
            .url
            .clone()
            .ok_or(TransportError::MissingUrl)?;

        let max = self.inner.config.max_reconnect_attempts;
        let mut attempt = 0;
        self.update_state(|state| {
            state.reconnect_attempts += 1;
            attempt = state.reconnect_attempts;
        });

        if attempt > max {
            tracing::warn!(connection = %self.inner.id, max, "reconnect attempts exhausted");
            self.set_status(ConnectionStatus::Error);
            return Err(TransportError::MaxReconnectAttemptsExceeded { max });
        }

        let delay = self.inner.config.backoff_delay(attempt);
        tracing::info!(
            connection = %self.inner.id,
            attempt,
            max,
            delay_ms = delay.as_millis() as u64,
            "reconnecting"
        );
        tokio::time::sleep(delay).await;
        self.establish(&url, false).await
    }

    /// Close the link and stop all background work
    pub async fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.tasks).abort_all();

        let sink = self.inner.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let close_timeout = Duration::from_millis(self.inner.config.message_timeout_ms);
            let _ = timeout(close_timeout, sink.close()).await;
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<WebSocketMessage>(text) {
            Ok(message) => self.handle_inbound(message),
            Err(e) => {
                tracing::warn!(connection = %self.inner.id, error = %e, "ignoring malformed frame");
            }
        }
    }

    fn handle_inbound(&self, message: WebSocketMessage) {
        if let Some(sent_ms) = message.heartbeat_timestamp() {
            let now = Utc::now();
            let latency = (now.timestamp_millis() - sent_ms).max(0) as u64;
            self.update_state(|state| {
                state.last_heartbeat = Some(now);
                state.latency = Some(latency);
            });
        }
        self.notify_message(&message);
    }

    fn link_ended(&self, generation: u64, end: LinkEnd) {
        if !self.is_current(generation) {
            return;
        }
        match end {
            LinkEnd::Closed => {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                if let Some(task) = lock(&self.inner.tasks).heartbeat.take() {
                    task.abort();
                }
                if let Ok(mut writer) = self.inner.writer.try_lock() {
                    writer.take();
                }
                self.set_status(ConnectionStatus::Disconnected);
            }
            LinkEnd::Failed(reason) => self.connection_lost(&reason),
        }
    }

    fn connection_lost(&self, reason: &str) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.tasks).abort_link();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }

        tracing::warn!(connection = %self.inner.id, reason, "connection lost");
        self.set_status(ConnectionStatus::Error);

        if self.inner.config.auto_reconnect {
            self.spawn_reconnect_loop();
        }
    }

    fn spawn_reader(&self, generation: u64, mut source: WsSource) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let end = loop {
                let frame = source.next().await;
                let Some(conn) = SocketConnection::from_weak(&weak) else {
                    return;
                };
                match frame {
                    Some(Ok(Message::Text(text))) => conn.handle_text(&text),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => conn.handle_text(text),
                        Err(_) => {
                            tracing::warn!(connection = %conn.inner.id, "ignoring non-UTF-8 frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) => break LinkEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break LinkEnd::Failed(e.to_string()),
                    None => break LinkEnd::Failed("stream ended without close".to_string()),
                }
            };

            if let Some(conn) = SocketConnection::from_weak(&weak) {
                conn.link_ended(generation, end);
            }
        })
    }

    fn spawn_heartbeat(&self, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval = Duration::from_millis(self.inner.config.heartbeat_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(conn) = SocketConnection::from_weak(&weak) else {
                    break;
                };
                if !conn.is_current(generation) || !conn.is_connected() {
                    break;
                }

                let frame = WebSocketMessage::heartbeat(Utc::now().timestamp_millis());
                if let Err(e) = conn.send(&frame).await {
                    tracing::debug!(connection = %conn.inner.id, error = %e, "heartbeat failed");
                    break;
                }
            }
        })
    }

    fn spawn_reconnect_loop(&self) {
        let mut tasks = lock(&self.inner.tasks);
        if tasks.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        tasks.reconnect = Some(tokio::spawn(async move {
            loop {
                let Some(conn) = SocketConnection::from_weak(&weak) else {
                    return;
                };
                match conn.reconnect().await {
                    Ok(()) => {
                        // Each recovered link gets the full budget for its next loss
                        conn.update_state(|state| state.reconnect_attempts = 0);
                        if conn.is_connected() {
                            return;
                        }
                    }
                    Err(
                        e @ (TransportError::MaxReconnectAttemptsExceeded { .. }
                        | TransportError::MissingUrl),
                    ) => {
                        tracing::warn!(connection = %conn.inner.id, error = %e, "giving up on reconnect");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(connection = %conn.inner.id, error = %e, "reconnect attempt failed");
                    }
                }
            }
        }));
    }
}
