// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Websocket transport
//!
//! [`SocketConnection`] carries JSON [`WebSocketMessage`] frames, measures
//! latency with heartbeats and reconnects with exponential back-off.
//! [`ConnectionManager`] keeps connections by id.

pub mod connection;
pub mod manager;
pub mod message;

pub use connection::{ListenerId, SocketConnection};
pub use manager::ConnectionManager;
pub use message::{ConnectionState, ConnectionStatus, FrameType, WebSocketMessage};
