// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Registry of named socket connections

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::TransportConfig;
use crate::error::TransportError;

use super::connection::SocketConnection;
use super::message::{ConnectionState, ConnectionStatus};

/// Creates, connects and closes socket connections by id
pub struct ConnectionManager {
    config: TransportConfig,
    connections: RwLock<HashMap<String, SocketConnection>>,
}

impl ConnectionManager {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SocketConnection>> {
        match self.connections.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Connection table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SocketConnection>> {
        match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Connection table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register an unconnected connection with the manager's config
    pub fn create_connection(&self, id: &str) -> Result<SocketConnection, TransportError> {
        self.create_connection_with_config(id, self.config.clone())
    }

    pub fn create_connection_with_config(
        &self,
        id: &str,
        config: TransportConfig,
    ) -> Result<SocketConnection, TransportError> {
        let mut connections = self.write();
        if connections.contains_key(id) {
            return Err(TransportError::ConnectionAlreadyExists(id.to_string()));
        }
        let connection = SocketConnection::new(id, config);
        connections.insert(id.to_string(), connection.clone());
        Ok(connection)
    }

    /// Create and connect in one step. A connection that fails to connect is
    /// not kept.
    pub async fn connect(&self, id: &str, url: &str) -> Result<SocketConnection, TransportError> {
        let connection = self.create_connection(id)?;
        if let Err(e) = connection.connect(url).await {
            connection.disconnect().await;
            self.write().remove(id);
            return Err(e);
        }
        Ok(connection)
    }

    pub fn get_connection(&self, id: &str) -> Option<SocketConnection> {
        self.read().get(id).cloned()
    }

    /// Disconnect and forget a connection
    pub async fn close_connection(&self, id: &str) -> Result<(), TransportError> {
        let connection = self
            .write()
            .remove(id)
            .ok_or_else(|| TransportError::ConnectionNotFound(id.to_string()))?;
        connection.disconnect().await;
        Ok(())
    }

    /// Disconnect every connection. Returns how many were closed.
    pub async fn close_all_connections(&self) -> usize {
        let connections: Vec<SocketConnection> =
            self.write().drain().map(|(_, connection)| connection).collect();
        for connection in &connections {
            connection.disconnect().await;
        }
        if !connections.is_empty() {
            tracing::info!(count = connections.len(), "closed all connections");
        }
        connections.len()
    }

    /// Ids of connections currently `connected`, sorted
    pub fn get_active_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .values()
            .filter(|connection| connection.status() == ConnectionStatus::Connected)
            .map(|connection| connection.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshots of every registered connection, sorted by id
    pub fn get_connection_states(&self) -> Vec<ConnectionState> {
        let mut states: Vec<ConnectionState> =
            self.read().values().map(|connection| connection.state()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn quick_config() -> TransportConfig {
        TransportConfig {
            connection_timeout_ms: 200,
            auto_reconnect: false,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_create_and_duplicate() {
        let manager = ConnectionManager::new(quick_config());
        let connection = manager.create_connection("a").unwrap();
        assert_eq!(connection.status(), ConnectionStatus::Disconnected);

        assert!(matches!(
            manager.create_connection("a"),
            Err(TransportError::ConnectionAlreadyExists(id)) if id == "a"
        ));
        assert!(manager.get_connection("a").is_some());
        assert!(manager.get_active_connections().is_empty());
        assert_eq!(manager.get_connection_states()[0].id, "a");
    }

    #[tokio::test]
    async fn test_failed_connect_not_registered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let manager = ConnectionManager::new(quick_config());
        assert!(manager.connect("a", &url).await.is_err());
        assert!(manager.get_connection("a").is_none());
    }

    #[tokio::test]
    async fn test_close_connections() {
        let manager = ConnectionManager::new(quick_config());
        manager.create_connection("a").unwrap();
        manager.create_connection("b").unwrap();

        manager.close_connection("a").await.unwrap();
        assert_eq!(
            manager.close_connection("a").await,
            Err(TransportError::ConnectionNotFound("a".to_string()))
        );
        assert_eq!(manager.close_all_connections().await, 1);
        assert_eq!(manager.connection_count(), 0);
    }
}
