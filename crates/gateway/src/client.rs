//! Client state and registry management.
//!
//! Uses lock-free DashMap for concurrent access. Scope membership lives in
//! [`crate::subscription::SubscriptionRegistry`]; this registry only knows
//! how to reach a connection.

use crate::error::Result;
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Default buffer size for client message channels.
/// A dashboard update is a full state, so a short queue is plenty.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 64;

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to the client's WebSocket writer.
    pub tx: mpsc::Sender<Message>,
    /// Millisecond timestamp of the last ping or pong received.
    last_ping: AtomicI64,
}

impl ClientState {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
            last_ping: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Send a message to this client.
    /// Uses try_send: a full buffer drops the message rather than blocking.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.tx.try_send(Message::Text(json.into()))?;
        Ok(())
    }

    /// Send an already-serialized text frame.
    /// Returns false if the buffer is full or the connection is gone.
    pub fn send_text(&self, json: &str) -> bool {
        self.tx.try_send(Message::Text(json.into())).is_ok()
    }

    /// Try to send a raw frame. Returns false if the buffer is full.
    pub fn try_send_raw(&self, msg: Message) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Whether the WebSocket writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Update the last ping timestamp.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Whether nothing was heard from the client for longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let silent = Utc::now().timestamp_millis() - self.last_ping.load(Ordering::Relaxed);
        silent > timeout.as_millis() as i64
    }
}

/// Lock-free registry of connected clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!("Client {} registered", id);
        id
    }

    /// Unregister a client. Returns its state if it was registered.
    pub fn unregister(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        let removed = self.clients.remove(client_id).map(|(_, client)| client);
        if removed.is_some() {
            info!("Client {} unregistered", client_id);
        }
        removed
    }

    /// Get a client by ID.
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Send one pre-serialized frame to each of the given clients.
    /// Returns how many accepted it; unknown ids and full buffers are skipped.
    pub fn send_to(&self, client_ids: &[ClientId], json: &str) -> usize {
        let mut delivered = 0;
        for id in client_ids {
            let Some(client) = self.get(id) else {
                continue;
            };
            if client.send_text(json) {
                delivered += 1;
            } else {
                debug!("Dropped update for client {} (buffer full or closed)", id);
            }
        }
        delivered
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_register_unregister() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let client = Arc::new(ClientState::new(tx));
        let id = registry.register(client);

        assert_eq!(registry.client_count(), 1);
        assert!(registry.get(&id).is_some());
        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_send_serializes_message() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = ClientState::new(tx);
        client.send(&ServerMessage::Pong).unwrap();
        assert_eq!(text_of(rx.try_recv().unwrap()), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_full_buffer_drops() {
        let (tx, mut rx) = mpsc::channel(1);
        let client = ClientState::new(tx);
        assert!(client.send_text("a"));
        assert!(!client.send_text("b"));
        assert!(matches!(
            client.send(&ServerMessage::Pong),
            Err(GatewayError::ChannelSend)
        ));
        assert_eq!(text_of(rx.try_recv().unwrap()), "a");
    }

    #[test]
    fn test_send_to_skips_unknown_and_closed() {
        let registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        let a = registry.register(Arc::new(ClientState::new(tx_a)));
        let b = registry.register(Arc::new(ClientState::new(tx_b)));
        drop(rx_b);

        let delivered = registry.send_to(&[a, b, Uuid::new_v4()], "x");
        assert_eq!(delivered, 1);
        assert_eq!(text_of(rx_a.try_recv().unwrap()), "x");
    }

    #[test]
    fn test_idle_until_ping() {
        let (tx, _rx) = mpsc::channel(1);
        let client = ClientState::new(tx);
        assert!(!client.is_idle(Duration::from_secs(5)));

        client
            .last_ping
            .store(Utc::now().timestamp_millis() - 10_000, Ordering::Relaxed);
        assert!(client.is_idle(Duration::from_secs(5)));
        assert!(!client.is_idle(Duration::from_secs(20)));

        client.update_ping();
        assert!(!client.is_idle(Duration::from_secs(5)));
    }
}
