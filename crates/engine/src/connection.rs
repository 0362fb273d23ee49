//! Connection handles and the connection registry.
//!
//! The registry is the only owner of connection handles. Channels and
//! subscriptions refer to connections by id and resolve them here at send
//! time, so a disconnected peer cleans itself up on the next fan-out.

use crate::proto::ServerMessage;
use dashmap::DashMap;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Role of a connected peer, fixed at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Server,
    Client,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::Server => "server",
            ConnectionKind::Client => "client",
        }
    }
}

/// Handle to one connected peer.
///
/// The sender enqueues outbound messages on the connection's queue and
/// returns promptly; the transport drains the queue on its own task.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(kind: ConnectionKind, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            tx,
        }
    }

    /// Enqueue a message for this peer. Returns false once the transport
    /// side has gone away.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    pub fn register(&self, conn: Arc<ConnectionHandle>) -> ConnectionId {
        let id = conn.id;
        gauge!("gateway_connection_num", "type" => conn.kind.as_str()).increment(1.0);
        self.conns.insert(id, conn);
        info!(%id, "connection registered");
        id
    }

    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, conn) = self.conns.remove(id)?;
        gauge!("gateway_connection_num", "type" => conn.kind.as_str()).decrement(1.0);
        info!(%id, "connection unregistered");
        Some(conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.conns.get(id).map(|r| r.clone())
    }

    /// Enqueue a message for a connection by id. Returns false when the
    /// connection is unknown or its transport has gone away.
    pub fn send(&self, id: &ConnectionId, msg: ServerMessage) -> bool {
        match self.conns.get(id) {
            Some(conn) => conn.send(msg),
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.conns.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_resolves_by_id() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.register(Arc::new(ConnectionHandle::new(ConnectionKind::Client, tx)));

        assert!(registry.send(&id, ServerMessage::Pong));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Pong)));

        registry.unregister(&id);
        assert!(!registry.send(&id, ServerMessage::Pong));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_send_fails_after_receiver_drop() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(Arc::new(ConnectionHandle::new(ConnectionKind::Server, tx)));

        drop(rx);
        assert!(!registry.send(&id, ServerMessage::Pong));
    }
}
