//! Connection registry.
//!
//! One explicit state object per live connection, keyed by `ConnectionId`:
//! the identity it authenticated as, when it connected, which channels it
//! is subscribed to, and the sender half of its outbound event queue.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courrier_shared::constants::TABLE_SHARDS;
use courrier_shared::protocol::ServerEvent;
use courrier_shared::types::{ChannelId, ConnectionId, UserId};

use crate::shards::ShardedMap;

/// Per-connection state. Owned exclusively by its connection; the registry
/// shard lock only covers the map structure, not cross-connection data.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub identity: UserId,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: HashSet<ChannelId>,
    pub outbound: mpsc::Sender<ServerEvent>,
}

/// Tracks all currently attached connections.
pub struct ConnectionRegistry {
    connections: ShardedMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: ShardedMap::new(TABLE_SHARDS),
        }
    }

    /// Record a newly attached connection.
    pub async fn insert(
        &self,
        connection_id: ConnectionId,
        identity: UserId,
        outbound: mpsc::Sender<ServerEvent>,
    ) {
        let entry = ConnectionEntry {
            identity,
            connected_at: Utc::now(),
            subscriptions: HashSet::new(),
            outbound,
        };

        debug!(connection = %connection_id, identity = %identity, "Tracking new connection");
        self.connections.insert(connection_id, entry).await;
    }

    /// Remove a connection, returning its final entry so the caller can
    /// tear down its subscriptions and presence.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<ConnectionEntry> {
        let removed = self.connections.remove(&connection_id).await;
        if removed.is_some() {
            debug!(connection = %connection_id, "Removed connection from registry");
        }
        removed
    }

    pub async fn identity_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections
            .get_cloned(&connection_id)
            .await
            .map(|entry| entry.identity)
    }

    pub async fn is_attached(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id).await
    }

    /// Record a channel in the connection's own subscription set.
    pub async fn add_subscription(&self, connection_id: ConnectionId, channel_id: ChannelId) {
        self.connections
            .with_entry(&connection_id, |slot| {
                if let Some(entry) = slot {
                    entry.subscriptions.insert(channel_id);
                }
            })
            .await;
    }

    pub async fn remove_subscription(&self, connection_id: ConnectionId, channel_id: ChannelId) {
        self.connections
            .with_entry(&connection_id, |slot| {
                if let Some(entry) = slot {
                    entry.subscriptions.remove(&channel_id);
                }
            })
            .await;
    }

    /// Queue an event on one connection's outbound queue. Fan-out never
    /// blocks on a slow consumer: a full queue drops the event.
    pub async fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) {
        if let Some(entry) = self.connections.get_cloned(&connection_id).await {
            deliver(connection_id, &entry.outbound, event);
        }
    }

    /// Queue an event on every live connection, minus `exclude`.
    pub async fn broadcast_all(&self, event: ServerEvent, exclude: Option<ConnectionId>) {
        self.connections
            .for_each(|connection_id, entry| {
                if Some(*connection_id) == exclude {
                    return;
                }
                deliver(*connection_id, &entry.outbound, event.clone());
            })
            .await;
    }

    pub async fn connection_count(&self) -> usize {
        let mut count = 0;
        self.connections.for_each(|_, _| count += 1).await;
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(connection_id: ConnectionId, outbound: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if let Err(e) = outbound.try_send(event) {
        warn!(connection = %connection_id, error = %e, "Outbound queue full or closed, dropping event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courrier_shared::constants::OUTBOUND_QUEUE_CAPACITY;

    fn outbound() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let registry = ConnectionRegistry::new();
        let connection = ConnectionId::new();
        let identity = UserId::new();
        let (tx, _rx) = outbound();

        registry.insert(connection, identity, tx).await;
        assert!(registry.is_attached(connection).await);
        assert_eq!(registry.identity_of(connection).await, Some(identity));

        let entry = registry.remove(connection).await.unwrap();
        assert_eq!(entry.identity, identity);
        assert!(!registry.is_attached(connection).await);
    }

    #[tokio::test]
    async fn test_subscription_bookkeeping() {
        let registry = ConnectionRegistry::new();
        let connection = ConnectionId::new();
        let channel = ChannelId::new();
        let (tx, _rx) = outbound();

        registry.insert(connection, UserId::new(), tx).await;
        registry.add_subscription(connection, channel).await;
        registry.add_subscription(connection, channel).await;

        let entry = registry.remove(connection).await.unwrap();
        assert_eq!(entry.subscriptions.len(), 1);
        assert!(entry.subscriptions.contains(&channel));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_connection() {
        let registry = ConnectionRegistry::new();
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        let (tx1, mut rx1) = outbound();
        let (tx2, mut rx2) = outbound();

        registry.insert(first, UserId::new(), tx1).await;
        registry.insert(second, UserId::new(), tx2).await;

        let event = ServerEvent::PresenceDelta {
            identity: UserId::new(),
            online_now: true,
        };
        registry.broadcast_all(event.clone(), Some(first)).await;

        assert_eq!(rx2.recv().await, Some(event));
        assert!(rx1.try_recv().is_err());
    }
}
