//! Presence tracking.
//!
//! An identity is online while at least one of its connections is alive.
//! The live-connection count per identity sits behind [`RosterStore`] so a
//! shared key-value store with atomic increment/decrement can replace the
//! in-process table when the hub runs as more than one process.
//!
//! Presence deltas are strictly global: every live connection receives
//! every roster change.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use courrier_shared::constants::TABLE_SHARDS;
use courrier_shared::protocol::ServerEvent;
use courrier_shared::types::UserId;

use crate::registry::ConnectionRegistry;
use crate::shards::ShardedMap;

/// Per-identity live-connection counting. Implementations must make each
/// increment/decrement atomic with respect to concurrent calls for the
/// same identity.
pub trait RosterStore: Send + Sync + 'static {
    /// Returns the count after the increment.
    fn incr(&self, identity: UserId) -> impl Future<Output = u64> + Send;

    /// Returns the count after the decrement. Saturates at zero.
    fn decr(&self, identity: UserId) -> impl Future<Output = u64> + Send;

    /// Identities with a nonzero count.
    fn snapshot(&self) -> impl Future<Output = Vec<UserId>> + Send;
}

/// In-process roster store over a sharded count table.
pub struct ShardedRoster {
    counts: ShardedMap<UserId, u64>,
}

impl ShardedRoster {
    pub fn new() -> Self {
        Self {
            counts: ShardedMap::new(TABLE_SHARDS),
        }
    }
}

impl Default for ShardedRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl RosterStore for ShardedRoster {
    async fn incr(&self, identity: UserId) -> u64 {
        self.counts
            .with_entry(&identity, |slot| {
                let next = slot.unwrap_or(0) + 1;
                *slot = Some(next);
                next
            })
            .await
    }

    async fn decr(&self, identity: UserId) -> u64 {
        self.counts
            .with_entry(&identity, |slot| {
                let next = slot.unwrap_or(0).saturating_sub(1);
                *slot = if next == 0 { None } else { Some(next) };
                next
            })
            .await
    }

    async fn snapshot(&self) -> Vec<UserId> {
        let mut online = Vec::new();
        self.counts
            .for_each(|identity, count| {
                if *count > 0 {
                    online.push(*identity);
                }
            })
            .await;
        online
    }
}

/// Maintains the roster and broadcasts deltas on online/offline
/// transitions.
pub struct PresenceTracker<R: RosterStore> {
    store: R,
    // Serializes the transition-plus-broadcast section per identity, so a
    // register followed by an unregister is never observed reversed.
    gates: ShardedMap<UserId, Arc<Mutex<()>>>,
}

impl<R: RosterStore> PresenceTracker<R> {
    pub fn new(store: R) -> Self {
        Self {
            store,
            gates: ShardedMap::new(TABLE_SHARDS),
        }
    }

    /// Count a new connection for `identity`. Broadcasts an online delta to
    /// every live connection when this is the identity's first connection.
    pub async fn register(
        &self,
        registry: &ConnectionRegistry,
        identity: UserId,
    ) {
        let gate = self.gate_for(identity).await;
        let _held = gate.lock().await;

        let count = self.store.incr(identity).await;
        debug!(identity = %identity, count, "Presence register");

        if count == 1 {
            registry
                .broadcast_all(
                    ServerEvent::PresenceDelta {
                        identity,
                        online_now: true,
                    },
                    None,
                )
                .await;
        }
    }

    /// Discount a closed connection for `identity`. Broadcasts an offline
    /// delta when the identity's last connection closed.
    pub async fn unregister(
        &self,
        registry: &ConnectionRegistry,
        identity: UserId,
    ) {
        let gate = self.gate_for(identity).await;
        let _held = gate.lock().await;

        let count = self.store.decr(identity).await;
        debug!(identity = %identity, count, "Presence unregister");

        if count == 0 {
            self.gates.remove(&identity).await;
            registry
                .broadcast_all(
                    ServerEvent::PresenceDelta {
                        identity,
                        online_now: false,
                    },
                    None,
                )
                .await;
        }
    }

    /// Set of currently online identities.
    pub async fn roster_snapshot(&self) -> Vec<UserId> {
        self.store.snapshot().await
    }

    async fn gate_for(&self, identity: UserId) -> Arc<Mutex<()>> {
        self.gates
            .with_entry(&identity, |slot| {
                slot.get_or_insert_with(|| Arc::new(Mutex::new(()))).clone()
            })
            .await
    }
}
