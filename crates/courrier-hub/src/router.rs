//! Subscription routing.
//!
//! Tracks which connections subscribe to which channels and scopes every
//! fan-out (messages, typing, read receipts) to the channel's current
//! subscriber set. Conversations and rooms go through the same
//! authorization hook; the router does not care which kind a channel is.

use std::collections::HashSet;

use tracing::debug;

use courrier_shared::constants::TABLE_SHARDS;
use courrier_shared::error::HubError;
use courrier_shared::types::{ChannelId, ConnectionId, UserId};

use crate::collab::MembershipProvider;
use crate::shards::ShardedMap;

pub struct SubscriptionRouter<A: MembershipProvider> {
    membership: std::sync::Arc<A>,
    subscribers: ShardedMap<ChannelId, HashSet<ConnectionId>>,
}

impl<A: MembershipProvider> SubscriptionRouter<A> {
    pub fn new(membership: std::sync::Arc<A>) -> Self {
        Self {
            membership,
            subscribers: ShardedMap::new(TABLE_SHARDS),
        }
    }

    /// Add a connection to a channel's subscriber set. Rejects with
    /// `NotAMember` when the connection's identity is not an authorized
    /// member; an unauthorized subscribe changes nothing.
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        identity: UserId,
        channel_id: ChannelId,
    ) -> Result<(), HubError> {
        if !self.membership.is_member(identity, channel_id) {
            return Err(HubError::NotAMember {
                identity,
                channel_id,
            });
        }

        self.subscribers
            .with_entry(&channel_id, |slot| {
                slot.get_or_insert_with(HashSet::new).insert(connection_id);
            })
            .await;

        debug!(connection = %connection_id, channel = %channel_id, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, connection_id: ConnectionId, channel_id: ChannelId) {
        self.remove_subscriber(connection_id, channel_id).await;
        debug!(connection = %connection_id, channel = %channel_id, "Unsubscribed");
    }

    /// Connections currently subscribed to a channel.
    pub async fn members_of(&self, channel_id: ChannelId) -> Vec<ConnectionId> {
        self.subscribers
            .get_cloned(&channel_id)
            .await
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Membership check for operations that fan into a channel without
    /// subscribing (message submit).
    pub fn is_member(&self, identity: UserId, channel_id: ChannelId) -> bool {
        self.membership.is_member(identity, channel_id)
    }

    /// Drop a closed connection from every channel it was subscribed to.
    /// No subscription may outlive its connection.
    pub async fn teardown(
        &self,
        connection_id: ConnectionId,
        subscriptions: impl IntoIterator<Item = ChannelId>,
    ) {
        for channel_id in subscriptions {
            self.remove_subscriber(connection_id, channel_id).await;
        }
        debug!(connection = %connection_id, "Tore down subscriptions");
    }

    async fn remove_subscriber(&self, connection_id: ConnectionId, channel_id: ChannelId) {
        self.subscribers
            .with_entry(&channel_id, |slot| {
                if let Some(set) = slot {
                    set.remove(&connection_id);
                    if set.is_empty() {
                        *slot = None;
                    }
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::StaticMembership;
    use std::sync::Arc;

    fn router_with_conversation() -> (SubscriptionRouter<StaticMembership>, UserId, UserId, ChannelId)
    {
        let membership = Arc::new(StaticMembership::new());
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = membership.add_conversation(alice, bob);
        (SubscriptionRouter::new(membership), alice, bob, channel)
    }

    #[tokio::test]
    async fn test_subscribe_requires_membership() {
        let (router, alice, _, channel) = router_with_conversation();
        let member_conn = ConnectionId::new();
        let outsider_conn = ConnectionId::new();
        let outsider = UserId::new();

        router.subscribe(member_conn, alice, channel).await.unwrap();

        let denied = router.subscribe(outsider_conn, outsider, channel).await;
        assert!(matches!(denied, Err(HubError::NotAMember { .. })));

        let members = router.members_of(channel).await;
        assert_eq!(members, vec![member_conn]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_connection() {
        let (router, alice, _, channel) = router_with_conversation();
        let connection = ConnectionId::new();

        router.subscribe(connection, alice, channel).await.unwrap();
        router.unsubscribe(connection, channel).await;

        assert!(router.members_of(channel).await.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_clears_every_channel() {
        let membership = Arc::new(StaticMembership::new());
        let alice = UserId::new();
        let bob = UserId::new();
        let one = membership.add_conversation(alice, bob);
        let two = membership.add_room([alice, bob, UserId::new()]);
        let router = SubscriptionRouter::new(membership);
        let connection = ConnectionId::new();

        router.subscribe(connection, alice, one).await.unwrap();
        router.subscribe(connection, alice, two).await.unwrap();

        router.teardown(connection, [one, two]).await;
        assert!(router.members_of(one).await.is_empty());
        assert!(router.members_of(two).await.is_empty());
    }
}
