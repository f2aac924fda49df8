//! Hub orchestration.
//!
//! The hub owns the connection registry and wires the presence tracker,
//! subscription router, message delivery, typing manager, and read receipt
//! aggregator together behind one attach/detach surface. The server's
//! socket layer attaches a connection, feeds it decoded [`ClientEvent`]s,
//! and drains the returned receiver into the socket; tests drive the same
//! surface directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courrier_shared::constants::{
    OUTBOUND_QUEUE_CAPACITY, READ_COALESCE_MS, TYPING_SWEEP_INTERVAL_SECS, TYPING_TTL_SECS,
};
use courrier_shared::error::HubError;
use courrier_shared::protocol::{ClientEvent, Message, ServerEvent};
use courrier_shared::types::{ChannelId, ConnectionId, CorrelationId, MessageId, UserId};

use crate::collab::{MembershipProvider, MessageStore};
use crate::delivery::MessageDelivery;
use crate::presence::{PresenceTracker, RosterStore, ShardedRoster};
use crate::receipts::{MarkOutcome, ReadAggregator};
use crate::registry::ConnectionRegistry;
use crate::router::SubscriptionRouter;
use crate::typing::TypingManager;

/// Tunables for the hub's ephemeral-state windows.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Typing indicator time-to-live.
    pub typing_ttl: Duration,
    /// Interval of the background sweep for expired typing entries.
    pub typing_sweep_interval: Duration,
    /// Read receipt coalescing window.
    pub read_coalesce: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_secs(TYPING_TTL_SECS),
            typing_sweep_interval: Duration::from_secs(TYPING_SWEEP_INTERVAL_SECS),
            read_coalesce: Duration::from_millis(READ_COALESCE_MS),
        }
    }
}

pub struct Hub<A: MembershipProvider, M: MessageStore, R: RosterStore = ShardedRoster> {
    registry: ConnectionRegistry,
    presence: PresenceTracker<R>,
    router: SubscriptionRouter<A>,
    delivery: MessageDelivery,
    typing: TypingManager,
    receipts: ReadAggregator,
    store: Arc<M>,
    config: HubConfig,
}

impl<A: MembershipProvider, M: MessageStore> Hub<A, M, ShardedRoster> {
    pub fn new(membership: Arc<A>, store: Arc<M>) -> Self {
        Self::with_config(membership, store, HubConfig::default())
    }

    pub fn with_config(membership: Arc<A>, store: Arc<M>, config: HubConfig) -> Self {
        Self::with_roster(membership, store, ShardedRoster::new(), config)
    }
}

impl<A: MembershipProvider, M: MessageStore, R: RosterStore> Hub<A, M, R> {
    /// Build a hub over a custom roster store (the scale-out seam: a shared
    /// store with atomic counters slots in here).
    pub fn with_roster(membership: Arc<A>, store: Arc<M>, roster: R, config: HubConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            presence: PresenceTracker::new(roster),
            router: SubscriptionRouter::new(membership),
            delivery: MessageDelivery::new(),
            typing: TypingManager::with_ttl(config.typing_ttl),
            receipts: ReadAggregator::new(),
            store,
            config,
        }
    }

    /// Register a connection for an already-authenticated identity and
    /// begin presence. Returns the connection id and the receiver the
    /// caller drains into its transport.
    pub async fn attach(&self, identity: UserId) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        self.registry.insert(connection_id, identity, tx).await;
        self.presence.register(&self.registry, identity).await;

        info!(connection = %connection_id, identity = %identity, "Connection attached");
        (connection_id, rx)
    }

    /// Tear down a connection: every subscription it held is dropped and
    /// its identity goes offline if this was its last connection.
    pub async fn detach(&self, connection_id: ConnectionId) {
        let Some(entry) = self.registry.remove(connection_id).await else {
            return;
        };

        self.router
            .teardown(connection_id, entry.subscriptions)
            .await;
        self.presence.unregister(&self.registry, entry.identity).await;

        info!(connection = %connection_id, identity = %entry.identity, "Connection detached");
    }

    /// Dispatch one decoded client event.
    ///
    /// Membership and authorization failures resolve locally: the error is
    /// returned (and, for sends, nacked) without any fan-out.
    pub async fn handle_event(
        self: Arc<Self>,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), HubError> {
        match event {
            ClientEvent::Join { identity } => {
                // The handshake already attached this connection.
                warn!(connection = %connection_id, identity = %identity, "Duplicate join ignored");
                Ok(())
            }
            ClientEvent::SubscribeChannel { channel_id } => {
                self.subscribe(connection_id, channel_id).await
            }
            ClientEvent::UnsubscribeChannel { channel_id } => {
                self.unsubscribe(connection_id, channel_id).await
            }
            ClientEvent::SendMessage {
                channel_id,
                content,
                correlation_id,
            } => self
                .submit(connection_id, channel_id, content, correlation_id)
                .await
                .map(|_| ()),
            ClientEvent::TypingStart { channel_id } => {
                self.typing_start(connection_id, channel_id).await
            }
            ClientEvent::TypingStop { channel_id } => {
                self.typing_stop(connection_id, channel_id).await
            }
            ClientEvent::MarkRead {
                channel_id,
                message_id,
            } => self.mark_read(connection_id, channel_id, message_id).await,
        }
    }

    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        channel_id: ChannelId,
    ) -> Result<(), HubError> {
        let identity = self.identity_of(connection_id).await?;
        self.router
            .subscribe(connection_id, identity, channel_id)
            .await?;
        self.registry
            .add_subscription(connection_id, channel_id)
            .await;

        // A detach racing this subscribe may have already torn down the
        // connection; leave nothing dangling in the router.
        if !self.registry.is_attached(connection_id).await {
            self.router.unsubscribe(connection_id, channel_id).await;
            return Err(HubError::UnknownConnection(connection_id));
        }
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        channel_id: ChannelId,
    ) -> Result<(), HubError> {
        self.identity_of(connection_id).await?;
        self.router.unsubscribe(connection_id, channel_id).await;
        self.registry
            .remove_subscription(connection_id, channel_id)
            .await;
        Ok(())
    }

    pub async fn submit(
        &self,
        connection_id: ConnectionId,
        channel_id: ChannelId,
        content: String,
        correlation_id: CorrelationId,
    ) -> Result<Message, HubError> {
        self.delivery
            .submit(
                self.store.as_ref(),
                &self.registry,
                &self.router,
                connection_id,
                channel_id,
                content,
                correlation_id,
            )
            .await
    }

    pub async fn typing_start(
        &self,
        connection_id: ConnectionId,
        channel_id: ChannelId,
    ) -> Result<(), HubError> {
        let identity = self.member_identity(connection_id, channel_id).await?;
        if self.typing.start(channel_id, identity).await {
            self.broadcast_typing(channel_id, identity, true).await;
        }
        Ok(())
    }

    pub async fn typing_stop(
        &self,
        connection_id: ConnectionId,
        channel_id: ChannelId,
    ) -> Result<(), HubError> {
        let identity = self.member_identity(connection_id, channel_id).await?;
        if self.typing.stop(channel_id, identity).await {
            self.broadcast_typing(channel_id, identity, false).await;
        }
        Ok(())
    }

    pub async fn mark_read(
        self: Arc<Self>,
        connection_id: ConnectionId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), HubError> {
        let identity = self.member_identity(connection_id, channel_id).await?;

        let Some(sequence) = self.store.position_of(channel_id, message_id).await else {
            debug!(channel = %channel_id, message = %message_id, "Read marker for unknown message ignored");
            return Ok(());
        };

        match self
            .receipts
            .apply(channel_id, identity, message_id, sequence)
            .await
        {
            MarkOutcome::Stale | MarkOutcome::Coalesced => Ok(()),
            MarkOutcome::Scheduled => {
                let hub = Arc::clone(&self);
                let window = self.config.read_coalesce;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    hub.flush_read(channel_id, identity).await;
                });
                Ok(())
            }
        }
    }

    /// Set of currently online identities.
    pub async fn roster_snapshot(&self) -> Vec<UserId> {
        self.presence.roster_snapshot().await
    }

    /// Connections currently subscribed to a channel.
    pub async fn members_of(&self, channel_id: ChannelId) -> Vec<ConnectionId> {
        self.router.members_of(channel_id).await
    }

    /// Number of currently attached connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.connection_count().await
    }

    /// Background task broadcasting the implicit stop for typing entries
    /// whose client never sent one (crashed or disconnected mid-typing).
    pub fn spawn_typing_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.typing_sweep_interval);
            loop {
                interval.tick().await;
                for (channel_id, identity) in self.typing.sweep().await {
                    debug!(channel = %channel_id, identity = %identity, "Typing expired");
                    self.broadcast_typing(channel_id, identity, false).await;
                }
            }
        })
    }

    async fn flush_read(&self, channel_id: ChannelId, identity: UserId) {
        let Some(marker) = self.receipts.take_flush(channel_id, identity).await else {
            return;
        };
        self.broadcast_excluding(
            channel_id,
            identity,
            ServerEvent::Read {
                channel_id,
                identity,
                message_id: marker.message_id,
            },
        )
        .await;
    }

    async fn broadcast_typing(&self, channel_id: ChannelId, identity: UserId, is_typing: bool) {
        self.broadcast_excluding(
            channel_id,
            identity,
            ServerEvent::Typing {
                channel_id,
                identity,
                is_typing,
            },
        )
        .await;
    }

    /// Channel fan-out that skips every connection of the originating
    /// identity.
    async fn broadcast_excluding(
        &self,
        channel_id: ChannelId,
        originator: UserId,
        event: ServerEvent,
    ) {
        for member in self.router.members_of(channel_id).await {
            if self.registry.identity_of(member).await == Some(originator) {
                continue;
            }
            self.registry.send_to(member, event.clone()).await;
        }
    }

    async fn identity_of(&self, connection_id: ConnectionId) -> Result<UserId, HubError> {
        self.registry
            .identity_of(connection_id)
            .await
            .ok_or(HubError::UnknownConnection(connection_id))
    }

    async fn member_identity(
        &self,
        connection_id: ConnectionId,
        channel_id: ChannelId,
    ) -> Result<UserId, HubError> {
        let identity = self.identity_of(connection_id).await?;
        if !self.router.is_member(identity, channel_id) {
            return Err(HubError::NotAMember {
                identity,
                channel_id,
            });
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryStore, StaticMembership};

    struct TestBed {
        hub: Arc<Hub<StaticMembership, InMemoryStore>>,
        membership: Arc<StaticMembership>,
        store: Arc<InMemoryStore>,
    }

    fn testbed() -> TestBed {
        testbed_with_config(HubConfig::default())
    }

    fn testbed_with_config(config: HubConfig) -> TestBed {
        let membership = Arc::new(StaticMembership::new());
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(Hub::with_config(
            membership.clone(),
            store.clone(),
            config,
        ));
        TestBed {
            hub,
            membership,
            store,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_roster_tracks_last_connection() {
        let bed = testbed();
        let identity = UserId::new();

        let (first, _rx1) = bed.hub.attach(identity).await;
        let (second, _rx2) = bed.hub.attach(identity).await;
        assert!(bed.hub.roster_snapshot().await.contains(&identity));

        bed.hub.detach(first).await;
        assert!(bed.hub.roster_snapshot().await.contains(&identity));

        bed.hub.detach(second).await;
        assert!(!bed.hub.roster_snapshot().await.contains(&identity));
    }

    #[tokio::test]
    async fn test_members_never_contains_closed_connection() {
        let bed = testbed();
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        let (conn, _rx) = bed.hub.attach(alice).await;
        bed.hub.subscribe(conn, channel).await.unwrap();
        assert_eq!(bed.hub.members_of(channel).await, vec![conn]);

        bed.hub.detach(conn).await;
        assert!(bed.hub.members_of(channel).await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribed_connection_leaves_member_set() {
        let bed = testbed();
        let alice = UserId::new();
        let channel = bed.membership.add_conversation(alice, UserId::new());

        let (conn, _rx) = bed.hub.attach(alice).await;
        bed.hub.subscribe(conn, channel).await.unwrap();
        bed.hub.unsubscribe(conn, channel).await.unwrap();

        assert!(bed.hub.members_of(channel).await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_acks_origin_and_broadcasts_once_per_member() {
        let bed = testbed();
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        // Alice on two tabs, Bob on one.
        let (alice_tab1, mut rx_tab1) = bed.hub.attach(alice).await;
        let (alice_tab2, mut rx_tab2) = bed.hub.attach(alice).await;
        let (bob_conn, mut rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(alice_tab1, channel).await.unwrap();
        bed.hub.subscribe(alice_tab2, channel).await.unwrap();
        bed.hub.subscribe(bob_conn, channel).await.unwrap();
        drain(&mut rx_tab1);
        drain(&mut rx_tab2);
        drain(&mut rx_bob);

        let correlation = CorrelationId::new();
        let message = bed
            .hub
            .submit(alice_tab1, channel, "hello".into(), correlation)
            .await
            .unwrap();

        // Origin: exactly one ack, no broadcast copy.
        let origin_events = drain(&mut rx_tab1);
        assert_eq!(
            origin_events,
            vec![ServerEvent::Ack {
                correlation_id: correlation,
                message: message.clone()
            }]
        );

        // Sender's other tab converges via the broadcast.
        assert_eq!(
            drain(&mut rx_tab2),
            vec![ServerEvent::Message(message.clone())]
        );
        assert_eq!(drain(&mut rx_bob), vec![ServerEvent::Message(message)]);
    }

    #[tokio::test]
    async fn test_submit_to_unauthorized_channel_nacks_origin() {
        let bed = testbed();
        let alice = UserId::new();
        let channel = bed.membership.add_conversation(UserId::new(), UserId::new());

        let (conn, mut rx) = bed.hub.attach(alice).await;
        drain(&mut rx);

        let correlation = CorrelationId::new();
        let result = bed
            .hub
            .submit(conn, channel, "intruding".into(), correlation)
            .await;
        assert!(matches!(result, Err(HubError::NotAMember { .. })));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ServerEvent::Nack { correlation_id, .. } if *correlation_id == correlation
        ));
        assert!(bed.store.messages_in(channel).await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_nacks_origin_only() {
        let bed = testbed();
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        let (alice_conn, mut rx_alice) = bed.hub.attach(alice).await;
        let (bob_conn, mut rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(alice_conn, channel).await.unwrap();
        bed.hub.subscribe(bob_conn, channel).await.unwrap();
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        bed.store.set_failing(true);
        let correlation = CorrelationId::new();
        let result = bed
            .hub
            .submit(alice_conn, channel, "lost".into(), correlation)
            .await;
        assert!(matches!(result, Err(HubError::PersistenceFailure(_))));

        let origin_events = drain(&mut rx_alice);
        assert_eq!(origin_events.len(), 1);
        assert!(matches!(origin_events[0], ServerEvent::Nack { .. }));
        assert!(drain(&mut rx_bob).is_empty());
    }

    #[tokio::test]
    async fn test_no_live_broadcast_before_subscription() {
        let bed = testbed();
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        let (alice_conn, mut rx_alice) = bed.hub.attach(alice).await;
        bed.hub.subscribe(alice_conn, channel).await.unwrap();
        drain(&mut rx_alice);

        // Bob is offline while Alice sends.
        let correlation = CorrelationId::new();
        let message = bed
            .hub
            .submit(alice_conn, channel, "hello".into(), correlation)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx_alice),
            vec![ServerEvent::Ack {
                correlation_id: correlation,
                message
            }]
        );

        // Bob connects and subscribes later; history backfill belongs to
        // the store, the live stream carries nothing retroactive.
        let (bob_conn, mut rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(bob_conn, channel).await.unwrap();
        let events = drain(&mut rx_bob);
        assert!(events
            .iter()
            .all(|e| !matches!(e, ServerEvent::Message(_))));
        assert_eq!(bed.store.messages_in(channel).await.len(), 1);
    }

    #[tokio::test]
    async fn test_per_channel_broadcast_order_matches_sequence() {
        let bed = testbed();
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        let (alice_conn, _rx_alice) = bed.hub.attach(alice).await;
        let (bob_conn, mut rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(alice_conn, channel).await.unwrap();
        bed.hub.subscribe(bob_conn, channel).await.unwrap();
        drain(&mut rx_bob);

        for i in 0..5 {
            bed.hub
                .submit(alice_conn, channel, format!("m{i}"), CorrelationId::new())
                .await
                .unwrap();
        }

        let sequences: Vec<u64> = drain(&mut rx_bob)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::Message(m) => Some(m.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_typing_excludes_originator_and_is_idempotent() {
        let bed = testbed();
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_room([alice, bob]);

        let (alice_conn, mut rx_alice) = bed.hub.attach(alice).await;
        let (bob_conn, mut rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(alice_conn, channel).await.unwrap();
        bed.hub.subscribe(bob_conn, channel).await.unwrap();
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        bed.hub.typing_start(alice_conn, channel).await.unwrap();
        bed.hub.typing_start(alice_conn, channel).await.unwrap();
        bed.hub.typing_start(alice_conn, channel).await.unwrap();

        assert_eq!(
            drain(&mut rx_bob),
            vec![ServerEvent::Typing {
                channel_id: channel,
                identity: alice,
                is_typing: true
            }]
        );
        assert!(drain(&mut rx_alice).is_empty());

        bed.hub.typing_stop(alice_conn, channel).await.unwrap();
        assert_eq!(
            drain(&mut rx_bob),
            vec![ServerEvent::Typing {
                channel_id: channel,
                identity: alice,
                is_typing: false
            }]
        );
    }

    #[tokio::test]
    async fn test_typing_expires_without_explicit_stop() {
        let bed = testbed_with_config(HubConfig {
            typing_ttl: Duration::from_millis(30),
            typing_sweep_interval: Duration::from_millis(10),
            read_coalesce: Duration::from_millis(READ_COALESCE_MS),
        });
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_room([alice, bob]);

        let (alice_conn, _rx_alice) = bed.hub.attach(alice).await;
        let (bob_conn, mut rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(alice_conn, channel).await.unwrap();
        bed.hub.subscribe(bob_conn, channel).await.unwrap();
        drain(&mut rx_bob);

        let sweep = bed.hub.clone().spawn_typing_sweep();
        bed.hub.typing_start(alice_conn, channel).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        sweep.abort();

        assert_eq!(
            drain(&mut rx_bob),
            vec![
                ServerEvent::Typing {
                    channel_id: channel,
                    identity: alice,
                    is_typing: true
                },
                ServerEvent::Typing {
                    channel_id: channel,
                    identity: alice,
                    is_typing: false
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_read_receipts_coalesce_to_latest() {
        let bed = testbed_with_config(HubConfig {
            read_coalesce: Duration::from_millis(30),
            ..HubConfig::default()
        });
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        let (alice_conn, mut rx_alice) = bed.hub.attach(alice).await;
        let (bob_conn, mut rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(alice_conn, channel).await.unwrap();
        bed.hub.subscribe(bob_conn, channel).await.unwrap();

        let mut messages = Vec::new();
        for i in 0..3 {
            messages.push(
                bed.hub
                    .submit(alice_conn, channel, format!("m{i}"), CorrelationId::new())
                    .await
                    .unwrap(),
            );
        }
        drain(&mut rx_bob);
        drain(&mut rx_alice);

        // Bob scrolls through all three within one window.
        for message in &messages {
            bed.hub
                .clone()
                .mark_read(bob_conn, channel, message.id)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(80)).await;

        let reads: Vec<ServerEvent> = drain(&mut rx_alice)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::Read { .. }))
            .collect();
        assert_eq!(
            reads,
            vec![ServerEvent::Read {
                channel_id: channel,
                identity: bob,
                message_id: messages[2].id
            }]
        );
        assert!(drain(&mut rx_bob).is_empty());
    }

    #[tokio::test]
    async fn test_stale_read_marker_is_silent() {
        let bed = testbed_with_config(HubConfig {
            read_coalesce: Duration::from_millis(10),
            ..HubConfig::default()
        });
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        let (alice_conn, mut rx_alice) = bed.hub.attach(alice).await;
        let (bob_conn, _rx_bob) = bed.hub.attach(bob).await;
        bed.hub.subscribe(alice_conn, channel).await.unwrap();
        bed.hub.subscribe(bob_conn, channel).await.unwrap();

        let first = bed
            .hub
            .submit(alice_conn, channel, "one".into(), CorrelationId::new())
            .await
            .unwrap();
        let second = bed
            .hub
            .submit(alice_conn, channel, "two".into(), CorrelationId::new())
            .await
            .unwrap();

        bed.hub
            .clone()
            .mark_read(bob_conn, channel, second.id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        drain(&mut rx_alice);

        // Marker moving backwards: no broadcast, no state change.
        bed.hub
            .clone()
            .mark_read(bob_conn, channel, first.id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(drain(&mut rx_alice).is_empty());
    }

    #[tokio::test]
    async fn test_handle_event_dispatches_subscribe_and_send() {
        let bed = testbed();
        let alice = UserId::new();
        let bob = UserId::new();
        let channel = bed.membership.add_conversation(alice, bob);

        let (alice_conn, mut rx_alice) = bed.hub.attach(alice).await;
        drain(&mut rx_alice);

        bed.hub
            .clone()
            .handle_event(
                alice_conn,
                ClientEvent::SubscribeChannel {
                    channel_id: channel,
                },
            )
            .await
            .unwrap();

        let correlation = CorrelationId::new();
        bed.hub
            .clone()
            .handle_event(
                alice_conn,
                ClientEvent::SendMessage {
                    channel_id: channel,
                    content: "dispatched".into(),
                    correlation_id: correlation,
                },
            )
            .await
            .unwrap();

        let events = drain(&mut rx_alice);
        assert!(matches!(
            &events[..],
            [ServerEvent::Ack { correlation_id, .. }] if *correlation_id == correlation
        ));
    }

    #[tokio::test]
    async fn test_detached_connection_is_rejected() {
        let bed = testbed();
        let alice = UserId::new();
        let channel = bed.membership.add_conversation(alice, UserId::new());

        let (conn, _rx) = bed.hub.attach(alice).await;
        bed.hub.detach(conn).await;

        let result = bed.hub.subscribe(conn, channel).await;
        assert!(matches!(result, Err(HubError::UnknownConnection(_))));
    }
}
