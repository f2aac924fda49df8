//! Collaborator seams.
//!
//! Channel membership and message persistence are owned by the rest of the
//! portal (project rosters, the message store). The hub consumes them
//! through these traits; the in-memory implementations back the default
//! server wiring and the tests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::Utc;

use courrier_shared::error::HubError;
use courrier_shared::protocol::Message;
use courrier_shared::types::{ChannelId, ChannelKind, CorrelationId, MessageId, UserId};

/// Authorization lookup for channel membership. Expected to be a fast
/// in-memory check; anything slower belongs behind a cache on the
/// implementor's side.
pub trait MembershipProvider: Send + Sync + 'static {
    fn is_member(&self, identity: UserId, channel_id: ChannelId) -> bool;
}

/// Message persistence. The store is the only authority for message ids,
/// server timestamps, and the per-channel sequence.
pub trait MessageStore: Send + Sync + 'static {
    fn append_message(
        &self,
        channel_id: ChannelId,
        sender: UserId,
        content: String,
        correlation_id: CorrelationId,
    ) -> impl Future<Output = Result<Message, HubError>> + Send;

    /// Per-channel sequence of a stored message, used to order read
    /// markers. `None` if the message is unknown to the store.
    fn position_of(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> impl Future<Output = Option<u64>> + Send;
}

type ChannelTable = HashMap<ChannelId, (ChannelKind, HashSet<UserId>)>;

/// Membership table seeded up front. The portal resolves conversation and
/// room rosters elsewhere and mirrors them here.
#[derive(Default)]
pub struct StaticMembership {
    channels: RwLock<ChannelTable>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a two-party conversation, returning its channel id.
    pub fn add_conversation(&self, a: UserId, b: UserId) -> ChannelId {
        let channel_id = ChannelId::new();
        let members = HashSet::from([a, b]);
        self.write()
            .insert(channel_id, (ChannelKind::Conversation, members));
        channel_id
    }

    /// Register an N-party room, returning its channel id.
    pub fn add_room(&self, members: impl IntoIterator<Item = UserId>) -> ChannelId {
        let channel_id = ChannelId::new();
        let members: HashSet<UserId> = members.into_iter().collect();
        self.write().insert(channel_id, (ChannelKind::Room, members));
        channel_id
    }

    pub fn kind_of(&self, channel_id: ChannelId) -> Option<ChannelKind> {
        self.read().get(&channel_id).map(|(kind, _)| *kind)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ChannelTable> {
        self.channels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ChannelTable> {
        self.channels.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl MembershipProvider for StaticMembership {
    fn is_member(&self, identity: UserId, channel_id: ChannelId) -> bool {
        self.read()
            .get(&channel_id)
            .map(|(_, members)| members.contains(&identity))
            .unwrap_or(false)
    }
}

/// In-memory message log, one vec per channel. Sequence is the 1-based
/// position in the channel's log.
#[derive(Default)]
pub struct InMemoryStore {
    channels: tokio::sync::Mutex<HashMap<ChannelId, Vec<Message>>>,
    failing: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail with `PersistenceFailure`, until
    /// called again with `false`. Used to exercise the nack path.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn messages_in(&self, channel_id: ChannelId) -> Vec<Message> {
        self.channels
            .lock()
            .await
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl MessageStore for InMemoryStore {
    async fn append_message(
        &self,
        channel_id: ChannelId,
        sender: UserId,
        content: String,
        correlation_id: CorrelationId,
    ) -> Result<Message, HubError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HubError::PersistenceFailure(
                "message store unavailable".to_string(),
            ));
        }

        let mut channels = self.channels.lock().await;
        let log = channels.entry(channel_id).or_default();
        let message = Message {
            id: MessageId::new(),
            channel_id,
            sender,
            content,
            timestamp: Utc::now(),
            sequence: log.len() as u64 + 1,
            correlation_id: Some(correlation_id),
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn position_of(&self, channel_id: ChannelId, message_id: MessageId) -> Option<u64> {
        self.channels
            .lock()
            .await
            .get(&channel_id)?
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.sequence)
    }
}
