//! Message delivery and reconciliation.
//!
//! A submit validates membership, hands the content to the message store
//! (the only authority for ids, timestamps, and sequence), then fans the
//! confirmed message out to the channel's subscribers. The origin
//! connection gets an ack carrying its correlation id instead of the
//! broadcast, so the client can replace its optimistic echo without a
//! duplicate render; the sender's other connections get the broadcast like
//! any member. A failed submit nacks the origin and broadcasts nothing.
//!
//! Append and fan-out for one channel happen under that channel's submit
//! lock, so broadcast order always matches persistence order. Different
//! channels submit concurrently.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use courrier_shared::constants::{MAX_MESSAGE_SIZE, TABLE_SHARDS};
use courrier_shared::error::HubError;
use courrier_shared::protocol::{Message, ServerEvent};
use courrier_shared::types::{ChannelId, ConnectionId, CorrelationId};

use crate::collab::{MembershipProvider, MessageStore};
use crate::registry::ConnectionRegistry;
use crate::router::SubscriptionRouter;
use crate::shards::ShardedMap;

pub struct MessageDelivery {
    submit_locks: ShardedMap<ChannelId, Arc<Mutex<()>>>,
}

impl MessageDelivery {
    pub fn new() -> Self {
        Self {
            submit_locks: ShardedMap::new(TABLE_SHARDS),
        }
    }

    pub async fn submit<A, M>(
        &self,
        store: &M,
        registry: &ConnectionRegistry,
        router: &SubscriptionRouter<A>,
        origin: ConnectionId,
        channel_id: ChannelId,
        content: String,
        correlation_id: CorrelationId,
    ) -> Result<Message, HubError>
    where
        A: MembershipProvider,
        M: MessageStore,
    {
        let identity = registry
            .identity_of(origin)
            .await
            .ok_or(HubError::UnknownConnection(origin))?;

        if content.len() > MAX_MESSAGE_SIZE {
            let error = HubError::MessageTooLarge {
                size: content.len(),
                max: MAX_MESSAGE_SIZE,
            };
            nack(registry, origin, correlation_id, &error).await;
            return Err(error);
        }

        if !router.is_member(identity, channel_id) {
            let error = HubError::NotAMember {
                identity,
                channel_id,
            };
            nack(registry, origin, correlation_id, &error).await;
            return Err(error);
        }

        let lock = self.lock_for(channel_id).await;
        let _ordered = lock.lock().await;

        let message = match store
            .append_message(channel_id, identity, content, correlation_id)
            .await
        {
            Ok(message) => message,
            Err(error) => {
                warn!(channel = %channel_id, error = %error, "Message append failed");
                nack(registry, origin, correlation_id, &error).await;
                return Err(error);
            }
        };

        for member in router.members_of(channel_id).await {
            if member == origin {
                continue;
            }
            registry
                .send_to(member, ServerEvent::Message(message.clone()))
                .await;
        }
        registry
            .send_to(
                origin,
                ServerEvent::Ack {
                    correlation_id,
                    message: message.clone(),
                },
            )
            .await;

        debug!(
            message = %message.id,
            channel = %channel_id,
            sequence = message.sequence,
            "Message delivered"
        );
        Ok(message)
    }

    async fn lock_for(&self, channel_id: ChannelId) -> Arc<Mutex<()>> {
        self.submit_locks
            .with_entry(&channel_id, |slot| {
                slot.get_or_insert_with(|| Arc::new(Mutex::new(()))).clone()
            })
            .await
    }
}

impl Default for MessageDelivery {
    fn default() -> Self {
        Self::new()
    }
}

async fn nack(
    registry: &ConnectionRegistry,
    origin: ConnectionId,
    correlation_id: CorrelationId,
    error: &HubError,
) {
    registry
        .send_to(
            origin,
            ServerEvent::Nack {
                correlation_id,
                reason: error.to_string(),
            },
        )
        .await;
}
