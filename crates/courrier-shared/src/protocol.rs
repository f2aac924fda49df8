use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, CorrelationId, MessageId, UserId};

/// A server-confirmed chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Assigned by the message store at append time.
    pub id: MessageId,
    /// Target channel.
    pub channel_id: ChannelId,
    /// Sending identity.
    pub sender: UserId,
    /// Message body.
    pub content: String,
    /// Server-side timestamp assigned at append time.
    pub timestamp: DateTime<Utc>,
    /// Per-channel sequence assigned at append time. Fan-out order within a
    /// channel follows this value.
    pub sequence: u64,
    /// Echo of the origin client's correlation token, when one was sent.
    pub correlation_id: Option<CorrelationId>,
}

/// Events a client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientEvent {
    /// Handshake: register the connection and begin presence. Must be the
    /// first event on a fresh connection.
    Join { identity: UserId },

    /// Begin receiving fan-out for a channel.
    SubscribeChannel { channel_id: ChannelId },

    /// Stop receiving fan-out for a channel.
    UnsubscribeChannel { channel_id: ChannelId },

    /// Optimistic message submit.
    SendMessage {
        channel_id: ChannelId,
        content: String,
        correlation_id: CorrelationId,
    },

    /// Transient typing signal.
    TypingStart { channel_id: ChannelId },

    /// Explicit end of a typing signal.
    TypingStop { channel_id: ChannelId },

    /// Advance the sender's read marker for a channel.
    MarkRead {
        channel_id: ChannelId,
        message_id: MessageId,
    },
}

/// Events the server sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerEvent {
    /// Roster change, broadcast to every live connection.
    PresenceDelta { identity: UserId, online_now: bool },

    /// Confirmed message, broadcast to all channel subscribers.
    Message(Message),

    /// Sent to the origin connection only: the optimistic copy under this
    /// correlation id is now the confirmed message.
    Ack {
        correlation_id: CorrelationId,
        message: Message,
    },

    /// Sent to the origin connection only: the submit failed and no
    /// broadcast occurred. The client keeps the correlation id for retry.
    Nack {
        correlation_id: CorrelationId,
        reason: String,
    },

    /// Typing state change, fan-out excluding the originator.
    Typing {
        channel_id: ChannelId,
        identity: UserId,
        is_typing: bool,
    },

    /// Read marker advance, fan-out excluding the originator.
    Read {
        channel_id: ChannelId,
        identity: UserId,
        message_id: MessageId,
    },
}

impl ClientEvent {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl ServerEvent {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_roundtrip() {
        let event = ClientEvent::SendMessage {
            channel_id: ChannelId::new(),
            content: "shipment 4412 confirmed".to_string(),
            correlation_id: CorrelationId::new(),
        };

        let bytes = event.to_bytes().unwrap();
        let restored = ClientEvent::from_bytes(&bytes).unwrap();
        assert_eq!(event, restored);
    }

    #[test]
    fn test_server_event_roundtrip() {
        let message = Message {
            id: MessageId::new(),
            channel_id: ChannelId::new(),
            sender: UserId::new(),
            content: "hello".to_string(),
            timestamp: Utc::now(),
            sequence: 7,
            correlation_id: Some(CorrelationId::new()),
        };

        let event = ServerEvent::Ack {
            correlation_id: message.correlation_id.unwrap(),
            message: message.clone(),
        };

        let bytes = event.to_bytes().unwrap();
        let restored = ServerEvent::from_bytes(&bytes).unwrap();

        if let ServerEvent::Ack { message: rest, .. } = restored {
            assert_eq!(rest, message);
        } else {
            panic!("Event type mismatch");
        }
    }

    #[test]
    fn test_garbage_frame_is_rejected() {
        assert!(ClientEvent::from_bytes(&[0xff; 3]).is_err());
    }
}
