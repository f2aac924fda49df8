use thiserror::Error;

use crate::types::{ChannelId, ConnectionId, UserId};

/// Errors raised by the server-side coordination core.
#[derive(Error, Debug)]
pub enum HubError {
    /// Subscribe or send on a channel the identity is not authorized for.
    /// Surfaced to the origin only; the connection stays open.
    #[error("Identity {identity} is not a member of channel {channel_id}")]
    NotAMember {
        identity: UserId,
        channel_id: ChannelId,
    },

    /// The message store failed during a submit. Surfaced as a nack to the
    /// origin; no broadcast occurs.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Message body over the wire limit. Rejected before the store is
    /// consulted.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Operation referenced a connection the registry no longer holds.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Errors raised by the client transport connection.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The server refused the identity at connect time. Fatal to the
    /// connection; no reconnect is attempted.
    #[error("Authentication rejected")]
    AuthRejected,

    /// Network-level disconnect. Drives the reconnect state machine, not a
    /// terminal error.
    #[error("Transport dropped: {0}")]
    TransportDrop(String),

    /// The handle was closed, or the reconnect policy was exhausted.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Wire encoding error: {0}")]
    Encoding(String),
}

impl From<bincode::Error> for ClientError {
    fn from(e: bincode::Error) -> Self {
        ClientError::Encoding(e.to_string())
    }
}
