// Shared types and wire protocol for the Courrier real-time core.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ClientError, HubError};
pub use protocol::{ClientEvent, Message, ServerEvent};
pub use types::{ChannelId, ChannelKind, ConnectionId, CorrelationId, MessageId, UserId};
