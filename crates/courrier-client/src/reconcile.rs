//! Optimistic message reconciliation.
//!
//! A composed message renders immediately as an optimistic copy and sits
//! in the outbox keyed by its correlation id. The server's ack replaces it
//! with the confirmed message; a nack marks it failed but keeps the entry,
//! so a retry reuses the same correlation id and can never produce a
//! duplicate send. Outbox state belongs to one connection and needs no
//! locking.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use courrier_shared::protocol::{ClientEvent, Message, ServerEvent};
use courrier_shared::types::{ChannelId, CorrelationId};

/// A locally-rendered message awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticMessage {
    pub correlation_id: CorrelationId,
    pub channel_id: ChannelId,
    pub content: String,
    pub composed_at: DateTime<Utc>,
    pub failed_reason: Option<String>,
}

/// What an observed server event meant for the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The optimistic copy under this correlation id is confirmed; the UI
    /// swaps it for the real message without a duplicate render.
    Confirmed {
        correlation_id: CorrelationId,
        message: Message,
    },
    /// The submit failed; the optimistic copy stays visible, marked failed,
    /// until the user retries or discards it.
    Failed {
        correlation_id: CorrelationId,
        reason: String,
    },
}

#[derive(Default)]
pub struct Reconciler {
    outbox: HashMap<CorrelationId, OptimisticMessage>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an optimistic copy and return the wire event to send.
    pub fn compose(&mut self, channel_id: ChannelId, content: String) -> ClientEvent {
        let correlation_id = CorrelationId::new();
        self.outbox.insert(
            correlation_id,
            OptimisticMessage {
                correlation_id,
                channel_id,
                content: content.clone(),
                composed_at: Utc::now(),
                failed_reason: None,
            },
        );

        ClientEvent::SendMessage {
            channel_id,
            content,
            correlation_id,
        }
    }

    /// Feed a server event through the outbox. Acks and nacks for unknown
    /// correlation ids (e.g. after a restart) reconcile nothing.
    pub fn observe(&mut self, event: &ServerEvent) -> Option<Reconciliation> {
        match event {
            ServerEvent::Ack {
                correlation_id,
                message,
            } => self.outbox.remove(correlation_id).map(|_| {
                Reconciliation::Confirmed {
                    correlation_id: *correlation_id,
                    message: message.clone(),
                }
            }),
            ServerEvent::Nack {
                correlation_id,
                reason,
            } => {
                let entry = self.outbox.get_mut(correlation_id)?;
                entry.failed_reason = Some(reason.clone());
                Some(Reconciliation::Failed {
                    correlation_id: *correlation_id,
                    reason: reason.clone(),
                })
            }
            _ => None,
        }
    }

    /// Re-arm a failed copy for sending. Returns the wire event carrying
    /// the original correlation id, or `None` if the copy is unknown or
    /// still pending.
    pub fn retry(&mut self, correlation_id: CorrelationId) -> Option<ClientEvent> {
        let entry = self.outbox.get_mut(&correlation_id)?;
        entry.failed_reason.take()?;

        Some(ClientEvent::SendMessage {
            channel_id: entry.channel_id,
            content: entry.content.clone(),
            correlation_id,
        })
    }

    /// Drop a failed copy the user chose not to retry.
    pub fn discard(&mut self, correlation_id: CorrelationId) -> Option<OptimisticMessage> {
        self.outbox.remove(&correlation_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &OptimisticMessage> {
        self.outbox.values()
    }
}
