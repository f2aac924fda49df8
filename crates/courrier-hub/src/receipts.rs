//! Read receipt aggregation.
//!
//! Markers advance monotonically per (channel, identity) on the sequence
//! the message store assigned; a marker pointing at an older position is
//! ignored. Rapid updates from the same pair coalesce: the first accepted
//! update schedules a flush, later updates inside the window only overwrite
//! the stored value, and the flush broadcasts whatever is latest.

use chrono::{DateTime, Utc};

use courrier_shared::constants::TABLE_SHARDS;
use courrier_shared::types::{ChannelId, MessageId, UserId};

use crate::shards::ShardedMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMarker {
    pub message_id: MessageId,
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// Older than the stored marker; no state change, no broadcast.
    Stale,
    /// Accepted, and the caller must schedule a flush for this pair.
    Scheduled,
    /// Accepted while a flush was already pending; the pending flush will
    /// pick this value up.
    Coalesced,
}

#[derive(Debug, Clone)]
struct PairState {
    marker: ReadMarker,
    flush_pending: bool,
}

pub struct ReadAggregator {
    pairs: ShardedMap<(ChannelId, UserId), PairState>,
}

impl ReadAggregator {
    pub fn new() -> Self {
        Self {
            pairs: ShardedMap::new(TABLE_SHARDS),
        }
    }

    /// Apply a marker update under the monotonic rule.
    pub async fn apply(
        &self,
        channel_id: ChannelId,
        identity: UserId,
        message_id: MessageId,
        sequence: u64,
    ) -> MarkOutcome {
        self.pairs
            .with_entry(&(channel_id, identity), |slot| match slot {
                Some(state) if state.marker.sequence >= sequence => MarkOutcome::Stale,
                Some(state) => {
                    state.marker = ReadMarker {
                        message_id,
                        sequence,
                        updated_at: Utc::now(),
                    };
                    if state.flush_pending {
                        MarkOutcome::Coalesced
                    } else {
                        state.flush_pending = true;
                        MarkOutcome::Scheduled
                    }
                }
                None => {
                    *slot = Some(PairState {
                        marker: ReadMarker {
                            message_id,
                            sequence,
                            updated_at: Utc::now(),
                        },
                        flush_pending: true,
                    });
                    MarkOutcome::Scheduled
                }
            })
            .await
    }

    /// Close the coalescing window for a pair: clear the pending flag and
    /// return the latest marker for broadcast.
    pub async fn take_flush(&self, channel_id: ChannelId, identity: UserId) -> Option<ReadMarker> {
        self.pairs
            .with_entry(&(channel_id, identity), |slot| {
                slot.as_mut().map(|state| {
                    state.flush_pending = false;
                    state.marker.clone()
                })
            })
            .await
    }

    pub async fn marker_for(&self, channel_id: ChannelId, identity: UserId) -> Option<ReadMarker> {
        self.pairs
            .get_cloned(&(channel_id, identity))
            .await
            .map(|state| state.marker)
    }
}

impl Default for ReadAggregator {
    fn default() -> Self {
        Self::new()
    }
}
