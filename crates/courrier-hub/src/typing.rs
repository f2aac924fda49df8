//! Transient typing state.
//!
//! One entry per (channel, identity) pair, overwritten on every refresh and
//! never persisted. Entries expire after [`TYPING_TTL_SECS`] so a crashed
//! client's indicator cannot stick; the sweep returns expired pairs for the
//! implicit stop broadcast.

use std::time::{Duration, Instant};

use courrier_shared::constants::{TABLE_SHARDS, TYPING_TTL_SECS};
use courrier_shared::types::{ChannelId, UserId};

use crate::shards::ShardedMap;

pub struct TypingManager {
    deadlines: ShardedMap<(ChannelId, UserId), Instant>,
    ttl: Duration,
}

impl TypingManager {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(TYPING_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            deadlines: ShardedMap::new(TABLE_SHARDS),
            ttl,
        }
    }

    /// Set or refresh the typing state for a pair. Returns `true` only on
    /// the not-typing to typing transition; refreshes before expiry extend
    /// the deadline without another broadcast.
    pub async fn start(&self, channel_id: ChannelId, identity: UserId) -> bool {
        let deadline = Instant::now() + self.ttl;
        self.deadlines
            .with_entry(&(channel_id, identity), |slot| {
                let was_typing = matches!(slot, Some(existing) if *existing > Instant::now());
                *slot = Some(deadline);
                !was_typing
            })
            .await
    }

    /// Remove the typing state immediately. Returns `true` if the pair was
    /// typing, i.e. a stop broadcast is due.
    pub async fn stop(&self, channel_id: ChannelId, identity: UserId) -> bool {
        self.deadlines.remove(&(channel_id, identity)).await.is_some()
    }

    /// Remove every expired entry and return the affected pairs so the
    /// caller can broadcast the implicit stop.
    pub async fn sweep(&self) -> Vec<(ChannelId, UserId)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.deadlines
            .for_each(|pair, deadline| {
                if *deadline <= now {
                    expired.push(*pair);
                }
            })
            .await;

        let mut swept = Vec::new();
        for pair in expired {
            // Re-check under the entry lock: the client may have refreshed
            // between the scan and now.
            let still_expired = self
                .deadlines
                .with_entry(&pair, |slot| match slot {
                    Some(deadline) if *deadline <= now => {
                        *slot = None;
                        true
                    }
                    _ => false,
                })
                .await;
            if still_expired {
                swept.push(pair);
            }
        }
        swept
    }
}

impl Default for TypingManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_is_idempotent_before_expiry() {
        let typing = TypingManager::new();
        let channel = ChannelId::new();
        let identity = UserId::new();

        assert!(typing.start(channel, identity).await);
        assert!(!typing.start(channel, identity).await);
        assert!(!typing.start(channel, identity).await);
    }

    #[tokio::test]
    async fn test_stop_reports_whether_pair_was_typing() {
        let typing = TypingManager::new();
        let channel = ChannelId::new();
        let identity = UserId::new();

        assert!(!typing.stop(channel, identity).await);

        typing.start(channel, identity).await;
        assert!(typing.stop(channel, identity).await);
        assert!(!typing.stop(channel, identity).await);
    }

    #[tokio::test]
    async fn test_sweep_collects_expired_pairs() {
        let typing = TypingManager::with_ttl(Duration::from_millis(10));
        let channel = ChannelId::new();
        let identity = UserId::new();

        typing.start(channel, identity).await;
        assert!(typing.sweep().await.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(typing.sweep().await, vec![(channel, identity)]);

        // Swept pairs are gone; the next sweep finds nothing.
        assert!(typing.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_after_expiry_is_a_new_transition() {
        let typing = TypingManager::with_ttl(Duration::from_millis(10));
        let channel = ChannelId::new();
        let identity = UserId::new();

        assert!(typing.start(channel, identity).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(typing.start(channel, identity).await);
    }
}
