//! Key-sharded lock tables.
//!
//! The presence roster and the subscription membership tables are shared
//! across every connection. Serializing them behind one lock would bound
//! the hub to one event at a time, so both live in fixed-count shard maps:
//! a key hashes to one shard, and only that shard's lock is taken.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tokio::sync::RwLock;

/// A `HashMap` split across a fixed number of `RwLock`-guarded shards.
pub struct ShardedMap<K, V> {
    shards: Vec<RwLock<HashMap<K, V>>>,
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard_for(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    pub async fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).write().await.insert(key, value)
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.shard_for(key).write().await.remove(key)
    }

    pub async fn contains_key(&self, key: &K) -> bool {
        self.shard_for(key).read().await.contains_key(key)
    }

    /// Atomic read-modify-write of one entry under its shard lock.
    ///
    /// The closure receives the slot for `key`; leaving it `None` removes
    /// the entry, any other value is stored back.
    pub async fn with_entry<R>(&self, key: &K, f: impl FnOnce(&mut Option<V>) -> R) -> R {
        let mut shard = self.shard_for(key).write().await;
        let mut slot = shard.remove(key);
        let result = f(&mut slot);
        if let Some(value) = slot {
            shard.insert(key.clone(), value);
        }
        result
    }

    /// Visit every entry. Shards are visited one at a time under a read
    /// lock; the view is consistent per shard, not across shards.
    pub async fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for shard in &self.shards {
            let guard = shard.read().await;
            for (key, value) in guard.iter() {
                f(key, value);
            }
        }
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub async fn get_cloned(&self, key: &K) -> Option<V> {
        self.shard_for(key).read().await.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let map: ShardedMap<u32, String> = ShardedMap::new(4);

        assert!(map.insert(1, "one".to_string()).await.is_none());
        assert_eq!(map.get_cloned(&1).await.as_deref(), Some("one"));

        assert_eq!(map.remove(&1).await.as_deref(), Some("one"));
        assert!(map.get_cloned(&1).await.is_none());
    }

    #[tokio::test]
    async fn test_with_entry_inserts_and_removes() {
        let map: ShardedMap<u32, u64> = ShardedMap::new(4);

        let count = map
            .with_entry(&7, |slot| {
                let next = slot.unwrap_or(0) + 1;
                *slot = Some(next);
                next
            })
            .await;
        assert_eq!(count, 1);

        let count = map
            .with_entry(&7, |slot| {
                let next = slot.unwrap_or(0) - 1;
                *slot = if next == 0 { None } else { Some(next) };
                next
            })
            .await;
        assert_eq!(count, 0);
        assert!(!map.contains_key(&7).await);
    }

    #[tokio::test]
    async fn test_concurrent_entry_updates_are_atomic() {
        use std::sync::Arc;

        let map: Arc<ShardedMap<u8, u64>> = Arc::new(ShardedMap::new(4));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let map = map.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    map.with_entry(&0, |slot| {
                        *slot = Some(slot.unwrap_or(0) + 1);
                    })
                    .await;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(map.get_cloned(&0).await, Some(1600));
    }
}
