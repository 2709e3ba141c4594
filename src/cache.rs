use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded cache whose entries also expire after a fixed TTL.
///
/// Lookups past the deadline behave as misses, so stale values are never
/// served even while they still occupy a slot.
pub struct TtlCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(cap: NonZeroUsize, ttl: Duration) -> Self {
        TtlCache {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().await;
        let expired = match cache.get(key) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    pub async fn put(&self, key: K, value: V) {
        let mut cache = self.inner.lock().await;
        cache.put(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let cache = TtlCache::new(NonZeroUsize::new(4).unwrap(), Duration::from_secs(60));
        cache.put("a".to_string(), 1u32).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = TtlCache::new(NonZeroUsize::new(4).unwrap(), Duration::from_millis(0));
        cache.put("a".to_string(), 1u32).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let cache = TtlCache::new(NonZeroUsize::new(2).unwrap(), Duration::from_secs(60));
        cache.put(1u8, "one").await;
        cache.put(2u8, "two").await;
        cache.put(3u8, "three").await;
        assert_eq!(cache.get(&1).await, None);
        assert_eq!(cache.get(&2).await, Some("two"));
        assert_eq!(cache.get(&3).await, Some("three"));
    }
}
