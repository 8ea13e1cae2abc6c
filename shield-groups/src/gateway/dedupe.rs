use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// (author key, BLAKE3 of wire bytes)
type CacheKey = ([u8; 32], [u8; 32]);

/// Recently processed inbound payloads. Only payloads that were fully
/// handled are remembered, so a held or failed payload is retried on the
/// next delivery.
pub struct DedupeCache {
    seen: Mutex<LruCache<CacheKey, ()>>,
}

impl DedupeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        DedupeCache {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn key(author: &[u8; 32], wire_bytes: &[u8]) -> CacheKey {
        (*author, *blake3::hash(wire_bytes).as_bytes())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        match self.seen.lock() {
            Ok(mut cache) => cache.get(key).is_some(),
            Err(_) => false,
        }
    }

    pub fn remember(&self, key: CacheKey) {
        if let Ok(mut cache) = self.seen.lock() {
            cache.put(key, ());
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remember_and_evict() {
        let cache = DedupeCache::new(2);
        let a = DedupeCache::key(&[1u8; 32], b"a");
        let b = DedupeCache::key(&[1u8; 32], b"b");
        let c = DedupeCache::key(&[2u8; 32], b"a");

        assert!(!cache.contains(&a));
        cache.remember(a);
        assert!(cache.contains(&a));
        cache.remember(b);
        cache.remember(c);
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&c));
    }
}
