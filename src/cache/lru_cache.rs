use std::num::NonZeroUsize;

use crate::error::RelayError;

/// Least-recently-used map from cache identifiers to values.
///
/// `get` and `set` promote a key to most-recently-used; `has` and `peek` do
/// not. Inserting a new key into a full cache evicts the least-recently-used
/// entry and hands it back to the caller.
#[derive(Debug)]
pub struct LruCache<V> {
    entries: ::lru::LruCache<String, V>,
}

impl<V> LruCache<V> {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, RelayError> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            RelayError::invariant("LruCache: capacity must be greater than zero")
        })?;
        Ok(Self {
            entries: ::lru::LruCache::new(capacity),
        })
    }

    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn peek(&self, key: &str) -> Option<&V> {
        self.entries.peek(key)
    }

    /// Inserts or replaces `key` and returns the evicted entry, if any.
    ///
    /// Replacing an existing key never evicts.
    pub fn set(&mut self, key: String, value: V) -> Option<(String, V)> {
        if let Some(slot) = self.entries.get_mut(key.as_str()) {
            *slot = value;
            return None;
        }
        self.entries.push(key, value)
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<V> {
        self.entries.pop(key)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Remaining room before the next insertion evicts.
    pub fn capacity(&self) -> usize {
        self.entries.cap().get() - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        let err = LruCache::<u32>::new(0).expect_err("zero capacity must fail");
        assert!(matches!(err, RelayError::Invariant { .. }));
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(3).expect("capacity is valid");
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        cache.set("c".to_string(), 3);
        assert_eq!(cache.capacity(), 0);

        let evicted = cache.set("d".to_string(), 4);

        assert_eq!(evicted, Some(("a".to_string(), 1)));
        assert!(!cache.has("a"));
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn get_promotes_entry() {
        let mut cache = LruCache::new(2).expect("capacity is valid");
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        assert_eq!(cache.get("a"), Some(&1));
        let evicted = cache.set("c".to_string(), 3);

        assert_eq!(evicted.map(|(key, _)| key), Some("b".to_string()));
        assert!(cache.has("a"));
        assert!(cache.has("c"));
    }

    #[test]
    fn has_and_peek_do_not_promote() {
        let mut cache = LruCache::new(2).expect("capacity is valid");
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        assert!(cache.has("a"));
        assert_eq!(cache.peek("a"), Some(&1));
        cache.set("c".to_string(), 3);

        assert!(!cache.has("a"));
    }

    #[test]
    fn replacing_key_updates_value_without_eviction() {
        let mut cache = LruCache::new(2).expect("capacity is valid");
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        assert!(cache.set("a".to_string(), 10).is_none());
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.peek("a"), Some(&10));

        // "a" is now most recently used.
        let evicted = cache.set("c".to_string(), 3);
        assert_eq!(evicted.map(|(key, _)| key), Some("b".to_string()));
    }

    #[test]
    fn delete_and_clear_free_capacity() {
        let mut cache = LruCache::new(4).expect("capacity is valid");
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);

        assert_eq!(cache.delete("a"), Some(1));
        assert_eq!(cache.delete("a"), None);
        assert_eq!(cache.capacity(), 3);

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.capacity(), 4);
    }
}
