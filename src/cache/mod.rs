//! Capacity-bounded caches shared by the resource layer.
//!
//! Eviction is silent: evicted values are returned to the caller of
//! [`LruCache::set`] and never disposed by the cache itself.

pub(crate) mod lock;
mod lru_cache;

pub use lru_cache::LruCache;
