//! Page cache: in-memory page store wrapper with LRU eviction.
//!
//! The cache keeps recently used pages resident and batches updates as dirty
//! pages. It uses an LRU (Least Recently Used) eviction policy.

mod cache;
mod lru;

pub use cache::{CacheOptions, CachingPageStore, DEFAULT_MAX_CACHED_PAGES, DEFAULT_MAX_DIRTY_PAGES};
