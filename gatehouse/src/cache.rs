//! In-process response cache for GET endpoints
//!
//! Entries are keyed by a blake3 fingerprint of
//! `(scope, slug, method, path+query, body hash)` so tenants never see
//! each other's cached responses and different request bodies never
//! collide. Expired entries are removed on read; when the cache is full,
//! the least-recently-inserted entry is evicted. Concurrent fills for the
//! same key are permitted (last write wins).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

/// Opaque cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

/// Fingerprint a request for cache lookup
pub fn cache_key(
    scope_id: &str,
    slug: &str,
    method: &str,
    path_and_query: &str,
    body: &[u8],
) -> CacheKey {
    let body_hash = blake3::hash(body);
    let mut hasher = blake3::Hasher::new();
    for part in [scope_id, slug, method, path_and_query] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.update(body_hash.as_bytes());
    CacheKey(hasher.finalize().to_hex().to_string())
}

/// A cached consumer response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

struct Entry {
    response: CachedResponse,
    expires_at: Instant,
    inserted_seq: u64,
}

/// Bounded TTL cache for buffered GET responses
pub struct ResponseCache {
    entries: DashMap<String, Entry>,
    max_entries: usize,
    seq: AtomicU64,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Look up a live entry; expired entries are removed on the way out
    pub fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        if let Some(entry) = self.entries.get(&key.0) {
            if entry.expires_at > Instant::now() {
                return Some(entry.response.clone());
            }
            drop(entry);
            self.entries.remove(&key.0);
        }
        None
    }

    /// Insert a response with the endpoint's TTL
    ///
    /// Under memory pressure the oldest-inserted entry is evicted first.
    pub fn insert(&self, key: CacheKey, response: CachedResponse, ttl: Duration) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key.0) {
            self.evict_oldest();
        }
        self.entries.insert(
            key.0,
            Entry {
                response,
                expires_at: Instant::now() + ttl,
                inserted_seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_seq)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
