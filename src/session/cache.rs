//! In-memory validation cache with TTL eviction.
//!
//! Maps a session token to the last validation verdict so repeated checks
//! within the TTL window skip the remote lookup. Purely process-lifetime:
//! re-created empty on every invocation.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Cached validation verdict for one token.
#[derive(Clone, Debug)]
struct CacheEntry {
    valid: bool,
    cached_at: DateTime<Utc>,
}

/// TTL cache of token validation results.
///
/// Owned by a [`SessionValidator`](super::SessionValidator) instance, not
/// module-level state, so tests can construct isolated instances.
#[derive(Clone)]
pub struct ValidationCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl ValidationCache {
    /// Create a cache whose entries expire `ttl_seconds` after being written.
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Look up a cached verdict.
    ///
    /// Expired entries are purged lazily here, on lookup.
    pub fn get(&self, token: &str) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Utc::now();
        entries.retain(|_, entry| now - entry.cached_at <= self.ttl);
        entries.get(token).map(|entry| entry.valid)
    }

    /// Record a validation verdict, TTL measured from now.
    pub fn insert(&self, token: &str, valid: bool) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            token.to_string(),
            CacheEntry {
                valid,
                cached_at: Utc::now(),
            },
        );
    }

    /// Drop all cached entries.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Number of live entries (for logging/tests).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
