//! Shared cache (C8)
//! Mission: opaque key/value store with TTL and namespace-prefix invalidation,
//! shared across workers. Readers MUST tolerate stale cache by re-reading the
//! DB on miss (§5) — this cache never blocks a caller on a stampede, it just
//! returns `None`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
}

use serde::Serialize;

/// In-memory TTL cache with namespace (prefix) scan-delete.
///
/// A single global namespace prefix is used for invalidation (§5: "pick one
/// strategy"); this crate resolves the cache-invalidation-layer Open
/// Question (spec.md §9) to service-layer-only — callers in
/// `episodes`/`risk` invalidate directly, there is no separate route-level
/// cache layer.
pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
    stats: Mutex<CacheStats>,
}

impl Cache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let mut stats = self.stats.lock();
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => {
                stats.hits += 1;
                Some(e.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                stats.misses += 1;
                None
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    pub fn get_json<T: for<'de> serde::Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|s| serde_json::from_str(&s).ok())
    }

    pub fn set(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.stats.lock().sets += 1;
    }

    pub fn set_json<T: serde::Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Ok(s) = serde_json::to_string(value) {
            self.set(key, s, ttl);
        }
    }

    /// Best-effort atomic scan-delete of every key whose name starts with
    /// `prefix` (the `episode:{id}*` / `count:episode*` patterns from §4.7).
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            self.stats.lock().invalidations += removed as u64;
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
        self.stats.lock().invalidations += 1;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_hits() {
        let cache = Cache::new();
        cache.set("k", "v", Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = Cache::new();
        cache.set("k", "v", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn prefix_invalidation_only_removes_matching_keys() {
        let cache = Cache::new();
        cache.set("episode:1:status", "x", Duration::from_secs(60));
        cache.set("episode:2:status", "x", Duration::from_secs(60));
        cache.set("count:episode:open", "1", Duration::from_secs(60));
        cache.set("payer:abc:denial_rate", "0.1", Duration::from_secs(60));

        cache.invalidate_prefix("episode:");
        cache.invalidate_prefix("count:episode");

        assert_eq!(cache.get("episode:1:status"), None);
        assert_eq!(cache.get("episode:2:status"), None);
        assert_eq!(cache.get("count:episode:open"), None);
        assert_eq!(cache.get("payer:abc:denial_rate"), Some("0.1".to_string()));
    }
}
