//! # Tiered Cache
//!
//! Two-level cache in front of the expensive lookups (ingredient database
//! calls, model enrichment). Reads check the process-local tier first and
//! fall through to Redis; a Redis hit repopulates the local tier on the way
//! back. Writes pick their tiers per call, and the two writes are
//! independent, there is no cross-tier transaction.
//!
//! The local copy and the Redis copy of one logical entry can briefly
//! diverge; both carry their own creation timestamp and TTL, and expiry is
//! enforced on read against whichever copy answered.
//!
//! Every Redis failure here degrades the call to local-only behavior and is
//! logged. Callers never see a cache error.
//!
//! Two behaviors are deliberate and pinned by tests rather than fixed:
//! `get_or_compute` does not serialize concurrent callers on a cold key
//! (both run the factory), and `invalidate_by_pattern` only clears the
//! Redis tier, so local copies serve until their own TTL runs out.

use std::future::Future;

use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::local::LocalStore;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::utils::now_ms;

/// Which tiers a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    Local,
    Remote,
    Both,
}

impl CacheLevel {
    fn includes_local(self) -> bool {
        matches!(self, CacheLevel::Local | CacheLevel::Both)
    }

    fn includes_remote(self) -> bool {
        matches!(self, CacheLevel::Remote | CacheLevel::Both)
    }
}

/// Stored form of one entry, identical in both tiers.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    created_at_ms: u64,
    ttl_secs: u64,
    value: T,
}

pub struct TieredCache {
    local: LocalStore,
    remote: Option<ConnectionManager>,
    local_enabled: bool,
    remote_enabled: bool,
    default_ttl_secs: u64,
    stats: CacheStats,
}

impl TieredCache {
    pub fn new(config: &Config, remote: Option<ConnectionManager>) -> Self {
        Self {
            local: LocalStore::new(config.local_max_entries),
            remote,
            local_enabled: config.local_tier_enabled,
            remote_enabled: config.remote_tier_enabled,
            default_ttl_secs: config.default_ttl_secs,
            stats: CacheStats::default(),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_at(key, now_ms()).await
    }

    /// `ttl_secs` of `None` means the configured default.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
        level: CacheLevel,
    ) {
        self.set_at(key, value, ttl_secs, level, now_ms()).await;
    }

    /// Removes the entry from both tiers. Absence in either is fine.
    pub async fn delete(&self, key: &str) {
        self.local.remove(key);

        if !self.remote_enabled {
            return;
        }
        if let Some(conn) = &self.remote {
            let mut conn = conn.clone();
            let deleted: redis::RedisResult<u64> = conn.del(key).await;
            if let Err(e) = deleted {
                warn!("Shared store delete failed for {key}: {e}");
                self.stats.remote_error();
            }
        }
    }

    /// Cached value, or run `factory`, store its output, and return it.
    ///
    /// Concurrent callers racing on the same cold key all run the factory;
    /// the last write wins. Factory errors pass through untouched and leave
    /// the cache unchanged.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl_secs: Option<u64>,
        level: CacheLevel,
        factory: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = factory().await?;
        self.set(key, &value, ttl_secs, level).await;
        Ok(value)
    }

    /// Deletes every Redis key matching `pattern` (glob syntax) and returns
    /// how many went away. The local tier is left alone; its matching
    /// entries serve until their TTL expires.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> u64 {
        if !self.remote_enabled {
            return 0;
        }
        let Some(conn) = &self.remote else {
            return 0;
        };
        let mut conn = conn.clone();

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let reply: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;

            match reply {
                Ok((next_cursor, batch)) => {
                    keys.extend(batch);
                    cursor = next_cursor;
                    if cursor == 0 {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Shared store scan failed for {pattern}: {e}");
                    self.stats.remote_error();
                    return 0;
                }
            }
        }

        if keys.is_empty() {
            return 0;
        }

        match conn.del::<_, u64>(keys).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Shared store delete failed for {pattern}: {e}");
                self.stats.remote_error();
                0
            }
        }
    }

    pub fn stats_snapshot(&self) -> CacheStatsSnapshot {
        self.stats.snapshot(self.local.len(), self.local.capacity())
    }

    async fn get_at<T: DeserializeOwned>(&self, key: &str, now_ms: u64) -> Option<T> {
        if self.local_enabled {
            if let Some(bytes) = self.local.get(key, now_ms) {
                match serde_json::from_slice::<Envelope<T>>(&bytes) {
                    Ok(envelope) => {
                        self.stats.local_hit();
                        return Some(envelope.value);
                    }
                    Err(e) => {
                        warn!("Dropping undecodable local entry {key}: {e}");
                        self.local.remove(key);
                    }
                }
            }
            self.stats.local_miss();
        }

        if !self.remote_enabled {
            return None;
        }
        let Some(conn) = &self.remote else {
            return None;
        };
        let mut conn = conn.clone();

        let bytes: Option<Vec<u8>> = match conn.get(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Shared store read failed for {key}: {e}");
                self.stats.remote_error();
                return None;
            }
        };
        let Some(bytes) = bytes else {
            self.stats.remote_miss();
            return None;
        };

        let envelope: Envelope<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A payload we cannot decode is as good as absent; purge it
                // so the next writer starts clean.
                warn!("Purging corrupt shared entry {key}: {e}");
                let purged: redis::RedisResult<u64> = conn.del(key).await;
                if purged.is_err() {
                    self.stats.remote_error();
                }
                self.stats.remote_miss();
                return None;
            }
        };

        let expires_at_ms = envelope
            .created_at_ms
            .saturating_add(envelope.ttl_secs.saturating_mul(1000));
        if now_ms > expires_at_ms {
            self.stats.remote_miss();
            return None;
        }

        if self.local_enabled {
            self.local.insert(key, bytes, expires_at_ms);
        }
        self.stats.remote_hit();
        Some(envelope.value)
    }

    async fn set_at<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
        level: CacheLevel,
        now_ms: u64,
    ) {
        let ttl_secs = ttl_secs.unwrap_or(self.default_ttl_secs);
        let envelope = Envelope {
            created_at_ms: now_ms,
            ttl_secs,
            value,
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not encode value for {key}: {e}");
                return;
            }
        };

        if self.local_enabled && level.includes_local() {
            self.local
                .insert(key, bytes.clone(), now_ms.saturating_add(ttl_secs.saturating_mul(1000)));
        }

        if self.remote_enabled && level.includes_remote() {
            if let Some(conn) = &self.remote {
                let mut conn = conn.clone();
                let written: redis::RedisResult<()> = conn.set_ex(key, bytes, ttl_secs).await;
                if let Err(e) = written {
                    warn!("Shared store write failed for {key}: {e}");
                    self.stats.remote_error();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::{CacheLevel, TieredCache};
    use crate::config::Config;

    fn local_only_cache() -> TieredCache {
        TieredCache::new(&Config::for_tests(), None)
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let cache = local_only_cache();
        let t0 = 1_000_000;

        cache
            .set_at("ingredient:123", &json!({"score": 80}), Some(5), CacheLevel::Both, t0)
            .await;

        let value: Option<Value> = cache.get_at("ingredient:123", t0 + 1_000).await;
        assert_eq!(value, Some(json!({"score": 80})));
    }

    #[tokio::test]
    async fn test_get_misses_after_ttl() {
        let cache = local_only_cache();
        let t0 = 1_000_000;

        cache
            .set_at("ingredient:123", &json!({"score": 80}), Some(5), CacheLevel::Both, t0)
            .await;

        let value: Option<Value> = cache.get_at("ingredient:123", t0 + 6_000).await;
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_set_survives_missing_backend() {
        // Both tiers requested, no reachable backend: the local write still
        // serves reads.
        let cache = local_only_cache();

        cache.set("k", &json!(1), None, CacheLevel::Both).await;
        assert_eq!(cache.get::<Value>("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_remote_only_write_skips_local() {
        let cache = local_only_cache();

        cache.set("k", &json!(1), None, CacheLevel::Remote).await;
        assert_eq!(cache.get::<Value>("k").await, None);
    }

    #[tokio::test]
    async fn test_delete_tolerates_absence() {
        let cache = local_only_cache();

        cache.delete("never-set").await;

        cache.set("k", &json!(1), None, CacheLevel::Local).await;
        cache.delete("k").await;
        assert_eq!(cache.get::<Value>("k").await, None);
    }

    #[tokio::test]
    async fn test_get_or_compute_caches_the_first_result() {
        let cache = local_only_cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Result<Value, ()> = cache
                .get_or_compute("k", None, CacheLevel::Local, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(42))
                })
                .await;
            assert_eq!(value, Ok(json!(42)));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_factory_error_passes_through() {
        let cache = local_only_cache();

        let result: Result<Value, &str> = cache
            .get_or_compute("k", None, CacheLevel::Local, || async { Err("upstream down") })
            .await;
        assert_eq!(result, Err("upstream down"));

        // Nothing was cached.
        assert_eq!(cache.get::<Value>("k").await, None);
    }

    #[tokio::test]
    async fn test_cold_key_races_both_compute() {
        // Documented tradeoff: no single-flight, so two callers racing on
        // the same cold key both pay for the computation.
        let cache = local_only_cache();
        let calls = AtomicUsize::new(0);

        let factory = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ()>(json!("computed"))
        };

        let (a, b) = tokio::join!(
            cache.get_or_compute("cold", None, CacheLevel::Local, factory),
            cache.get_or_compute("cold", None, CacheLevel::Local, factory),
        );

        assert_eq!(a, Ok(json!("computed")));
        assert_eq!(b, Ok(json!("computed")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_undecodable_local_entry_is_dropped() {
        let cache = local_only_cache();
        cache.local.insert("bad", b"not json".to_vec(), u64::MAX);

        assert_eq!(cache.get::<Value>("bad").await, None);
        assert_eq!(cache.local.get("bad", 0), None);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_without_backend() {
        let cache = local_only_cache();
        assert_eq!(cache.invalidate_by_pattern("ratelimit:user:42:*").await, 0);
    }

    #[tokio::test]
    async fn test_pattern_invalidation_leaves_local_entries() {
        // Documented limitation: only the shared tier is cleared; local
        // copies serve until their own TTL expires.
        let cache = local_only_cache();

        cache.set("ingredient:abc", &json!(1), None, CacheLevel::Local).await;
        cache.invalidate_by_pattern("ingredient:*").await;

        assert_eq!(cache.get::<Value>("ingredient:abc").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let cache = local_only_cache();

        cache.set("k", &json!(1), None, CacheLevel::Local).await;
        let _: Option<Value> = cache.get("k").await;
        let _: Option<Value> = cache.get("missing").await;

        let snap = cache.stats_snapshot();
        assert_eq!(snap.local_hits, 1);
        assert_eq!(snap.local_misses, 1);
        assert_eq!(snap.local_entries, 1);
    }
}
