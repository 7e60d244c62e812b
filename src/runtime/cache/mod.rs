//! Two-tier cache layer
//!
//! Lookups hit the bounded local LRU tier first and fall through to the
//! optional shared networked tier; shared-tier hits are written back locally.
//! Shared-tier errors degrade to misses so cache unavailability slows the
//! service down instead of breaking it.

pub mod codec;
pub mod key;
pub mod lru;
pub mod shared;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::CacheSettings;
use crate::runtime::error::RuntimeError;
use crate::runtime::monitoring::MetricsCollector;

pub use codec::Codec;
pub use key::KeyBuilder;
pub use lru::LruTier;
pub use shared::{HttpKvStore, SharedStore};

/// Operation counters, exposed alongside the prometheus families
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub local_len: usize,
    pub shared_enabled: bool,
}

pub struct TieredCache {
    local: Mutex<LruTier>,
    shared: Option<Arc<dyn SharedStore>>,
    codec: Codec,
    prefix: String,
    default_ttl: Duration,
    counters: Counters,
    metrics: Arc<MetricsCollector>,
}

impl TieredCache {
    pub fn new(settings: &CacheSettings, metrics: Arc<MetricsCollector>) -> Self {
        Self::with_shared(settings, None, metrics)
    }

    pub fn with_shared(
        settings: &CacheSettings,
        shared: Option<Arc<dyn SharedStore>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            local: Mutex::new(LruTier::new(settings.local_capacity)),
            shared,
            codec: settings.codec,
            prefix: settings.prefix.clone(),
            default_ttl: settings.default_ttl(),
            counters: Counters::default(),
            metrics,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Raw lookup: local tier first, shared tier on miss with local
    /// write-back
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let full_key = self.full_key(key);

        if let Some(value) = self.local.lock().await.get(&full_key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_hits.with_label_values(&["local"]).inc();
            return Some(value);
        }

        if let Some(shared) = &self.shared {
            match shared.get(&full_key).await {
                Ok(Some(value)) => {
                    self.local.lock().await.insert(
                        full_key,
                        value.clone(),
                        Some(self.default_ttl),
                    );
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.metrics.cache_hits.with_label_values(&["shared"]).inc();
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key, error = %e, "shared cache tier get failed, treating as miss");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.cache_errors.inc();
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_misses.inc();
        None
    }

    /// Store a raw payload in both tiers; `ttl` defaults to the configured
    /// entry lifetime
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let full_key = self.full_key(key);
        let ttl = ttl.unwrap_or(self.default_ttl);

        self.local
            .lock()
            .await
            .insert(full_key.clone(), value.clone(), Some(ttl));

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.set(&full_key, &value, ttl).await {
                warn!(key, error = %e, "shared cache tier set failed");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_errors.inc();
            }
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn delete(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        let mut deleted = self.local.lock().await.remove(&full_key);

        if let Some(shared) = &self.shared {
            match shared.delete(&full_key).await {
                Ok(shared_deleted) => deleted = deleted || shared_deleted,
                Err(e) => {
                    warn!(key, error = %e, "shared cache tier delete failed");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.cache_errors.inc();
                }
            }
        }

        if deleted {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        deleted
    }

    pub async fn exists(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        if self.local.lock().await.contains(&full_key) {
            return true;
        }
        if let Some(shared) = &self.shared {
            match shared.exists(&full_key).await {
                Ok(exists) => return exists,
                Err(e) => {
                    warn!(key, error = %e, "shared cache tier exists failed");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.cache_errors.inc();
                }
            }
        }
        false
    }

    /// Remove entries matching `pattern` (`prefix*` or exact; `None` clears
    /// everything under this cache's prefix), returning the count removed
    pub async fn clear(&self, pattern: Option<&str>) -> usize {
        let full_pattern = match pattern {
            Some(p) => self.full_key(p),
            None => format!("{}:*", self.prefix),
        };

        let mut cleared = self.local.lock().await.remove_matching(&full_pattern);

        if let Some(shared) = &self.shared {
            match shared.keys(&full_pattern).await {
                Ok(keys) => {
                    for key in keys {
                        match shared.delete(&key).await {
                            Ok(true) => cleared += 1,
                            Ok(false) => {}
                            Err(e) => {
                                warn!(key, error = %e, "shared cache tier delete failed");
                                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                                self.metrics.cache_errors.inc();
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "shared cache tier key scan failed");
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.cache_errors.inc();
                }
            }
        }

        cleared
    }

    /// Typed lookup through the configured codec. Undecodable entries are
    /// logged and treated as misses.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match self.codec.decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "cached payload failed to decode, treating as miss");
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Typed store through the configured codec
    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        let bytes = self.codec.encode(value)?;
        self.set(key, bytes, ttl).await;
        Ok(())
    }

    /// Return the cached value for `key`, or run `factory`, cache its
    /// result, and return it
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<T, RuntimeError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        if let Some(value) = self.get_as(key).await {
            return Ok(value);
        }

        let value = factory().await?;
        self.set_as(key, &value, ttl).await?;
        Ok(value)
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            local_len: self.local.lock().await.len(),
            shared_enabled: self.shared.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn test_cache(settings: &CacheSettings) -> TieredCache {
        TieredCache::new(settings, Arc::new(MetricsCollector::new().unwrap()))
    }

    fn small_settings() -> CacheSettings {
        CacheSettings {
            local_capacity: 8,
            default_ttl_secs: 60,
            ..CacheSettings::default()
        }
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = test_cache(&small_settings());
        cache.set("k", b"v".to_vec(), None).await;
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_get_after_ttl_is_absent() {
        let cache = test_cache(&small_settings());
        cache
            .set("k", b"v".to_vec(), Some(Duration::from_millis(30)))
            .await;
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k").await, None);

        // Re-set restores the entry
        cache.set("k", b"v2".to_vec(), None).await;
        assert_eq!(cache.get("k").await, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let cache = test_cache(&small_settings());
        cache.set("k", b"v".to_vec(), None).await;
        assert!(cache.exists("k").await);
        assert!(cache.delete("k").await);
        assert!(!cache.exists("k").await);
        assert!(!cache.delete("k").await);
    }

    #[tokio::test]
    async fn test_clear_pattern() {
        let cache = test_cache(&small_settings());
        cache.set("review:1", b"a".to_vec(), None).await;
        cache.set("review:2", b"b".to_vec(), None).await;
        cache.set("other", b"c".to_vec(), None).await;

        assert_eq!(cache.clear(Some("review:*")).await, 2);
        assert!(cache.exists("other").await);
        assert_eq!(cache.clear(None).await, 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_factory_once() {
        let cache = test_cache(&small_settings());

        let first: String = cache
            .get_or_compute("k", None, || async { Ok("computed".to_string()) })
            .await
            .unwrap();
        assert_eq!(first, "computed");

        let second: String = cache
            .get_or_compute("k", None, || async {
                Err(RuntimeError::Internal("factory must not rerun".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second, "computed");
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let cache = test_cache(&small_settings());
        cache.set("k", b"v".to_vec(), None).await;
        cache.get("k").await;
        cache.get("absent").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.sets, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    /// Shared tier double that can be switched into a failing mode
    struct FakeShared {
        entries: StdMutex<HashMap<String, Vec<u8>>>,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FakeShared {
        fn new() -> Self {
            Self {
                entries: StdMutex::new(HashMap::new()),
                failing: std::sync::atomic::AtomicBool::new(false),
            }
        }

        fn fail(&self) {
            self.failing.store(true, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), RuntimeError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(RuntimeError::Cache("shared tier down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SharedStore for FakeShared {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RuntimeError> {
            self.check()?;
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<(), RuntimeError> {
            self.check()?;
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<bool, RuntimeError> {
            self.check()?;
            Ok(self.entries.lock().unwrap().remove(key).is_some())
        }

        async fn exists(&self, key: &str) -> Result<bool, RuntimeError> {
            self.check()?;
            Ok(self.entries.lock().unwrap().contains_key(key))
        }

        async fn keys(&self, pattern: &str) -> Result<Vec<String>, RuntimeError> {
            self.check()?;
            Ok(self
                .entries
                .lock()
                .unwrap()
                .keys()
                .filter(|k| lru::matches_pattern(k, pattern))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn test_shared_hit_writes_back_to_local() {
        let shared = Arc::new(FakeShared::new());
        let settings = small_settings();
        let cache = TieredCache::with_shared(
            &settings,
            Some(shared.clone()),
            Arc::new(MetricsCollector::new().unwrap()),
        );

        // Seed only the shared tier
        shared
            .set("talos:k", b"remote".as_ref(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get("k").await, Some(b"remote".to_vec()));

        // Shared tier goes down; the write-back serves the entry locally
        shared.fail();
        assert_eq!(cache.get("k").await, Some(b"remote".to_vec()));
    }

    #[tokio::test]
    async fn test_shared_errors_degrade_to_miss() {
        let shared = Arc::new(FakeShared::new());
        shared.fail();
        let settings = small_settings();
        let cache = TieredCache::with_shared(
            &settings,
            Some(shared),
            Arc::new(MetricsCollector::new().unwrap()),
        );

        assert_eq!(cache.get("k").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.misses, 1);
    }
}
