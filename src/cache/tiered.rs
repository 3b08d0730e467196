//! Ordered composition of cache backends.
//!
//! Reads fall through the tiers in order; writes land in the first tier
//! only.  A hit in a lower tier is served as-is, never backfilled into the
//! first tier, which keeps behaviour predictable under eviction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{Cache, CacheBackend, CacheError, CacheStats, EntryWriter, Headers, Key, Reader};

pub struct Tiered {
    tiers: Vec<Arc<dyn CacheBackend>>,
}

impl Tiered {
    /// Compose `tiers` in priority order.  Panics if `tiers` is empty;
    /// config validation guarantees at least one backend.
    pub fn new(tiers: Vec<Arc<dyn CacheBackend>>) -> Self {
        assert!(!tiers.is_empty(), "tiered cache requires at least one backend");
        Self { tiers }
    }
}

/// Wrap `backends` into a single root handle, skipping the tiered layer when
/// only one backend is configured.
pub fn maybe_tiered(backends: Vec<Arc<dyn CacheBackend>>) -> Cache {
    if backends.len() == 1 {
        return Cache::new(backends.into_iter().next().expect("one backend"));
    }
    let tiered = Tiered::new(backends);
    info!(cache = %tiered.name(), "composed tiered cache");
    Cache::new(Arc::new(tiered))
}

#[async_trait]
impl CacheBackend for Tiered {
    fn name(&self) -> String {
        let names: Vec<String> = self.tiers.iter().map(|tier| tier.name()).collect();
        format!("tiered:[{}]", names.join(", "))
    }

    async fn stat(&self, namespace: &str, key: &Key) -> Result<Headers, CacheError> {
        for tier in &self.tiers {
            match tier.stat(namespace, key).await {
                Err(CacheError::NotFound) => continue,
                other => return other,
            }
        }
        Err(CacheError::NotFound)
    }

    async fn open(&self, namespace: &str, key: &Key) -> Result<(Reader, Headers), CacheError> {
        for tier in &self.tiers {
            match tier.open(namespace, key).await {
                Err(CacheError::NotFound) => continue,
                other => return other,
            }
        }
        Err(CacheError::NotFound)
    }

    async fn create(
        &self,
        namespace: &str,
        key: &Key,
        headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn EntryWriter>, CacheError> {
        self.tiers[0].create(namespace, key, headers, ttl).await
    }

    async fn delete(&self, namespace: &str, key: &Key) -> Result<(), CacheError> {
        let mut found = false;
        for tier in &self.tiers {
            match tier.delete(namespace, key).await {
                Ok(()) => found = true,
                Err(CacheError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        if found {
            Ok(())
        } else {
            Err(CacheError::NotFound)
        }
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut total = CacheStats::default();
        for (index, tier) in self.tiers.iter().enumerate() {
            match tier.stats().await {
                Ok(stats) => {
                    total.objects += stats.objects;
                    total.size += stats.size;
                    if index == 0 {
                        total.capacity = stats.capacity;
                    }
                }
                Err(CacheError::StatsUnavailable) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, CacheError> {
        let mut namespaces = std::collections::BTreeSet::new();
        for tier in &self.tiers {
            for namespace in tier.list_namespaces().await? {
                namespaces.insert(namespace);
            }
        }
        Ok(namespaces.into_iter().collect())
    }

    async fn close(&self) -> Result<(), CacheError> {
        let mut result = Ok(());
        for tier in &self.tiers {
            if let Err(err) = tier.close().await {
                result = Err(err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::{Memory, MemoryConfig};
    use crate::cache::read_all;

    fn two_tier() -> (Cache, Cache, Cache) {
        let first: Arc<dyn CacheBackend> = Arc::new(Memory::new(MemoryConfig::default()));
        let second: Arc<dyn CacheBackend> = Arc::new(Memory::new(MemoryConfig::default()));
        let tiered = Cache::new(Arc::new(Tiered::new(vec![
            Arc::clone(&first),
            Arc::clone(&second),
        ])));
        (tiered, Cache::new(first), Cache::new(second))
    }

    async fn put(cache: &Cache, key: &Key, body: &[u8]) {
        let mut writer = cache
            .create(key, Headers::new(), Duration::from_secs(60))
            .await
            .unwrap();
        writer.write(body).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn reads_fall_through_without_backfill() {
        let (tiered, first, second) = two_tier();
        let key = Key::new("lower-tier-only");
        put(&second, &key, b"from second tier").await;

        let (mut reader, _) = tiered.open(&key).await.unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), b"from second tier");

        // The hit must not have been promoted into the first tier.
        match first.open(&key).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
    }

    #[tokio::test]
    async fn writes_go_to_first_tier_only() {
        let (tiered, first, second) = two_tier();
        let key = Key::new("first-tier-write");
        put(&tiered, &key, b"payload").await;

        assert!(first.open(&key).await.is_ok());
        match second.open(&key).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
    }

    #[tokio::test]
    async fn delete_broadcasts_to_all_tiers() {
        let (tiered, first, second) = two_tier();
        let key = Key::new("everywhere");
        put(&first, &key, b"a").await;
        put(&second, &key, b"b").await;

        tiered.delete(&key).await.unwrap();
        match first.open(&key).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
        match second.open(&key).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }

        assert!(tiered.delete(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stats_sum_with_first_tier_capacity() {
        let (tiered, first, second) = two_tier();
        put(&first, &Key::new("a"), b"1234").await;
        put(&second, &Key::new("b"), b"123456").await;

        let stats = tiered.stats().await.unwrap();
        assert_eq!(stats.objects, 2);
        assert_eq!(stats.size, 10);
        assert_eq!(stats.capacity, 1024 * 1024 * 1024);
    }

    #[tokio::test]
    async fn single_backend_skips_tiering() {
        let backend: Arc<dyn CacheBackend> = Arc::new(Memory::new(MemoryConfig::default()));
        let cache = maybe_tiered(vec![backend]);
        assert!(cache.name().starts_with("memory:"));
    }
}
