//! In-memory cache backend.
//!
//! Entries live in a per-namespace map guarded by one mutex.  Capacity is a
//! soft limit: when publishing a new entry would exceed it, the
//! soonest-expiring entries are evicted first until the new blob fits, and
//! the new entry is inserted even if nothing could be freed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

use super::{http_date_now, Cache, CacheBackend, CacheError, CacheStats, EntryWriter, Headers, Key};
use crate::config::serde_duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Maximum total size of cached objects in megabytes.
    #[serde(default = "default_limit_mb")]
    pub limit_mb: u64,
    /// Maximum time-to-live for entries, in seconds.
    #[serde(default = "default_max_ttl", with = "serde_duration")]
    pub max_ttl: Duration,
}

fn default_limit_mb() -> u64 {
    1024
}

fn default_max_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            limit_mb: default_limit_mb(),
            max_ttl: default_max_ttl(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct MemoryEntry {
    data: Bytes,
    expires_at: SystemTime,
    headers: Headers,
}

#[derive(Default)]
struct MemoryInner {
    // namespace -> key -> entry
    entries: HashMap<String, HashMap<Key, MemoryEntry>>,
    current_size: i64,
    closed: bool,
}

pub struct Memory {
    config: MemoryConfig,
    inner: Arc<Mutex<MemoryInner>>,
}

impl Memory {
    pub fn new(config: MemoryConfig) -> Self {
        info!(
            limit_mb = config.limit_mb,
            max_ttl_secs = config.max_ttl.as_secs_f64(),
            "constructing in-memory cache"
        );
        Self {
            config,
            inner: Arc::new(Mutex::new(MemoryInner::default())),
        }
    }

    /// Wrap into a root-namespace handle.
    pub fn into_cache(self) -> Cache {
        Cache::new(Arc::new(self))
    }

    fn limit_bytes(&self) -> i64 {
        self.config.limit_mb as i64 * 1024 * 1024
    }
}

/// Evict entries in ascending expiry order until `needed` bytes are freed.
/// Expects the inner lock to be held by the caller.
fn evict_soonest_expiring(inner: &mut MemoryInner, needed: i64) {
    let mut candidates: Vec<(String, Key, i64, SystemTime)> = Vec::new();
    for (namespace, entries) in &inner.entries {
        for (key, entry) in entries {
            candidates.push((
                namespace.clone(),
                *key,
                entry.data.len() as i64,
                entry.expires_at,
            ));
        }
    }
    candidates.sort_by_key(|(_, _, _, expires_at)| *expires_at);

    let mut freed = 0i64;
    for (namespace, key, size, _) in candidates {
        if freed >= needed {
            break;
        }
        if let Some(entries) = inner.entries.get_mut(&namespace) {
            if entries.remove(&key).is_some() {
                inner.current_size -= size;
                freed += size;
            }
        }
    }
}

#[async_trait]
impl CacheBackend for Memory {
    fn name(&self) -> String {
        format!("memory:{}MB", self.config.limit_mb)
    }

    async fn stat(&self, namespace: &str, key: &Key) -> Result<Headers, CacheError> {
        let inner = self.inner.lock().expect("memory cache lock poisoned");
        let entry = inner
            .entries
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .ok_or(CacheError::NotFound)?;
        if SystemTime::now() > entry.expires_at {
            return Err(CacheError::NotFound);
        }
        Ok(entry.headers.clone())
    }

    async fn open(&self, namespace: &str, key: &Key) -> Result<(super::Reader, Headers), CacheError> {
        let inner = self.inner.lock().expect("memory cache lock poisoned");
        let entry = inner
            .entries
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .ok_or(CacheError::NotFound)?;
        if SystemTime::now() > entry.expires_at {
            return Err(CacheError::NotFound);
        }
        let reader = std::io::Cursor::new(entry.data.clone());
        Ok((Box::new(reader), entry.headers.clone()))
    }

    async fn create(
        &self,
        namespace: &str,
        key: &Key,
        mut headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn EntryWriter>, CacheError> {
        {
            let inner = self.inner.lock().expect("memory cache lock poisoned");
            if inner.closed {
                return Err(CacheError::Closed);
            }
        }

        let ttl = if ttl.is_zero() { self.config.max_ttl } else { ttl };
        if headers.get("Last-Modified").is_none() {
            headers.set("Last-Modified", http_date_now());
        }

        Ok(Box::new(MemoryWriter {
            inner: Arc::clone(&self.inner),
            limit_bytes: self.limit_bytes(),
            namespace: namespace.to_string(),
            key: *key,
            buf: Vec::new(),
            expires_at: SystemTime::now() + ttl,
            headers,
        }))
    }

    async fn delete(&self, namespace: &str, key: &Key) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("memory cache lock poisoned");
        let entries = inner
            .entries
            .get_mut(namespace)
            .ok_or(CacheError::NotFound)?;
        let entry = entries.remove(key).ok_or(CacheError::NotFound)?;
        inner.current_size -= entry.data.len() as i64;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let inner = self.inner.lock().expect("memory cache lock poisoned");
        let objects = inner
            .entries
            .values()
            .map(|entries| entries.len() as i64)
            .sum();
        Ok(CacheStats {
            objects,
            size: inner.current_size,
            capacity: self.limit_bytes(),
        })
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, CacheError> {
        let inner = self.inner.lock().expect("memory cache lock poisoned");
        let mut namespaces: Vec<String> = inner
            .entries
            .iter()
            .filter(|(namespace, entries)| !namespace.is_empty() && !entries.is_empty())
            .map(|(namespace, _)| namespace.clone())
            .collect();
        namespaces.sort();
        Ok(namespaces)
    }

    async fn close(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().expect("memory cache lock poisoned");
        inner.entries.clear();
        inner.current_size = 0;
        inner.closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct MemoryWriter {
    inner: Arc<Mutex<MemoryInner>>,
    limit_bytes: i64,
    namespace: String,
    key: Key,
    buf: Vec<u8>,
    expires_at: SystemTime,
    headers: Headers,
}

#[async_trait]
impl EntryWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<(), CacheError> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), CacheError> {
        let MemoryWriter {
            inner,
            limit_bytes,
            namespace,
            key,
            buf,
            expires_at,
            headers,
        } = *self;

        let mut inner = inner.lock().expect("memory cache lock poisoned");
        if inner.closed {
            return Err(CacheError::Closed);
        }

        let new_size = buf.len() as i64;
        let old_size = inner
            .entries
            .get(&namespace)
            .and_then(|entries| entries.get(&key))
            .map(|entry| entry.data.len() as i64)
            .unwrap_or(0);

        if limit_bytes > 0 {
            let needed = inner.current_size - old_size + new_size - limit_bytes;
            if needed > 0 {
                evict_soonest_expiring(&mut inner, needed);
            }
        }

        // Re-creation frees the prior entry's space before publishing.
        if let Some(entries) = inner.entries.get_mut(&namespace) {
            if let Some(old) = entries.remove(&key) {
                inner.current_size -= old.data.len() as i64;
            }
        }

        inner.entries.entry(namespace).or_default().insert(
            key,
            MemoryEntry {
                data: Bytes::from(buf),
                expires_at,
                headers,
            },
        );
        inner.current_size += new_size;
        Ok(())
    }
}
