//! Tiered cache substrate: a uniform byte-stream object store with per-entry
//! headers, TTLs, namespacing and eviction.
//!
//! Backends ([`memory`], [`disk`], [`s3`]) implement [`CacheBackend`]; the
//! [`Cache`] handle layers a namespace tag on top of a shared backend so that
//! strategies get isolated keyspaces over the same storage.  [`tiered`]
//! composes backends into a read-fall-through stack and [`fetch`] provides
//! the on-miss origin fetch shared by the fetch-through strategies.

pub mod disk;
mod disk_meta;
pub mod fetch;
mod headers;
mod key;
pub mod memory;
pub mod s3;
pub mod tiered;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use headers::{http_date_now, Headers};
pub use key::Key;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the cache substrate.
///
/// [`CacheError::NotFound`] is semantic: the entry is absent or expired.
/// Everything else is a real failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entry not found")]
    NotFound,
    #[error("cache statistics unavailable")]
    StatsUnavailable,
    #[error("cache is closed")]
    Closed,
    #[error("invalid cache key")]
    InvalidKey,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("metadata store: {0}")]
    Meta(String),
    #[error("{0}")]
    Backend(String),
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Meta(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Aggregate statistics for a backend.
///
/// `capacity == 0` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub objects: i64,
    pub size: i64,
    pub capacity: i64,
}

/// Streaming reader over an entry body.
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// In-progress cache entry.
///
/// The entry becomes visible atomically on a successful [`finish`]; dropping
/// the writer without finishing discards everything, which is also how
/// cancelled operations avoid publishing partial entries.
///
/// [`finish`]: EntryWriter::finish
#[async_trait]
pub trait EntryWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<(), CacheError>;
    async fn finish(self: Box<Self>) -> Result<(), CacheError>;
}

/// A cache backend: stores byte streams with headers and TTLs, partitioned
/// by namespace.
///
/// All read operations treat expired entries as absent.  `ttl` of zero on
/// [`create`] means "use the backend's configured maximum TTL".
///
/// [`create`]: CacheBackend::create
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Human-readable backend description, e.g. `memory:1024MB`.
    fn name(&self) -> String;

    async fn stat(&self, namespace: &str, key: &Key) -> Result<Headers, CacheError>;

    async fn open(&self, namespace: &str, key: &Key) -> Result<(Reader, Headers), CacheError>;

    async fn create(
        &self,
        namespace: &str,
        key: &Key,
        headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn EntryWriter>, CacheError>;

    async fn delete(&self, namespace: &str, key: &Key) -> Result<(), CacheError>;

    async fn stats(&self) -> Result<CacheStats, CacheError>;

    async fn list_namespaces(&self) -> Result<Vec<String>, CacheError>;

    async fn close(&self) -> Result<(), CacheError>;
}

// ---------------------------------------------------------------------------
// Namespaced handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle over a backend, scoped to one namespace.
///
/// Views share storage with the base: cross-namespace operations
/// ([`Cache::stats`], [`Cache::list_namespaces`], [`Cache::close`]) always go
/// through the underlying backend.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
}

impl Cache {
    /// Wrap a backend with the empty (root) namespace.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            namespace: String::new(),
        }
    }

    /// A view over the same storage scoped to `namespace`.
    pub fn namespace(&self, namespace: &str) -> Cache {
        Cache {
            backend: Arc::clone(&self.backend),
            namespace: namespace.to_string(),
        }
    }

    pub fn name(&self) -> String {
        self.backend.name()
    }

    pub async fn stat(&self, key: &Key) -> Result<Headers, CacheError> {
        self.backend.stat(&self.namespace, key).await
    }

    pub async fn open(&self, key: &Key) -> Result<(Reader, Headers), CacheError> {
        self.backend.open(&self.namespace, key).await
    }

    pub async fn create(
        &self,
        key: &Key,
        headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn EntryWriter>, CacheError> {
        self.backend.create(&self.namespace, key, headers, ttl).await
    }

    pub async fn delete(&self, key: &Key) -> Result<(), CacheError> {
        self.backend.delete(&self.namespace, key).await
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.backend.stats().await
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>, CacheError> {
        self.backend.list_namespaces().await
    }

    pub async fn close(&self) -> Result<(), CacheError> {
        self.backend.close().await
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.backend.name())
            .field("namespace", &self.namespace)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// No-op cache
// ---------------------------------------------------------------------------

/// A cache that never stores anything: every read misses, every write is
/// discarded.  Used for pass-through hops that must not double-cache.
pub fn noop() -> Cache {
    Cache::new(Arc::new(NoOpBackend))
}

struct NoOpBackend;

struct NoOpWriter;

#[async_trait]
impl EntryWriter for NoOpWriter {
    async fn write(&mut self, _buf: &[u8]) -> Result<(), CacheError> {
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), CacheError> {
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for NoOpBackend {
    fn name(&self) -> String {
        "noop".to_string()
    }

    async fn stat(&self, _namespace: &str, _key: &Key) -> Result<Headers, CacheError> {
        Err(CacheError::NotFound)
    }

    async fn open(&self, _namespace: &str, _key: &Key) -> Result<(Reader, Headers), CacheError> {
        Err(CacheError::NotFound)
    }

    async fn create(
        &self,
        _namespace: &str,
        _key: &Key,
        _headers: Headers,
        _ttl: Duration,
    ) -> Result<Box<dyn EntryWriter>, CacheError> {
        Ok(Box::new(NoOpWriter))
    }

    async fn delete(&self, _namespace: &str, _key: &Key) -> Result<(), CacheError> {
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Err(CacheError::StatsUnavailable)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, CacheError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read an entire entry body into memory.  Test and small-object helper;
/// streaming paths read incrementally instead.
pub async fn read_all(reader: &mut Reader) -> Result<Vec<u8>, CacheError> {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_always_misses() {
        let cache = noop();
        let key = Key::new("anything");

        let mut writer = cache
            .create(&key, Headers::new(), Duration::from_secs(60))
            .await
            .unwrap();
        writer.write(b"data").await.unwrap();
        writer.finish().await.unwrap();

        match cache.open(&key).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
        assert!(cache.stat(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn noop_stats_unavailable() {
        let cache = noop();
        assert!(matches!(
            cache.stats().await,
            Err(CacheError::StatsUnavailable)
        ));
    }
}
