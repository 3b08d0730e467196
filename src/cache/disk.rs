//! Disk cache backend.
//!
//! Blobs are stored at `root/<hex[0..2]>/<hex>` (namespaced entries under
//! `root/<ns>/<hex[0..2]>/<hex>`); expiry and header metadata live in a
//! SQLite database at `root/.meta`.  Entries are written to a temporary file
//! and published with a rename followed by the metadata insert, so readers
//! never observe a half-written body.  A background sweeper removes expired
//! entries every `evict_interval` and then evicts the oldest-expiring entries
//! until total size is back under `limit_mb`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::disk_meta::{MetaDb, MetaEntry};
use super::{http_date_now, Cache, CacheBackend, CacheError, CacheStats, EntryWriter, Headers, Key};
use crate::config::serde_duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    /// Root directory for cached objects.
    pub root: PathBuf,
    /// Maximum total size of cached objects in megabytes.
    #[serde(default = "default_limit_mb")]
    pub limit_mb: u64,
    /// Maximum time-to-live for entries, in seconds.
    #[serde(default = "default_max_ttl", with = "serde_duration")]
    pub max_ttl: Duration,
    /// Cadence of the background eviction sweep, in seconds.
    #[serde(default = "default_evict_interval", with = "serde_duration")]
    pub evict_interval: Duration,
}

fn default_limit_mb() -> u64 {
    1024
}

fn default_max_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_evict_interval() -> Duration {
    Duration::from_secs(60)
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct Disk {
    config: DiskConfig,
    meta: Arc<MetaDb>,
    current_size: Arc<AtomicI64>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
    sweeper: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn blob_path(root: &Path, namespace: &str, key: &Key) -> PathBuf {
    let hex = key.to_hex();
    let base = if namespace.is_empty() {
        root.to_path_buf()
    } else {
        root.join(namespace)
    };
    base.join(&hex[..2]).join(hex)
}

impl Disk {
    /// Open (or initialise) a disk cache rooted at `config.root` and start
    /// the eviction sweeper.
    pub fn new(config: DiskConfig) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.root)?;
        let meta = Arc::new(MetaDb::open(&config.root.join(".meta"))?);

        let initial_size = startup_scan(&config.root, &meta)?;
        info!(
            root = %config.root.display(),
            limit_mb = config.limit_mb,
            size_bytes = initial_size,
            "disk cache initialised"
        );

        let current_size = Arc::new(AtomicI64::new(initial_size));
        let shutdown = CancellationToken::new();

        let disk = Self {
            config,
            meta,
            current_size,
            closed: Arc::new(AtomicBool::new(false)),
            shutdown,
            sweeper: tokio::sync::Mutex::new(None),
        };
        disk.spawn_sweeper();
        Ok(disk)
    }

    /// Wrap into a root-namespace handle.
    pub fn into_cache(self) -> Cache {
        Cache::new(Arc::new(self))
    }

    /// Current total size of stored blobs in bytes.
    pub fn size(&self) -> i64 {
        self.current_size.load(Ordering::Relaxed)
    }

    fn limit_bytes(&self) -> i64 {
        self.config.limit_mb as i64 * 1024 * 1024
    }

    fn spawn_sweeper(&self) {
        let meta = Arc::clone(&self.meta);
        let root = self.config.root.clone();
        let limit = self.limit_bytes();
        let interval = self.config.evict_interval;
        let current_size = Arc::clone(&self.current_size);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = sweep(&root, &meta, limit, &current_size) {
                    warn!(error = %err, "disk cache eviction sweep failed");
                }
            }
        });

        // new() is called before any create, so the slot is always free.
        if let Ok(mut guard) = self.sweeper.try_lock() {
            *guard = Some(handle);
        }
    }
}

/// Reconcile metadata and blobs at startup.  Removes metadata rows whose blob
/// is gone, orphaned blobs with no metadata, and stale temp files.  Returns
/// the total size of surviving blobs.
fn startup_scan(root: &Path, meta: &MetaDb) -> Result<i64, CacheError> {
    let entries = meta.walk()?;
    let mut live = std::collections::HashSet::new();
    let mut dangling = Vec::new();
    let mut total = 0i64;

    for entry in &entries {
        let path = blob_path(root, &entry.namespace, &entry.key);
        match std::fs::metadata(&path) {
            Ok(info) => {
                total += info.len() as i64;
                live.insert(path);
            }
            Err(_) => dangling.push((entry.namespace.clone(), entry.key)),
        }
    }
    if !dangling.is_empty() {
        debug!(count = dangling.len(), "removing metadata for missing blobs");
        meta.delete_all(&dangling)?;
    }

    for item in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !item.file_type().is_file() {
            continue;
        }
        let path = item.path();
        let name = item.file_name().to_string_lossy();
        if name.starts_with(".meta") {
            continue;
        }
        if name.ends_with(".tmp") {
            let _ = std::fs::remove_file(path);
            continue;
        }
        if name.len() == 64 && !live.contains(path) {
            debug!(path = %path.display(), "removing orphaned blob");
            let _ = std::fs::remove_file(path);
        }
    }

    Ok(total)
}

/// One eviction pass: delete expired entries, then oldest-expiring entries
/// until total size is under `limit` (0 means unlimited).  Metadata is
/// removed before the blob so a crash leaves an orphan (cleaned at startup)
/// rather than a body without expiry tracking.
fn sweep(
    root: &Path,
    meta: &MetaDb,
    limit: i64,
    current_size: &AtomicI64,
) -> Result<(), CacheError> {
    let now = now_ms();
    let entries = meta.walk()?;

    struct Candidate {
        entry: MetaEntry,
        path: PathBuf,
        size: i64,
    }

    let mut total = 0i64;
    let mut expired = Vec::new();
    let mut remaining = Vec::new();
    for entry in entries {
        let path = blob_path(root, &entry.namespace, &entry.key);
        let size = std::fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(0);
        total += size;
        let candidate = Candidate { entry, path, size };
        if candidate.entry.expires_at_ms <= now {
            expired.push(candidate);
        } else {
            remaining.push(candidate);
        }
    }

    let mut evicted = 0usize;
    let remove = |candidate: &Candidate, total: &mut i64| -> Result<(), CacheError> {
        meta.delete_all(&[(candidate.entry.namespace.clone(), candidate.entry.key)])?;
        let _ = std::fs::remove_file(&candidate.path);
        *total -= candidate.size;
        Ok(())
    };

    for candidate in &expired {
        remove(candidate, &mut total)?;
        evicted += 1;
    }

    if limit > 0 && total > limit {
        remaining.sort_by_key(|candidate| candidate.entry.expires_at_ms);
        for candidate in &remaining {
            if total <= limit {
                break;
            }
            remove(candidate, &mut total)?;
            evicted += 1;
        }
    }

    current_size.store(total, Ordering::Relaxed);
    if evicted > 0 {
        debug!(evicted, total_bytes = total, "disk cache sweep evicted entries");
    }
    Ok(())
}

#[async_trait]
impl CacheBackend for Disk {
    fn name(&self) -> String {
        format!("disk:{}:{}MB", self.config.root.display(), self.config.limit_mb)
    }

    async fn stat(&self, namespace: &str, key: &Key) -> Result<Headers, CacheError> {
        let expires_at = self.meta.get_ttl(namespace, key)?;
        if expires_at <= now_ms() {
            return Err(CacheError::NotFound);
        }
        self.meta.get_headers(namespace, key)
    }

    async fn open(&self, namespace: &str, key: &Key) -> Result<(super::Reader, Headers), CacheError> {
        let expires_at = self.meta.get_ttl(namespace, key)?;
        if expires_at <= now_ms() {
            return Err(CacheError::NotFound);
        }
        let headers = self.meta.get_headers(namespace, key)?;

        let path = blob_path(&self.config.root, namespace, key);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound)
            }
            Err(err) => return Err(err.into()),
        };
        Ok((Box::new(file), headers))
    }

    async fn create(
        &self,
        namespace: &str,
        key: &Key,
        mut headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn EntryWriter>, CacheError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CacheError::Closed);
        }

        let ttl = if ttl.is_zero() { self.config.max_ttl } else { ttl };
        if headers.get("Last-Modified").is_none() {
            headers.set("Last-Modified", http_date_now());
        }

        let final_path = blob_path(&self.config.root, namespace, key);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);
        let tmp_path = final_path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(Box::new(DiskWriter {
            file: Some(file),
            tmp_path,
            final_path,
            meta: Arc::clone(&self.meta),
            current_size: Arc::clone(&self.current_size),
            namespace: namespace.to_string(),
            key: *key,
            headers,
            expires_at_ms: now_ms() + ttl.as_millis() as i64,
            written: 0,
            finished: false,
        }))
    }

    async fn delete(&self, namespace: &str, key: &Key) -> Result<(), CacheError> {
        self.meta.delete(namespace, key)?;
        let path = blob_path(&self.config.root, namespace, key);
        if let Ok(info) = tokio::fs::metadata(&path).await {
            self.current_size
                .fetch_sub(info.len() as i64, Ordering::Relaxed);
        }
        let _ = tokio::fs::remove_file(&path).await;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats {
            objects: self.meta.count()?,
            size: self.size(),
            capacity: self.limit_bytes(),
        })
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.meta.list_namespaces())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::Relaxed);
        self.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct DiskWriter {
    file: Option<tokio::fs::File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    meta: Arc<MetaDb>,
    current_size: Arc<AtomicI64>,
    namespace: String,
    key: Key,
    headers: Headers,
    expires_at_ms: i64,
    written: i64,
    finished: bool,
}

#[async_trait]
impl EntryWriter for DiskWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<(), CacheError> {
        let file = self.file.as_mut().ok_or(CacheError::Closed)?;
        file.write_all(buf).await?;
        self.written += buf.len() as i64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), CacheError> {
        let mut file = self.file.take().ok_or(CacheError::Closed)?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        // Replacing an entry frees the old blob's accounting first.
        let old_size = tokio::fs::metadata(&self.final_path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;
        self.meta
            .set(&self.namespace, &self.key, self.expires_at_ms, &self.headers)?;

        self.current_size
            .fetch_add(self.written - old_size, Ordering::Relaxed);
        self.finished = true;
        Ok(())
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::read_all;

    fn disk_config(root: &Path) -> DiskConfig {
        DiskConfig {
            root: root.to_path_buf(),
            limit_mb: 1024,
            max_ttl: Duration::from_secs(3600),
            evict_interval: Duration::from_secs(60),
        }
    }

    async fn put(cache: &Cache, key: &Key, body: &[u8], ttl: Duration) {
        let mut writer = cache.create(key, Headers::new(), ttl).await.unwrap();
        writer.write(body).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Disk::new(disk_config(dir.path())).unwrap().into_cache();

        let keep = Key::new("keeps");
        let expire = Key::new("expires");
        put(&cache, &keep, b"first file data", Duration::from_secs(60)).await;
        put(&cache, &expire, b"second file data", Duration::from_millis(150)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        let (mut reader, headers) = cache.open(&keep).await.unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), b"first file data");
        assert!(headers.get("Last-Modified").is_some());

        // Expired entries are logically absent before the sweeper runs.
        match cache.open(&expire).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_removes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Disk::new(DiskConfig {
            evict_interval: Duration::from_millis(100),
            ..disk_config(dir.path())
        })
        .unwrap()
        .into_cache();

        let expire = Key::new("expire-on-disk");
        let keep = Key::new("keep-on-disk");
        put(&cache, &expire, b"expires soon", Duration::from_millis(150)).await;
        put(&cache, &keep, b"keep this", Duration::from_secs(60)).await;

        tokio::time::sleep(Duration::from_millis(500)).await;

        let hex = expire.to_hex();
        assert!(!dir.path().join(&hex[..2]).join(&hex).exists());

        let hex = keep.to_hex();
        assert!(dir.path().join(&hex[..2]).join(&hex).exists());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn eviction_by_size_removes_oldest_expiring() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Disk::new(DiskConfig {
            limit_mb: 1,
            evict_interval: Duration::from_millis(50),
            ..disk_config(dir.path())
        })
        .unwrap()
        .into_cache();

        let blob = vec![0u8; 500 * 1024];
        let keys = [Key::new("key1"), Key::new("key2"), Key::new("key3")];
        for key in &keys {
            put(&cache, key, &blob, Duration::from_secs(3600)).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(250)).await;

        match cache.open(&keys[0]).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
        assert!(cache.open(&keys[1]).await.is_ok());
        assert!(cache.open(&keys[2]).await.is_ok());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn namespaces_are_isolated_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Disk::new(disk_config(dir.path())).unwrap().into_cache();

        let key = Key::new("same-key");
        let git = cache.namespace("git");
        let gomod = cache.namespace("gomod");
        put(&git, &key, b"git data", Duration::from_secs(60)).await;
        put(&gomod, &key, b"gomod data", Duration::from_secs(60)).await;

        let (mut reader, _) = git.open(&key).await.unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), b"git data");
        let (mut reader, _) = gomod.open(&key).await.unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), b"gomod data");

        let namespaces = cache.list_namespaces().await.unwrap();
        assert_eq!(namespaces, vec!["git".to_string(), "gomod".to_string()]);

        git.delete(&key).await.unwrap();
        match git.open(&key).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
        assert!(gomod.open(&key).await.is_ok());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = Key::new("persistent");

        {
            let cache = Disk::new(disk_config(dir.path())).unwrap().into_cache();
            put(&cache, &key, b"still here", Duration::from_secs(3600)).await;
            cache.close().await.unwrap();
        }

        let cache = Disk::new(disk_config(dir.path())).unwrap().into_cache();
        let (mut reader, _) = cache.open(&key).await.unwrap();
        assert_eq!(read_all(&mut reader).await.unwrap(), b"still here");
        assert_eq!(cache.stats().await.unwrap().objects, 1);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn orphaned_blobs_removed_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let key = Key::new("orphan");
        let hex = key.to_hex();

        // A blob with no metadata row, plus a stale temp file.
        let blob_dir = dir.path().join(&hex[..2]);
        std::fs::create_dir_all(&blob_dir).unwrap();
        let orphan = blob_dir.join(&hex);
        std::fs::write(&orphan, b"leftover").unwrap();
        let stale = blob_dir.join("0.1.tmp");
        std::fs::write(&stale, b"partial").unwrap();

        let cache = Disk::new(disk_config(dir.path())).unwrap().into_cache();
        assert!(!orphan.exists());
        assert!(!stale.exists());
        assert_eq!(cache.stats().await.unwrap().size, 0);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_writer_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Disk::new(disk_config(dir.path())).unwrap().into_cache();

        let key = Key::new("abandoned");
        let mut writer = cache
            .create(&key, Headers::new(), Duration::from_secs(60))
            .await
            .unwrap();
        writer.write(b"partial").await.unwrap();
        drop(writer);

        match cache.open(&key).await {
            Err(err) => assert!(err.is_not_found()),
            Ok(_) => panic!("expected open to fail"),
        }
        let hex = key.to_hex();
        let entries: Vec<_> = std::fs::read_dir(dir.path().join(&hex[..2]))
            .map(|rd| rd.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(entries.is_empty());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn size_tracks_writes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(Disk::new(disk_config(dir.path())).unwrap());
        let cache = Cache::new(Arc::clone(&disk) as Arc<dyn CacheBackend>);

        let key1 = Key::new("one");
        let key2 = Key::new("two");
        put(&cache, &key1, b"aaaa", Duration::from_secs(60)).await;
        put(&cache, &key2, b"bbbbbb", Duration::from_secs(60)).await;
        assert_eq!(disk.size(), 10);

        cache.delete(&key1).await.unwrap();
        assert_eq!(disk.size(), 6);
        cache.close().await.unwrap();
    }
}
