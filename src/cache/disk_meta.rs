//! SQLite-backed metadata store for the disk cache.
//!
//! Tracks expiry instants and entry headers in two tables keyed by
//! `"<namespace>/<hex-key>"` (bare `<hex-key>` for the empty namespace, kept
//! for backwards compatibility with pre-namespace layouts).  The database
//! lives at `<root>/.meta` and is opened with a bounded busy timeout so a
//! stale lock cannot wedge startup indefinitely.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use super::{CacheError, Headers, Key};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One row of expiry metadata, as yielded by [`MetaDb::walk`].
#[derive(Debug, Clone)]
pub(crate) struct MetaEntry {
    pub key: Key,
    pub namespace: String,
    /// Expiry instant in milliseconds since the Unix epoch.
    pub expires_at_ms: i64,
}

pub(crate) struct MetaDb {
    conn: Mutex<Connection>,
    namespaces: Mutex<BTreeSet<String>>,
}

/// Unique database key for `(namespace, key)`.
fn composite_key(namespace: &str, key: &Key) -> String {
    if namespace.is_empty() {
        key.to_hex()
    } else {
        format!("{namespace}/{}", key.to_hex())
    }
}

/// Split a database key back into `(namespace, hex)`.
fn split_key(db_key: &str) -> (&str, &str) {
    match db_key.split_once('/') {
        Some((namespace, hex)) => (namespace, hex),
        None => ("", db_key),
    }
}

impl MetaDb {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ttl (
                 key TEXT PRIMARY KEY,
                 expires_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS headers (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;

        // Seed the in-memory namespace set from existing entries.
        let mut namespaces = BTreeSet::new();
        {
            let mut stmt = conn.prepare("SELECT key FROM ttl")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let db_key: String = row.get(0)?;
                let (namespace, _) = split_key(&db_key);
                if !namespace.is_empty() {
                    namespaces.insert(namespace.to_string());
                }
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            namespaces: Mutex::new(namespaces),
        })
    }

    pub fn set(
        &self,
        namespace: &str,
        key: &Key,
        expires_at_ms: i64,
        headers: &Headers,
    ) -> Result<(), CacheError> {
        let headers_json = serde_json::to_string(headers)
            .map_err(|err| CacheError::Meta(format!("encode headers: {err}")))?;
        let db_key = composite_key(namespace, key);

        let mut conn = self.conn.lock().expect("meta db lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO ttl (key, expires_at) VALUES (?1, ?2)",
            params![db_key, expires_at_ms],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO headers (key, value) VALUES (?1, ?2)",
            params![db_key, headers_json],
        )?;
        tx.commit()?;
        drop(conn);

        if !namespace.is_empty() {
            self.namespaces
                .lock()
                .expect("namespace set lock poisoned")
                .insert(namespace.to_string());
        }
        Ok(())
    }

    pub fn get_ttl(&self, namespace: &str, key: &Key) -> Result<i64, CacheError> {
        let db_key = composite_key(namespace, key);
        let conn = self.conn.lock().expect("meta db lock poisoned");
        conn.query_row(
            "SELECT expires_at FROM ttl WHERE key = ?1",
            params![db_key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(CacheError::NotFound)
    }

    pub fn get_headers(&self, namespace: &str, key: &Key) -> Result<Headers, CacheError> {
        let db_key = composite_key(namespace, key);
        let conn = self.conn.lock().expect("meta db lock poisoned");
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM headers WHERE key = ?1",
                params![db_key],
                |row| row.get(0),
            )
            .optional()?;
        let json = json.ok_or(CacheError::NotFound)?;
        serde_json::from_str(&json).map_err(|err| CacheError::Meta(format!("decode headers: {err}")))
    }

    /// Remove one entry.  Returns [`CacheError::NotFound`] when it was absent.
    pub fn delete(&self, namespace: &str, key: &Key) -> Result<(), CacheError> {
        let db_key = composite_key(namespace, key);
        let mut conn = self.conn.lock().expect("meta db lock poisoned");
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM ttl WHERE key = ?1", params![db_key])?;
        tx.execute("DELETE FROM headers WHERE key = ?1", params![db_key])?;
        tx.commit()?;
        if removed == 0 {
            return Err(CacheError::NotFound);
        }
        Ok(())
    }

    /// Remove a batch of entries in one transaction (eviction sweep).
    pub fn delete_all(&self, entries: &[(String, Key)]) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().expect("meta db lock poisoned");
        let tx = conn.transaction()?;
        for (namespace, key) in entries {
            let db_key = composite_key(namespace, key);
            tx.execute("DELETE FROM ttl WHERE key = ?1", params![db_key])?;
            tx.execute("DELETE FROM headers WHERE key = ?1", params![db_key])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All expiry rows.  Rows with unparseable keys are skipped.
    pub fn walk(&self) -> Result<Vec<MetaEntry>, CacheError> {
        let conn = self.conn.lock().expect("meta db lock poisoned");
        let mut stmt = conn.prepare("SELECT key, expires_at FROM ttl")?;
        let mut rows = stmt.query([])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let db_key: String = row.get(0)?;
            let expires_at_ms: i64 = row.get(1)?;
            let (namespace, hex) = split_key(&db_key);
            let Ok(key) = Key::from_hex(hex) else {
                continue;
            };
            entries.push(MetaEntry {
                key,
                namespace: namespace.to_string(),
                expires_at_ms,
            });
        }
        Ok(entries)
    }

    pub fn count(&self) -> Result<i64, CacheError> {
        let conn = self.conn.lock().expect("meta db lock poisoned");
        let count = conn.query_row("SELECT COUNT(*) FROM ttl", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn list_namespaces(&self) -> Vec<String> {
        self.namespaces
            .lock()
            .expect("namespace set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
