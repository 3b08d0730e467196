//! S3 cache backend.
//!
//! Objects live at `<prefix><namespace>/<hex-key>` (no namespace segment for
//! the empty namespace).  Entry headers and the expiry instant ride along as
//! object metadata; expired objects read as NotFound and are left for a
//! bucket lifecycle rule to reap.  Statistics are unavailable; computing
//! them would mean listing the whole bucket.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use serde::Deserialize;
use tracing::{debug, info};

use super::{http_date_now, Cache, CacheBackend, CacheError, CacheStats, EntryWriter, Headers, Key, Reader};
use crate::config::serde_duration;

const EXPIRES_AT_META: &str = "cachew-expires-at-ms";
const HEADERS_META: &str = "cachew-headers";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub region: String,
    /// Maximum time-to-live for entries, in seconds.
    #[serde(default = "default_max_ttl", with = "serde_duration")]
    pub max_ttl: Duration,
}

fn default_prefix() -> String {
    "cachew/".to_string()
}

fn default_max_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct S3 {
    client: Client,
    config: S3Config,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn object_key(prefix: &str, namespace: &str, key: &Key) -> String {
    if namespace.is_empty() {
        format!("{prefix}{}", key.to_hex())
    } else {
        format!("{prefix}{namespace}/{}", key.to_hex())
    }
}

/// Parse entry metadata from S3 object metadata.  Missing expiry metadata is
/// treated as never-expiring for compatibility with externally-seeded
/// objects.
fn decode_meta(
    metadata: Option<&std::collections::HashMap<String, String>>,
) -> Result<(i64, Headers), CacheError> {
    let expires_at = metadata
        .and_then(|meta| meta.get(EXPIRES_AT_META))
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(i64::MAX);
    let headers = match metadata.and_then(|meta| meta.get(HEADERS_META)) {
        Some(json) => serde_json::from_str(json)
            .map_err(|err| CacheError::Backend(format!("decode S3 headers metadata: {err}")))?,
        None => Headers::new(),
    };
    Ok((expires_at, headers))
}

impl S3 {
    /// Build a backend from the ambient AWS credential chain.
    pub async fn new(config: S3Config) -> Result<Self, CacheError> {
        let aws_config = aws_config::from_env()
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;
        let client = Client::new(&aws_config);
        info!(
            bucket = %config.bucket,
            prefix = %config.prefix,
            region = %config.region,
            "S3 cache initialised"
        );
        Ok(Self { client, config })
    }

    /// Wrap into a root-namespace handle.
    pub fn into_cache(self) -> Cache {
        Cache::new(Arc::new(self))
    }

    fn key_for(&self, namespace: &str, key: &Key) -> String {
        object_key(&self.config.prefix, namespace, key)
    }
}

#[async_trait]
impl CacheBackend for S3 {
    fn name(&self) -> String {
        format!("s3:{}/{}", self.config.bucket, self.config.prefix)
    }

    async fn stat(&self, namespace: &str, key: &Key) -> Result<Headers, CacheError> {
        let object_key = self.key_for(namespace, key);
        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    CacheError::NotFound
                } else {
                    CacheError::Backend(format!("S3 HeadObject: {err}"))
                }
            })?;

        let (expires_at, headers) = decode_meta(head.metadata())?;
        if expires_at <= now_ms() {
            return Err(CacheError::NotFound);
        }
        Ok(headers)
    }

    async fn open(&self, namespace: &str, key: &Key) -> Result<(Reader, Headers), CacheError> {
        let object_key = self.key_for(namespace, key);
        let object = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|e| matches!(e, aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)))
                {
                    CacheError::NotFound
                } else {
                    CacheError::Backend(format!("S3 GetObject: {err}"))
                }
            })?;

        let (expires_at, headers) = decode_meta(object.metadata())?;
        if expires_at <= now_ms() {
            return Err(CacheError::NotFound);
        }

        // Bridge the SDK body stream into an AsyncRead without buffering the
        // whole object.
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(8);
        let mut body = object.body;
        tokio::spawn(async move {
            loop {
                match body.try_next().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx
                            .send(Err(std::io::Error::other(format!("S3 body stream: {err}"))))
                            .await;
                        break;
                    }
                }
            }
        });
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let reader = tokio_util::io::StreamReader::new(stream);
        Ok((Box::new(reader), headers))
    }

    async fn create(
        &self,
        namespace: &str,
        key: &Key,
        mut headers: Headers,
        ttl: Duration,
    ) -> Result<Box<dyn EntryWriter>, CacheError> {
        let ttl = if ttl.is_zero() { self.config.max_ttl } else { ttl };
        if headers.get("Last-Modified").is_none() {
            headers.set("Last-Modified", http_date_now());
        }

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.config.bucket.clone(),
            object_key: self.key_for(namespace, key),
            headers,
            expires_at_ms: now_ms() + ttl.as_millis() as i64,
            buf: Vec::new(),
        }))
    }

    async fn delete(&self, namespace: &str, key: &Key) -> Result<(), CacheError> {
        // DeleteObject is a silent no-op for missing keys, so probe first to
        // preserve NotFound semantics.
        self.stat(namespace, key).await?;
        let object_key = self.key_for(namespace, key);
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| CacheError::Backend(format!("S3 DeleteObject: {err}")))?;
        debug!(key = %object_key, "deleted S3 cache entry");
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        Err(CacheError::StatsUnavailable)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, CacheError> {
        let mut namespaces = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(&self.config.prefix)
                .delimiter("/");
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .map_err(|err| CacheError::Backend(format!("S3 ListObjectsV2: {err}")))?;

            for common in page.common_prefixes() {
                if let Some(full) = common.prefix() {
                    let namespace = full
                        .strip_prefix(&self.config.prefix)
                        .unwrap_or(full)
                        .trim_end_matches('/');
                    if !namespace.is_empty() {
                        namespaces.push(namespace.to_string());
                    }
                }
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct S3Writer {
    client: Client,
    bucket: String,
    object_key: String,
    headers: Headers,
    expires_at_ms: i64,
    buf: Vec<u8>,
}

#[async_trait]
impl EntryWriter for S3Writer {
    async fn write(&mut self, buf: &[u8]) -> Result<(), CacheError> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), CacheError> {
        let headers_json = serde_json::to_string(&self.headers)
            .map_err(|err| CacheError::Backend(format!("encode headers metadata: {err}")))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.object_key)
            .metadata(EXPIRES_AT_META, self.expires_at_ms.to_string())
            .metadata(HEADERS_META, headers_json)
            .body(ByteStream::from(self.buf));
        if let Some(content_type) = self.headers.get("Content-Type") {
            request = request.content_type(content_type);
        }
        request
            .send()
            .await
            .map_err(|err| CacheError::Backend(format!("S3 PutObject: {err}")))?;
        Ok(())
    }
}
