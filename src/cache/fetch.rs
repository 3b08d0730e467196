//! Fetch-through: serve from cache, or fetch from origin while teeing the
//! body into a cache entry.
//!
//! Any 200 response is cached regardless of `Cache-Control`; the proxied
//! workloads (release binaries, module zips, package tarballs) are immutable
//! by URL and origin cache headers are routinely unhelpful.

use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{Cache, CacheError, Headers, Key, Reader};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error(transparent)]
    Cache(CacheError),
}

impl From<CacheError> for FetchError {
    fn from(err: CacheError) -> Self {
        FetchError::Cache(err)
    }
}

/// A response produced by [`fetch`]: either replayed from cache or streamed
/// from the origin.
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Reader,
}

/// Serve `request`'s URL from `cache`, falling through to the origin on a
/// miss.
///
/// On a 200 origin response the body is streamed to the caller and into a
/// cache writer concurrently; the entry is only published once the origin
/// body drains completely, so a broken transfer caches nothing.  Non-200
/// responses pass through uncached.
pub async fn fetch(
    client: &reqwest::Client,
    request: reqwest::Request,
    cache: &Cache,
) -> Result<FetchResponse, FetchError> {
    let url = request.url().to_string();
    let key = Key::new(&url);

    match cache.open(&key).await {
        Ok((body, headers)) => {
            debug!(%url, "cache hit");
            return Ok(FetchResponse {
                status: StatusCode::OK,
                headers,
                body,
            });
        }
        Err(CacheError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    debug!(%url, "cache miss, fetching from origin");
    let response = client.execute(request).await?;
    let status = response.status();
    let headers = Headers::from_http(response.headers());

    if status != StatusCode::OK {
        return Ok(FetchResponse {
            status,
            headers,
            body: stream_reader(response),
        });
    }

    let writer = cache
        .create(&key, headers.clone(), std::time::Duration::ZERO)
        .await?;

    // Tee origin bytes to the caller and the cache writer.  Dropping the
    // writer on any failure discards the partial entry.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        let mut writer = writer;
        let mut stream = response.bytes_stream();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if let Err(err) = writer.write(&chunk).await {
                        warn!(%url, error = %err, "cache write failed mid-stream");
                        let _ = tx.send(Err(std::io::Error::other(err))).await;
                        return;
                    }
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Client went away; the entry stays unpublished.
                        return;
                    }
                }
                Some(Err(err)) => {
                    let _ = tx
                        .send(Err(std::io::Error::other(format!("origin body: {err}"))))
                        .await;
                    return;
                }
                None => break,
            }
        }
        if let Err(err) = writer.finish().await {
            warn!(%url, error = %err, "failed to publish cache entry");
        }
    });

    Ok(FetchResponse {
        status: StatusCode::OK,
        headers,
        body: Box::new(StreamReader::new(ReceiverStream::new(rx))),
    })
}

fn stream_reader(response: reqwest::Response) -> Reader {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    Box::new(StreamReader::new(stream))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::cache::memory::{Memory, MemoryConfig};
    use crate::cache::read_all;

    /// Serve a tiny origin on an ephemeral port, counting requests.
    async fn spawn_origin() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new()
            .route(
                "/asset",
                get(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        ([("content-type", "text/plain")], "origin payload")
                    }
                }),
            )
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn miss_fetches_and_caches() {
        let (origin, hits) = spawn_origin().await;
        let cache = Memory::new(MemoryConfig::default()).into_cache();
        let client = reqwest::Client::new();
        let url = format!("{origin}/asset");

        let request = client.get(&url).build().unwrap();
        let mut response = fetch(&client, request, &cache).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(read_all(&mut response.body).await.unwrap(), b"origin payload");

        // The tee task publishes asynchronously after the body drains.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let request = client.get(&url).build().unwrap();
        let mut response = fetch(&client, request, &cache).await.unwrap();
        assert_eq!(read_all(&mut response.body).await.unwrap(), b"origin payload");
        assert!(response.headers.get("Last-Modified").is_some());

        // Second fetch was a cache hit: the origin saw exactly one request.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_200_passes_through_uncached() {
        let (origin, _) = spawn_origin().await;
        let cache = Memory::new(MemoryConfig::default()).into_cache();
        let client = reqwest::Client::new();
        let url = format!("{origin}/missing");

        let request = client.get(&url).build().unwrap();
        let mut response = fetch(&client, request, &cache).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(read_all(&mut response.body).await.unwrap(), b"nope");

        assert!(cache
            .open(&Key::new(&url))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn unreachable_origin_is_an_upstream_error() {
        let cache = Memory::new(MemoryConfig::default()).into_cache();
        let client = reqwest::Client::new();
        // Reserved TEST-NET address; nothing listens there.
        let request = client.get("http://127.0.0.1:9/asset").build().unwrap();
        assert!(matches!(
            fetch(&client, request, &cache).await,
            Err(FetchError::Upstream(_))
        ));
    }
}
