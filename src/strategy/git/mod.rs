//! Git caching strategy.
//!
//! Routes `GET|POST /git/{host}/{path...}` by repository state: ready
//! mirrors serve through the local `git http-backend`, repositories still
//! cloning collapse concurrent clients onto one spooled upstream round-trip,
//! and pushes pass straight through.  Periodic jobs keep bundle and snapshot
//! artefacts in the cache and the mirrors repacked.

pub mod backend;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use futures::future::FutureExt;
use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, CacheError, Headers, Key};
use crate::gitclone::{Manager, RepoState, Repository};
use crate::githubapp::TokenProvider;
use crate::metrics::{JobLabels, Metrics};
use crate::scheduler::Scheduler;
use crate::spool::{RepoSpools, SpoolError, SpoolWriter};
use crate::strategy::{Registry, Strategy, StrategyContext};

const ARTIFACT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const BUNDLE_CONTENT_TYPE: &str = "application/x-git-bundle";

/// Upload-pack negotiation bodies are bounded by git's own postBuffer.
const MAX_BUFFERED_BODY: usize = 512 * 1024 * 1024;

pub fn register(registry: &mut Registry) {
    registry.register(
        "git",
        "Caches Git repositories, including bundle and tarball snapshots.",
        "git:\n  bundle_interval: 0      # seconds; 0 disables bundles\n  snapshot_interval: 0    # seconds; 0 disables snapshots\n  repack_interval: 0      # seconds; 0 disables repacks\n",
        |ctx, config: GitConfig| async move {
            let (strategy, router) = GitStrategy::new(ctx, config).await?;
            Ok((strategy as Arc<dyn Strategy>, router))
        },
    );
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitConfig {
    /// How often to generate bundles.  Zero disables bundling.
    #[serde(default, with = "crate::config::serde_duration")]
    pub bundle_interval: Duration,
    /// How often to generate tar.zst snapshots.  Zero disables snapshots.
    #[serde(default, with = "crate::config::serde_duration")]
    pub snapshot_interval: Duration,
    /// How often to repack mirrors.  Zero disables repacking.
    #[serde(default, with = "crate::config::serde_duration")]
    pub repack_interval: Duration,
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct GitStrategy {
    config: GitConfig,
    cache: Cache,
    scheduler: Scheduler,
    clone_manager: Arc<Manager>,
    http_client: reqwest::Client,
    token_provider: Option<Arc<dyn TokenProvider>>,
    metrics: Arc<Metrics>,
    spools: Mutex<HashMap<String, Arc<RepoSpools>>>,
}

impl Strategy for GitStrategy {
    fn name(&self) -> String {
        "git".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

impl GitStrategy {
    pub async fn new(ctx: StrategyContext, config: GitConfig) -> Result<(Arc<Self>, Router)> {
        let clone_manager = ctx
            .clone_manager
            .clone()
            .context("git strategy requires the git-clone block")?;

        if ctx.token_provider.is_some() {
            info!("using GitHub App authentication for git strategy");
        } else {
            warn!("GitHub App not configured, using system git credentials");
        }

        // Spools never outlive the process.
        let stale_spools = clone_manager.config().mirror_root.join(".spools");
        let _ = tokio::fs::remove_dir_all(&stale_spools).await;

        let strategy = Arc::new(Self {
            config,
            cache: ctx.cache,
            scheduler: ctx.scheduler,
            clone_manager: Arc::clone(&clone_manager),
            http_client: ctx.http_client,
            token_provider: ctx.token_provider,
            metrics: Arc::clone(&ctx.metrics.metrics),
            spools: Mutex::new(HashMap::new()),
        });

        let cancel = CancellationToken::new();
        match clone_manager.discover_existing(&cancel).await {
            Ok(existing) => {
                for repo in &existing {
                    strategy.schedule_artifact_jobs(repo);
                }
            }
            Err(err) => warn!(error = %err, "failed to discover existing clones"),
        }

        let router = Router::new()
            .route("/git/{host}/{*path}", get(handle_request).post(handle_request))
            .with_state(Arc::clone(&strategy));

        info!(
            bundle_interval_secs = strategy.config.bundle_interval.as_secs(),
            snapshot_interval_secs = strategy.config.snapshot_interval.as_secs(),
            repack_interval_secs = strategy.config.repack_interval.as_secs(),
            "git strategy initialised"
        );
        Ok((strategy, router))
    }
}

// ---------------------------------------------------------------------------
// Request routing
// ---------------------------------------------------------------------------

async fn handle_request(
    State(strategy): State<Arc<GitStrategy>>,
    AxumPath((host, path)): AxumPath<(String, String)>,
    Query(query): Query<ServiceQuery>,
    request: axum::extract::Request,
) -> Response {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let raw_query = request.uri().query().map(str::to_string);

    debug!(%method, %host, %path, "git request");

    if let Some(trimmed) = path.strip_suffix("/bundle") {
        return strategy.serve_cached_artifact(&host, trimmed, "bundle").await;
    }
    if let Some(trimmed) = path.strip_suffix("/snapshot") {
        return strategy
            .serve_cached_artifact(&host, trimmed, "snapshot")
            .await;
    }

    let is_receive_pack = query.service.as_deref() == Some("git-receive-pack")
        || path.ends_with("/git-receive-pack");
    if is_receive_pack {
        // Write path: never cached, never spooled.
        debug!(%host, %path, "forwarding write operation to upstream");
        let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());
        return strategy
            .forward_to_upstream(&host, &path, raw_query.as_deref(), &headers, method, body)
            .await;
    }

    // Read path: buffer the (small, negotiation-sized) body so it can be
    // hashed for the spool key and replayed to the backend or upstream.
    let body = match axum::body::to_bytes(request.into_body(), MAX_BUFFERED_BODY).await {
        Ok(body) => body,
        Err(err) => {
            warn!(%host, %path, error = %err, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    let repo_path = extract_repo_path(&path);
    let upstream_url = format!("https://{host}/{repo_path}");
    let repo = strategy.clone_manager.get_or_create(&upstream_url);

    let state = repo.state();
    match state {
        RepoState::Ready => {
            if path.ends_with("/info/refs") {
                let cancel = CancellationToken::new();
                if let Err(err) = repo.ensure_refs_up_to_date(&cancel).await {
                    warn!(upstream = %upstream_url, error = %err, "failed to ensure refs up to date");
                }
            }
            strategy.maybe_background_fetch(&repo);
            strategy.metrics.git_backend_requests_total.inc();
            backend::serve_from_backend(
                &strategy,
                &repo,
                &host,
                &path,
                &method,
                &headers,
                raw_query.as_deref(),
                body,
            )
            .await
        }
        RepoState::Empty | RepoState::Cloning => {
            if state == RepoState::Empty {
                debug!(upstream = %upstream_url, "starting background clone, serving via spool");
                let strategy_for_job = Arc::clone(&strategy);
                let repo_for_job = Arc::clone(&repo);
                strategy
                    .scheduler
                    .submit(&upstream_url, "clone", move |cancel| {
                        let strategy = Arc::clone(&strategy_for_job);
                        let repo = Arc::clone(&repo_for_job);
                        async move {
                            strategy.start_clone(&cancel, &repo).await;
                            Ok(())
                        }
                        .boxed()
                    });
            }
            strategy
                .serve_with_spool(&host, &path, &upstream_url, &headers, method, raw_query.as_deref(), body)
                .await
        }
    }
}

/// Strip protocol suffixes from a request path, leaving the repository path.
pub fn extract_repo_path(path: &str) -> &str {
    let path = path.strip_suffix("/info/refs").unwrap_or(path);
    let path = path.strip_suffix("/git-upload-pack").unwrap_or(path);
    let path = path.strip_suffix("/git-receive-pack").unwrap_or(path);
    path.strip_suffix(".git").unwrap_or(path)
}

/// Spool key for a request, or empty when the request is not spoolable.
///
/// Upload-pack POST bodies are hashed so distinct protocol-v2 commands
/// (ls-refs vs fetch) sharing one URL spool separately.
pub fn spool_key_for_request(path: &str, method: &Method, body: &[u8]) -> String {
    if !path.ends_with("/git-upload-pack") {
        return String::new();
    }
    if *method != Method::POST {
        return "upload-pack".to_string();
    }
    let digest = Sha256::digest(body);
    format!("upload-pack-{}", hex::encode(&digest[..8]))
}

/// Scratch directory (`.spools` / `.snapshots`) for an upstream URL.
fn scratch_dir(mirror_root: &std::path::Path, kind: &str, upstream_url: &str) -> PathBuf {
    let base = mirror_root.join(kind);
    let Ok(parsed) = url::Url::parse(upstream_url) else {
        return base.join("unknown");
    };
    let host = parsed.host_str().unwrap_or("unknown");
    let path = parsed.path().trim_start_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    base.join(host).join(path)
}

// ---------------------------------------------------------------------------
// Spooled serving
// ---------------------------------------------------------------------------

impl GitStrategy {
    fn repo_spools(&self, upstream_url: &str) -> Arc<RepoSpools> {
        let mut spools = self.spools.lock().expect("spool map lock poisoned");
        Arc::clone(spools.entry(upstream_url.to_string()).or_insert_with(|| {
            let dir = scratch_dir(
                &self.clone_manager.config().mirror_root,
                ".spools",
                upstream_url,
            );
            Arc::new(RepoSpools::new(dir))
        }))
    }

    fn cleanup_spools(&self, upstream_url: &str) {
        let removed = {
            let mut spools = self.spools.lock().expect("spool map lock poisoned");
            spools.remove(upstream_url)
        };
        if let Some(repo_spools) = removed {
            if let Err(err) = repo_spools.close() {
                warn!(upstream = %upstream_url, error = %err, "failed to clean up spools");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_with_spool(
        &self,
        host: &str,
        path: &str,
        upstream_url: &str,
        headers: &HeaderMap,
        method: Method,
        raw_query: Option<&str>,
        body: Bytes,
    ) -> Response {
        let key = spool_key_for_request(path, &method, &body);
        if key.is_empty() {
            return self
                .forward_to_upstream(host, path, raw_query, headers, method, body.into())
                .await;
        }

        let repo_spools = self.repo_spools(upstream_url);
        let (spool, writer) = match repo_spools.get_or_create(&key) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(upstream = %upstream_url, error = %err, "failed to create spool, forwarding to upstream");
                return self
                    .forward_to_upstream(host, path, raw_query, headers, method, body.into())
                    .await;
            }
        };

        if let Some(writer) = writer {
            debug!(upstream = %upstream_url, key, "spooling upstream response");
            self.metrics.spool_writers_total.inc();
            return self
                .spool_upstream(writer, host, path, raw_query, headers, method, body)
                .await;
        }

        self.metrics.spool_readers_total.inc();
        if spool.failed() {
            debug!(upstream = %upstream_url, key, "spool failed, forwarding to upstream");
            return self
                .forward_to_upstream(host, path, raw_query, headers, method, body.into())
                .await;
        }

        debug!(upstream = %upstream_url, key, "serving from spool");
        match spool.wait_for_head().await {
            Ok(head) => {
                let mut builder = Response::builder().status(head.status);
                if let Some(response_headers) = builder.headers_mut() {
                    *response_headers = head.headers.to_http();
                }
                builder
                    .body(Body::from_stream(spool.body_stream()))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(SpoolError::Failed) => {
                debug!(upstream = %upstream_url, key, "spool failed before response started, forwarding");
                self.forward_to_upstream(host, path, raw_query, headers, method, body.into())
                    .await
            }
            Err(err) => {
                warn!(upstream = %upstream_url, key, error = %err, "spool read failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "spool failure").into_response()
            }
        }
    }

    /// Writer side of a spool: one upstream round-trip teed to the wire and
    /// the spool file.
    #[allow(clippy::too_many_arguments)]
    async fn spool_upstream(
        &self,
        writer: SpoolWriter,
        host: &str,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        method: Method,
        body: Bytes,
    ) -> Response {
        let response = match self
            .send_upstream(host, path, raw_query, headers, method, body.into())
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(%host, %path, error = %err, "upstream request failed");
                // Dropping the writer fails the spool so readers fall back.
                drop(writer);
                return (StatusCode::BAD_GATEWAY, "upstream request failed").into_response();
            }
        };

        let status = response.status();
        let response_headers = sanitize_headers(response.headers());
        writer.set_head(status.as_u16(), Headers::from_http(&response_headers));

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
        tokio::spawn(async move {
            let mut writer = writer;
            let mut stream = response.bytes_stream();
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        if let Err(err) = writer.write(&chunk).await {
                            warn!(error = %err, "spool write failed");
                            let _ = tx.send(Err(std::io::Error::other(err))).await;
                            return; // dropped writer fails the spool
                        }
                        if tx.send(Ok(chunk)).await.is_err() {
                            // Writer client disconnected; keep spooling for
                            // the readers still attached.
                            continue;
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx
                            .send(Err(std::io::Error::other(format!("upstream body: {err}"))))
                            .await;
                        return;
                    }
                    None => break,
                }
            }
            writer.mark_complete();
        });

        let mut builder = Response::builder().status(status);
        if let Some(out) = builder.headers_mut() {
            *out = response_headers;
        }
        builder
            .body(Body::from_stream(
                tokio_stream::wrappers::ReceiverStream::new(rx),
            ))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

// ---------------------------------------------------------------------------
// Upstream proxying
// ---------------------------------------------------------------------------

/// Hop-by-hop headers that must not be forwarded in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

impl GitStrategy {
    /// Rewrite the request to `https://{host}/{path}` and send it upstream,
    /// injecting GitHub App credentials for the path's organisation when
    /// available.
    async fn send_upstream(
        &self,
        host: &str,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        method: Method,
        body: reqwest::Body,
    ) -> reqwest::Result<reqwest::Response> {
        let mut url = format!("https://{host}/{path}");
        if let Some(query) = raw_query {
            url.push('?');
            url.push_str(query);
        }

        let mut request = self
            .http_client
            .request(method, &url)
            .headers(sanitize_headers(headers))
            .body(body);

        if host == "github.com" {
            if let Some(provider) = &self.token_provider {
                let org = path.split('/').find(|segment| !segment.is_empty());
                if let Some(org) = org {
                    if let Some(token) = provider.token_for_org(org).await {
                        debug!(org, "injecting GitHub App auth into upstream request");
                        let credentials = base64::engine::general_purpose::STANDARD
                            .encode(format!("x-access-token:{token}"));
                        request = request.header(header::AUTHORIZATION, format!("Basic {credentials}"));
                    }
                }
            }
        }

        request.send().await
    }

    /// Proxy a request upstream and stream the response back.  Transport
    /// errors map to 502.
    async fn forward_to_upstream(
        &self,
        host: &str,
        path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        method: Method,
        body: reqwest::Body,
    ) -> Response {
        debug!(%method, %host, %path, "forwarding to upstream");
        match self
            .send_upstream(host, path, raw_query, headers, method, body)
            .await
        {
            Ok(response) => {
                let status = response.status();
                let response_headers = sanitize_headers(response.headers());
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(std::io::Error::other));
                let mut builder = Response::builder().status(status);
                if let Some(out) = builder.headers_mut() {
                    *out = response_headers;
                }
                builder
                    .body(Body::from_stream(stream))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(err) => {
                error!(%host, %path, error = %err, "upstream request failed");
                (StatusCode::BAD_GATEWAY, "upstream request failed").into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cached artefacts
// ---------------------------------------------------------------------------

impl GitStrategy {
    /// Serve a bundle or snapshot artefact from the cache.
    async fn serve_cached_artifact(&self, host: &str, trimmed_path: &str, artifact: &str) -> Response {
        let repo_path = extract_repo_path(trimmed_path);
        let upstream_url = format!("https://{host}/{repo_path}");
        let key = Key::new(&format!("{upstream_url}.{artifact}"));

        debug!(upstream = %upstream_url, artifact, "artefact request");

        match self.cache.open(&key).await {
            Ok((reader, headers)) => {
                let mut builder = Response::builder().status(StatusCode::OK);
                if let Some(out) = builder.headers_mut() {
                    *out = headers.to_http();
                }
                builder
                    .body(Body::from_stream(ReaderStream::new(reader)))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(CacheError::NotFound) => {
                debug!(upstream = %upstream_url, artifact, "artefact not found in cache");
                StatusCode::NOT_FOUND.into_response()
            }
            Err(err) => {
                error!(upstream = %upstream_url, artifact, error = %err, "failed to open artefact");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background jobs
// ---------------------------------------------------------------------------

impl GitStrategy {
    async fn start_clone(&self, cancel: &CancellationToken, repo: &Arc<Repository>) {
        info!(upstream = %repo.upstream_url(), path = %repo.path().display(), "starting clone");
        self.metrics.git_clones_total.inc();

        let result = repo.clone_mirror(cancel).await;

        // Spools are cleared whether the clone worked or not, so subsequent
        // requests either hit the local backend or go straight upstream.
        self.cleanup_spools(repo.upstream_url());

        match result {
            Ok(()) => {
                info!(upstream = %repo.upstream_url(), "clone completed");
            }
            Err(err) => {
                self.metrics.git_clone_failures_total.inc();
                error!(upstream = %repo.upstream_url(), error = %err, "clone failed");
            }
        }
    }

    fn maybe_background_fetch(self: &Arc<Self>, repo: &Arc<Repository>) {
        let interval = self.clone_manager.config().fetch_interval;
        if !repo.needs_fetch(interval) {
            return;
        }
        let strategy = Arc::clone(self);
        let repo = Arc::clone(repo);
        let upstream_url = repo.upstream_url().to_string();
        self.scheduler
            .submit(&upstream_url, "fetch", move |cancel| {
                let strategy = Arc::clone(&strategy);
                let repo = Arc::clone(&repo);
                async move {
                    if !repo.needs_fetch(strategy.clone_manager.config().fetch_interval) {
                        return Ok(());
                    }
                    debug!(upstream = %repo.upstream_url(), "fetching updates");
                    strategy.metrics.git_fetches_total.inc();
                    if let Err(err) = repo.fetch(&cancel).await {
                        strategy.metrics.git_fetch_failures_total.inc();
                        error!(upstream = %repo.upstream_url(), error = %err, "fetch failed");
                    }
                    Ok(())
                }
                .boxed()
            });
    }

    /// Register the periodic artefact jobs for `repo`.  Zero intervals
    /// register as disabled.
    pub(crate) fn schedule_artifact_jobs(self: &Arc<Self>, repo: &Arc<Repository>) {
        let jobs: [(&str, Duration); 3] = [
            ("bundle-periodic", self.config.bundle_interval),
            ("snapshot-periodic", self.config.snapshot_interval),
            ("repack-periodic", self.config.repack_interval),
        ];
        for (name, interval) in jobs {
            let strategy = Arc::clone(self);
            let repo = Arc::clone(repo);
            let job_name = name.to_string();
            let upstream_url = repo.upstream_url().to_string();
            self.scheduler
                .submit_periodic_job(&upstream_url, name, interval, move |cancel| {
                    let strategy = Arc::clone(&strategy);
                    let repo = Arc::clone(&repo);
                    let job_name = job_name.clone();
                    async move { strategy.run_artifact_job(&cancel, &repo, &job_name).await }.boxed()
                });
        }
    }

    async fn run_artifact_job(
        &self,
        cancel: &CancellationToken,
        repo: &Arc<Repository>,
        job: &str,
    ) -> Result<()> {
        let labels = JobLabels {
            job: job.to_string(),
        };
        self.metrics.artifact_jobs_total.get_or_create(&labels).inc();
        let started = std::time::Instant::now();

        let result = match job {
            "bundle-periodic" => self.generate_bundle(cancel, repo).await,
            "snapshot-periodic" => self.generate_snapshot(cancel, repo).await,
            "repack-periodic" => repo.repack(cancel).await,
            other => anyhow::bail!("unknown artefact job {other}"),
        };

        self.metrics
            .artifact_job_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        if result.is_err() {
            self.metrics
                .artifact_job_failures_total
                .get_or_create(&labels)
                .inc();
        }
        result
    }

    /// Stream `git bundle create` output straight into the cache.
    pub(crate) async fn generate_bundle(
        &self,
        cancel: &CancellationToken,
        repo: &Arc<Repository>,
    ) -> Result<()> {
        let upstream = repo.upstream_url();
        info!(upstream, "bundle generation started");

        let key = Key::new(&format!("{upstream}.bundle"));
        let mut headers = Headers::new();
        headers.set("Content-Type", BUNDLE_CONTENT_TYPE);
        let mut writer = self
            .cache
            .create(&key, headers, ARTIFACT_TTL)
            .await
            .map_err(|err| anyhow::anyhow!("create cache entry: {err}"))?;

        let _guard = repo.read_guard().await;

        // Branches and remotes only; tag sets can be enormous.
        let mut child = tokio::process::Command::new("git")
            .args([
                "-C",
                &repo.path().display().to_string(),
                "bundle",
                "create",
                "-",
                "--branches",
                "--remotes",
            ])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("spawn git bundle create")?;

        let mut stdout = child.stdout.take().context("capture bundle stdout")?;
        let mut stderr = child.stderr.take().context("capture bundle stderr")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            use tokio::io::AsyncReadExt;
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            use tokio::io::AsyncReadExt;
            let read = tokio::select! {
                read = stdout.read(&mut buf) => read.context("read bundle stream")?,
                () = cancel.cancelled() => anyhow::bail!("bundle generation cancelled"),
            };
            if read == 0 {
                break;
            }
            writer
                .write(&buf[..read])
                .await
                .map_err(|err| anyhow::anyhow!("write bundle to cache: {err}"))?;
        }

        let status = child.wait().await.context("wait for git bundle")?;
        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            anyhow::bail!(
                "bundle generation failed ({status}): {}",
                String::from_utf8_lossy(&stderr).trim()
            );
        }

        writer
            .finish()
            .await
            .map_err(|err| anyhow::anyhow!("publish bundle: {err}"))?;
        info!(upstream, "bundle generation completed");
        Ok(())
    }

    /// Snapshot the mirror via a scratch working-tree clone.
    pub(crate) async fn generate_snapshot(
        &self,
        cancel: &CancellationToken,
        repo: &Arc<Repository>,
    ) -> Result<()> {
        let upstream = repo.upstream_url();
        info!(upstream, "snapshot generation started");

        let key = Key::new(&format!("{upstream}.snapshot"));
        let workdir = scratch_dir(
            &self.clone_manager.config().mirror_root,
            ".snapshots",
            upstream,
        );

        let _guard = repo.read_guard().await;
        crate::snapshot::create(
            cancel,
            &self.cache,
            key,
            repo.path(),
            &workdir,
            ARTIFACT_TTL,
            &["*.lock".to_string()],
        )
        .await
        .context("create snapshot")?;

        info!(upstream, "snapshot generation completed");
        Ok(())
    }
}
