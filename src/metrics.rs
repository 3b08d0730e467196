//! Prometheus metrics.
//!
//! One [`Metrics`] struct registers every metric up-front; the shared
//! [`MetricsRegistry`] handle exposes them to strategies and serves the
//! OpenMetrics endpoint on a dedicated port so scrapes never compete with
//! proxied clone traffic.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use serde::Deserialize;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Service name advertised in logs.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Port for the metrics server.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_service_name() -> String {
    "cachew".to_string()
}

fn default_port() -> u16 {
    9102
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StrategyLabels {
    pub strategy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
    pub job: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by cachew.
pub struct Metrics {
    // -- strategies --
    pub requests_total: Family<StrategyLabels, Counter>,
    pub cache_hits_total: Family<StrategyLabels, Counter>,
    pub cache_misses_total: Family<StrategyLabels, Counter>,
    pub upstream_errors_total: Family<StrategyLabels, Counter>,

    // -- git --
    pub git_clones_total: Counter,
    pub git_clone_failures_total: Counter,
    pub git_fetches_total: Counter,
    pub git_fetch_failures_total: Counter,
    pub git_backend_requests_total: Counter,
    pub spool_writers_total: Counter,
    pub spool_readers_total: Counter,
    pub artifact_jobs_total: Family<JobLabels, Counter>,
    pub artifact_job_failures_total: Family<JobLabels, Counter>,
    pub artifact_job_duration_seconds: Histogram,

    // -- cache --
    pub cache_size_bytes: Gauge,
    pub cache_objects: Gauge,
}

impl Metrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<StrategyLabels, Counter>::default();
        registry.register(
            "cachew_requests_total",
            "Requests handled, by strategy",
            requests_total.clone(),
        );

        let cache_hits_total = Family::<StrategyLabels, Counter>::default();
        registry.register(
            "cachew_cache_hits_total",
            "Cache hits, by strategy",
            cache_hits_total.clone(),
        );

        let cache_misses_total = Family::<StrategyLabels, Counter>::default();
        registry.register(
            "cachew_cache_misses_total",
            "Cache misses, by strategy",
            cache_misses_total.clone(),
        );

        let upstream_errors_total = Family::<StrategyLabels, Counter>::default();
        registry.register(
            "cachew_upstream_errors_total",
            "Upstream transport failures, by strategy",
            upstream_errors_total.clone(),
        );

        let git_clones_total = Counter::default();
        registry.register(
            "cachew_git_clones_total",
            "Mirror clones started",
            git_clones_total.clone(),
        );

        let git_clone_failures_total = Counter::default();
        registry.register(
            "cachew_git_clone_failures_total",
            "Mirror clones that failed",
            git_clone_failures_total.clone(),
        );

        let git_fetches_total = Counter::default();
        registry.register(
            "cachew_git_fetches_total",
            "Mirror fetches started",
            git_fetches_total.clone(),
        );

        let git_fetch_failures_total = Counter::default();
        registry.register(
            "cachew_git_fetch_failures_total",
            "Mirror fetches that failed",
            git_fetch_failures_total.clone(),
        );

        let git_backend_requests_total = Counter::default();
        registry.register(
            "cachew_git_backend_requests_total",
            "Requests served from the local git backend",
            git_backend_requests_total.clone(),
        );

        let spool_writers_total = Counter::default();
        registry.register(
            "cachew_spool_writers_total",
            "Requests that became spool writers",
            spool_writers_total.clone(),
        );

        let spool_readers_total = Counter::default();
        registry.register(
            "cachew_spool_readers_total",
            "Requests served from an existing spool",
            spool_readers_total.clone(),
        );

        let artifact_jobs_total = Family::<JobLabels, Counter>::default();
        registry.register(
            "cachew_artifact_jobs_total",
            "Background artefact jobs run, by job name",
            artifact_jobs_total.clone(),
        );

        let artifact_job_failures_total = Family::<JobLabels, Counter>::default();
        registry.register(
            "cachew_artifact_job_failures_total",
            "Background artefact jobs that failed, by job name",
            artifact_job_failures_total.clone(),
        );

        let artifact_job_duration_seconds = Histogram::new(exponential_buckets(1.0, 2.0, 12));
        registry.register(
            "cachew_artifact_job_duration_seconds",
            "Background artefact job latency in seconds",
            artifact_job_duration_seconds.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "cachew_cache_size_bytes",
            "Current cache size in bytes",
            cache_size_bytes.clone(),
        );

        let cache_objects: Gauge = Gauge::default();
        registry.register(
            "cachew_cache_objects",
            "Current number of cached objects",
            cache_objects.clone(),
        );

        Self {
            requests_total,
            cache_hits_total,
            cache_misses_total,
            upstream_errors_total,
            git_clones_total,
            git_clone_failures_total,
            git_fetches_total,
            git_fetch_failures_total,
            git_backend_requests_total,
            spool_writers_total,
            spool_readers_total,
            artifact_jobs_total,
            artifact_job_failures_total,
            artifact_job_duration_seconds,
            cache_size_bytes,
            cache_objects,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle + server
// ---------------------------------------------------------------------------

/// Thread-safe handle carrying the registry and the metric instances.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new(config: MetricsConfig) -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
            config,
        }
    }

    /// Start the dedicated metrics listener (`/metrics` + `/health`).
    pub async fn serve(&self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let registry = Arc::clone(&registry);
                    async move { encode_metrics(&registry) }
                }),
            )
            .route("/health", get(|| async { "OK" }));

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind metrics listener on {addr}"))?;
        info!(%addr, service = %self.config.service_name, "metrics server listening");

        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "metrics server failed");
            }
        });
        Ok(())
    }
}

fn encode_metrics(registry: &Registry) -> impl IntoResponse {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
