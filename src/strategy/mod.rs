//! Strategy framework: config-driven instantiation of protocol-aware caching
//! handlers.
//!
//! Each strategy registers under a name; the registry turns a raw config
//! block into a typed config (after `${VAR}` expansion), hands the factory a
//! [`StrategyContext`] whose scheduler queue and cache keyspace are scoped to
//! the strategy, and merges the returned router into the main app.

pub mod apiv1;
pub mod artifactory;
pub mod git;
pub mod github_releases;
pub mod gomod;
pub mod hermit;
pub mod host;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::cache::fetch::{fetch, FetchError};
use crate::cache::Cache;
use crate::config::expand_yaml_value;
use crate::githubapp::TokenProvider;
use crate::metrics::{MetricsRegistry, StrategyLabels};
use crate::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Context and trait
// ---------------------------------------------------------------------------

/// Everything a strategy factory may need.  Cheap to clone.
#[derive(Clone)]
pub struct StrategyContext {
    pub scheduler: Scheduler,
    pub cache: Cache,
    pub http_client: reqwest::Client,
    pub clone_manager: Option<Arc<crate::gitclone::Manager>>,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    pub metrics: MetricsRegistry,
    /// Variable mapping used for `${VAR}` expansion in config strings.
    pub env: HashMap<String, String>,
}

/// A configured strategy.  Routes are installed at construction time; the
/// object itself is addressed only by name afterwards.
pub trait Strategy: Send + Sync {
    fn name(&self) -> String;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type FactoryFuture = BoxFuture<'static, Result<(Arc<dyn Strategy>, Router)>>;
type Factory = Box<dyn Fn(StrategyContext, serde_yaml::Value) -> FactoryFuture + Send + Sync>;

struct Registration {
    description: &'static str,
    schema: &'static str,
    factory: Factory,
}

#[derive(Default)]
pub struct Registry {
    entries: BTreeMap<&'static str, Registration>,
}

impl Registry {
    /// Registry with every built-in strategy.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        apiv1::register(&mut registry);
        artifactory::register(&mut registry);
        git::register(&mut registry);
        github_releases::register(&mut registry);
        gomod::register(&mut registry);
        hermit::register(&mut registry);
        host::register(&mut registry);
        registry
    }

    /// Register a strategy factory.  `schema` is the example config block
    /// printed by `--schema`.
    pub fn register<C, F, Fut>(
        &mut self,
        name: &'static str,
        description: &'static str,
        schema: &'static str,
        factory: F,
    ) where
        C: DeserializeOwned + Send + 'static,
        F: Fn(StrategyContext, C) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(Arc<dyn Strategy>, Router)>> + Send + 'static,
    {
        let factory = Arc::new(factory);
        let wrapped: Factory = Box::new(move |ctx: StrategyContext, value: serde_yaml::Value| {
            let factory = Arc::clone(&factory);
            let value = expand_yaml_value(value, &ctx.env);
            Box::pin(async move {
                let value = match value {
                    serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
                    other => other,
                };
                let config: C = serde_yaml::from_value(value)
                    .with_context(|| format!("invalid {name} strategy config"))?;
                factory(ctx, config).await
            })
        });
        self.entries.insert(
            name,
            Registration {
                description,
                schema,
                factory: wrapped,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Instantiate strategy `name`, scoping the scheduler queue prefix and
    /// cache namespace to the strategy.
    pub async fn create(
        &self,
        name: &str,
        ctx: &StrategyContext,
        config: serde_yaml::Value,
    ) -> Result<(Arc<dyn Strategy>, Router)> {
        let entry = self
            .entries
            .get(name)
            .with_context(|| format!("unknown strategy: {name}"))?;

        let scoped = StrategyContext {
            scheduler: ctx.scheduler.with_queue_prefix(name),
            cache: ctx.cache.namespace(name),
            ..ctx.clone()
        };
        let (strategy, router) = (entry.factory)(scoped, config).await?;
        info!(strategy = %strategy.name(), "strategy initialised");
        Ok((strategy, router))
    }

    /// Render the config schema for every registered strategy.
    pub fn schema(&self) -> String {
        let mut out = String::new();
        for (name, entry) in &self.entries {
            out.push_str(&format!("# {name}: {}\n", entry.description));
            out.push_str(entry.schema);
            out.push('\n');
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Shared fetch-through handler
// ---------------------------------------------------------------------------

/// Serve `url` through the cache-aware fetch helper and convert the outcome
/// to an HTTP response.  Upstream transport failures map to 502, cache I/O
/// failures to 500.
pub async fn serve_fetch_through(
    ctx: &StrategyContext,
    strategy: &str,
    cache: &Cache,
    request: reqwest::Request,
) -> Response {
    let labels = StrategyLabels {
        strategy: strategy.to_string(),
    };
    ctx.metrics.metrics.requests_total.get_or_create(&labels).inc();

    let url = request.url().to_string();
    let hit_before = cache.stat(&crate::cache::Key::new(&url)).await.is_ok();
    if hit_before {
        ctx.metrics.metrics.cache_hits_total.get_or_create(&labels).inc();
    } else {
        ctx.metrics.metrics.cache_misses_total.get_or_create(&labels).inc();
    }

    match fetch(&ctx.http_client, request, cache).await {
        Ok(response) => {
            let mut builder = Response::builder().status(response.status);
            if let Some(headers) = builder.headers_mut() {
                *headers = response.headers.to_http();
            }
            builder
                .body(Body::from_stream(ReaderStream::new(response.body)))
                .unwrap_or_else(|err| {
                    error!(%url, error = %err, "failed to build response");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                })
        }
        Err(FetchError::Upstream(err)) => {
            ctx.metrics
                .metrics
                .upstream_errors_total
                .get_or_create(&labels)
                .inc();
            warn!(%url, error = %err, "upstream fetch failed");
            (StatusCode::BAD_GATEWAY, "upstream fetch failed").into_response()
        }
        Err(FetchError::Cache(err)) => {
            error!(%url, error = %err, "cache failure during fetch-through");
            (StatusCode::INTERNAL_SERVER_ERROR, "cache failure").into_response()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::memory::{Memory, MemoryConfig};
    use crate::metrics::MetricsConfig;
    use crate::scheduler::SchedulerConfig;

    pub(crate) fn test_context() -> StrategyContext {
        StrategyContext {
            scheduler: Scheduler::new(SchedulerConfig::default()),
            cache: Memory::new(MemoryConfig::default()).into_cache(),
            http_client: reqwest::Client::new(),
            clone_manager: None,
            token_provider: None,
            metrics: MetricsRegistry::new(MetricsConfig::default()),
            env: HashMap::new(),
        }
    }

    struct Dummy;
    impl Strategy for Dummy {
        fn name(&self) -> String {
            "dummy".to_string()
        }
    }

    #[derive(serde::Deserialize)]
    struct DummyConfig {
        #[serde(default)]
        target: String,
    }

    #[tokio::test]
    async fn create_expands_vars_and_scopes_context() {
        let mut registry = Registry::default();
        registry.register(
            "dummy",
            "test strategy",
            "dummy:\n  target: <url>\n",
            |_ctx, config: DummyConfig| async move {
                assert_eq!(config.target, "https://example.com/base");
                Ok((Arc::new(Dummy) as Arc<dyn Strategy>, Router::new()))
            },
        );

        let mut ctx = test_context();
        ctx.env
            .insert("BASE".to_string(), "https://example.com/base".to_string());

        let config: serde_yaml::Value = serde_yaml::from_str("target: ${BASE}").unwrap();
        let (strategy, _router) = registry.create("dummy", &ctx, config).await.unwrap();
        assert_eq!(strategy.name(), "dummy");
    }

    #[tokio::test]
    async fn null_config_block_deserialises_defaults() {
        let mut registry = Registry::default();
        registry.register(
            "dummy",
            "test strategy",
            "dummy: {}\n",
            |_ctx, config: DummyConfig| async move {
                assert_eq!(config.target, "");
                Ok((Arc::new(Dummy) as Arc<dyn Strategy>, Router::new()))
            },
        );
        let ctx = test_context();
        registry
            .create("dummy", &ctx, serde_yaml::Value::Null)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_strategy_is_an_error() {
        let registry = Registry::default();
        let ctx = test_context();
        assert!(registry
            .create("nope", &ctx, serde_yaml::Value::Null)
            .await
            .is_err());
    }

    #[test]
    fn builtin_registry_has_all_strategies() {
        let registry = Registry::with_builtins();
        for name in ["apiv1", "artifactory", "git", "github-releases", "gomod", "hermit", "host"] {
            assert!(registry.contains(name), "missing strategy {name}");
        }
        let schema = registry.schema();
        assert!(schema.contains("git:"));
        assert!(schema.contains("gomod:"));
    }
}
