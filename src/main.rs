mod cache;
mod config;
mod gitclone;
mod githubapp;
mod metrics;
mod scheduler;
mod snapshot;
mod spool;
mod strategy;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::tiered::maybe_tiered;
use crate::cache::{Cache, CacheBackend, CacheError};
use crate::config::{GlobalConfig, LogConfig, CACHE_BLOCKS};
use crate::githubapp::{EnvTokenProvider, TokenProvider};
use crate::metrics::MetricsRegistry;
use crate::scheduler::Scheduler;
use crate::strategy::{Registry, Strategy, StrategyContext};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "cachew", about = "Protocol-aware tiered caching HTTP proxy")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "cachew.yaml")]
    config: PathBuf,

    /// Print the configuration file schema and exit.
    #[arg(long)]
    schema: bool,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

// ---------------------------------------------------------------------------
// Cache construction
// ---------------------------------------------------------------------------

async fn build_cache_backend(
    name: &str,
    value: serde_yaml::Value,
) -> Result<Arc<dyn CacheBackend>> {
    let value = match value {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
        other => other,
    };
    match name {
        "memory" => {
            let config = serde_yaml::from_value(value).context("invalid memory cache config")?;
            Ok(Arc::new(cache::memory::Memory::new(config)))
        }
        "disk" => {
            let config = serde_yaml::from_value(value).context("invalid disk cache config")?;
            Ok(Arc::new(cache::disk::Disk::new(config)?))
        }
        "s3" => {
            let config = serde_yaml::from_value(value).context("invalid s3 cache config")?;
            Ok(Arc::new(cache::s3::S3::new(config).await?))
        }
        other => anyhow::bail!("unknown cache backend: {other}"),
    }
}

/// Keep the cache gauges current.  Backends that cannot compute stats are
/// simply skipped.
fn spawn_cache_gauge_updater(cache: Cache, metrics: MetricsRegistry) {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticks.tick().await;
            match cache.stats().await {
                Ok(stats) => {
                    metrics.metrics.cache_size_bytes.set(stats.size);
                    metrics.metrics.cache_objects.set(stats.objects);
                }
                Err(CacheError::StatsUnavailable) => {}
                Err(err) => error!(error = %err, "failed to compute cache stats"),
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let registry = Registry::with_builtins();

    if cli.schema {
        print!("{}", config::GLOBAL_SCHEMA);
        print!("{}", registry.schema());
        return Ok(());
    }

    let vars = config::parse_env_vars();
    let loaded = config::load(&cli.config, &vars)?;
    init_tracing(&loaded.config.log);
    info!(config_path = %cli.config.display(), "starting cachew");

    let app = build_app(&registry, loaded.config, loaded.vars).await?;

    let listener = tokio::net::TcpListener::bind(&app.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", app.bind))?;
    info!(bind = %app.bind, url = %app.url, "cachew listening");

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Tear down in reverse construction order.
    app.scheduler.shutdown();
    if let Err(err) = app.cache.close().await {
        error!(error = %err, "failed to close cache");
    }
    info!("cachew shut down cleanly");
    Ok(())
}

/// Fully-wired application: router plus the long-lived subsystems that must
/// outlive it.
struct App {
    bind: String,
    url: String,
    router: Router,
    cache: Cache,
    scheduler: Scheduler,
    // Strategies are addressed only by side effect, but they own background
    // state and must stay alive.
    #[allow(dead_code)]
    strategies: Vec<Arc<dyn Strategy>>,
}

async fn build_app(
    registry: &Registry,
    config: GlobalConfig,
    vars: HashMap<String, String>,
) -> Result<App> {
    let metrics = MetricsRegistry::new(config.metrics.clone());
    metrics.serve().await?;

    let scheduler = Scheduler::new(config.scheduler.clone());

    let token_provider: Option<Arc<dyn TokenProvider>> =
        EnvTokenProvider::from_config(&config.github_app)?
            .map(|provider| Arc::new(provider) as Arc<dyn TokenProvider>);

    let clone_manager = match &config.git_clone {
        Some(git_clone) => Some(Arc::new(gitclone::Manager::new(
            git_clone.clone(),
            token_provider.clone(),
        )?)),
        None => None,
    };

    // First pass: cache backends, composed into tiers in file order.
    let mut backends: Vec<Arc<dyn CacheBackend>> = Vec::new();
    let mut strategy_blocks: Vec<(String, serde_yaml::Value)> = Vec::new();
    for (key, value) in &config.blocks {
        let Some(name) = key.as_str() else {
            anyhow::bail!("config block names must be strings, got {key:?}");
        };
        if CACHE_BLOCKS.contains(&name) {
            backends.push(build_cache_backend(name, value.clone()).await?);
        } else {
            strategy_blocks.push((name.to_string(), value.clone()));
        }
    }
    anyhow::ensure!(
        !backends.is_empty(),
        "expected at least one cache backend (memory, disk or s3)"
    );
    let cache = maybe_tiered(backends);
    info!(cache = %cache.name(), "cache backend ready");
    spawn_cache_gauge_updater(cache.clone(), metrics.clone());

    // The introspection API is always enabled.
    if !strategy_blocks.iter().any(|(name, _)| name == "apiv1") {
        strategy_blocks.push(("apiv1".to_string(), serde_yaml::Value::Null));
    }

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("cachew/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let ctx = StrategyContext {
        scheduler: scheduler.clone(),
        cache: cache.clone(),
        http_client,
        clone_manager,
        token_provider,
        metrics: metrics.clone(),
        env: vars,
    };

    // Second pass: instantiate strategies and merge their routes.
    let mut router = Router::new()
        .route("/_liveness", get(|| async { "OK" }))
        .route("/_readiness", get(|| async { "OK" }));
    let mut strategies = Vec::new();
    for (name, value) in strategy_blocks {
        let (strategy, strategy_router) = registry
            .create(&name, &ctx, value)
            .await
            .with_context(|| format!("failed to initialise strategy {name}"))?;
        strategies.push(strategy);
        router = router.merge(strategy_router);
    }

    Ok(App {
        bind: config.bind,
        url: config.url,
        router,
        cache,
        scheduler,
        strategies,
    })
}
