//! Host strategy: forward GET requests under a mount prefix to a fixed
//! target host, caching response payloads.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, RawQuery, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::cache::Cache;
use crate::strategy::{serve_fetch_through, Registry, Strategy, StrategyContext};

pub fn register(registry: &mut Registry) {
    registry.register(
        "host",
        "Forwards GET requests to a fixed target host, caching the responses.",
        "host:\n  mount: /github\n  target: https://github.com/\n",
        |ctx, config: HostConfig| async move {
            let (strategy, router) = Host::new(ctx, config)?;
            Ok((strategy as Arc<dyn Strategy>, router))
        },
    );
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Route prefix the strategy is mounted under, e.g. `/github`.
    pub mount: String,
    /// Target base URL requests are forwarded to.
    pub target: String,
}

pub struct Host {
    ctx: StrategyContext,
    cache: Cache,
    target: url::Url,
}

impl Strategy for Host {
    fn name(&self) -> String {
        format!("host:{}", self.target)
    }
}

impl Host {
    fn new(ctx: StrategyContext, config: HostConfig) -> Result<(Arc<Self>, Router)> {
        let target = url::Url::parse(&config.target).context("invalid target URL")?;
        anyhow::ensure!(
            config.mount.starts_with('/') && config.mount.len() > 1,
            "mount must be a non-empty path prefix"
        );

        let cache = ctx.cache.clone();
        let strategy = Arc::new(Self { ctx, cache, target });
        let route = format!("{}/{{*path}}", config.mount.trim_end_matches('/'));
        let router = Router::new()
            .route(&route, get(handle))
            .with_state(Arc::clone(&strategy));
        Ok((strategy, router))
    }
}

async fn handle(
    State(strategy): State<Arc<Host>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let mut url = strategy.target.clone();
    url.set_path(&path);
    if let Some(query) = &query {
        url.set_query(Some(query));
    }

    match strategy.ctx.http_client.get(url.as_str()).build() {
        Ok(request) => serve_fetch_through(&strategy.ctx, "host", &strategy.cache, request).await,
        Err(err) => {
            tracing::error!(error = %err, "failed to build upstream request");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "bad upstream URL").into_response()
        }
    }
}
