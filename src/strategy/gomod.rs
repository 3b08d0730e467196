//! Go module proxy strategy.
//!
//! Serves the module proxy protocol (`/@v/list`, `.info`, `.mod`, `.zip`,
//! `@latest`) by fetch-through against an upstream proxy.  Module artefacts
//! are immutable by path, which makes them ideal cache fodder.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::debug;

use crate::cache::Cache;
use crate::strategy::{serve_fetch_through, Registry, Strategy, StrategyContext};

pub fn register(registry: &mut Registry) {
    registry.register(
        "gomod",
        "Caches Go module proxy requests.",
        "gomod:\n  proxy: https://proxy.golang.org\n",
        |ctx, config: GoModConfig| async move {
            let (strategy, router) = GoMod::new(ctx, config)?;
            Ok((strategy as Arc<dyn Strategy>, router))
        },
    );
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoModConfig {
    /// Upstream Go module proxy URL.
    #[serde(default = "default_proxy")]
    pub proxy: String,
}

fn default_proxy() -> String {
    "https://proxy.golang.org".to_string()
}

impl Default for GoModConfig {
    fn default() -> Self {
        Self {
            proxy: default_proxy(),
        }
    }
}

pub struct GoMod {
    ctx: StrategyContext,
    cache: Cache,
    proxy: url::Url,
}

impl Strategy for GoMod {
    fn name(&self) -> String {
        format!("gomod:{}", self.proxy.host_str().unwrap_or("?"))
    }
}

impl GoMod {
    fn new(ctx: StrategyContext, config: GoModConfig) -> Result<(Arc<Self>, Router)> {
        let proxy = url::Url::parse(&config.proxy).context("invalid proxy URL")?;
        let cache = ctx.cache.clone();
        let strategy = Arc::new(Self { ctx, cache, proxy });
        let router = Router::new()
            .route("/gomod/{*path}", get(handle))
            .with_state(Arc::clone(&strategy));
        Ok((strategy, router))
    }
}

async fn handle(
    State(strategy): State<Arc<GoMod>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let mut url = strategy.proxy.clone();
    url.set_path(&path);
    if let Some(query) = &query {
        url.set_query(Some(query));
    }
    debug!(url = %url, "proxying go module request");

    match strategy.ctx.http_client.get(url.as_str()).build() {
        Ok(request) => serve_fetch_through(&strategy.ctx, "gomod", &strategy.cache, request).await,
        Err(err) => {
            tracing::error!(url = %url, error = %err, "failed to build module request");
            (StatusCode::INTERNAL_SERVER_ERROR, "bad module URL").into_response()
        }
    }
}
