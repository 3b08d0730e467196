//! GitHub release asset strategy.
//!
//! Caches `releases/download` assets, injecting a GitHub App token for
//! private repositories when one is configured.  The hermit strategy routes
//! its GitHub-hosted packages here (through a no-op cache on its side) so
//! assets are cached exactly once.

use std::sync::Arc;

use axum::extract::{Path, State};
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
        "github-releases",
        "Caches GitHub release assets, with GitHub App authentication for private repositories.",
        "github-releases: {}\n",
        |ctx, config: GitHubReleasesConfig| async move {
            let (strategy, router) = GitHubReleases::new(ctx, config);
            Ok((strategy as Arc<dyn Strategy>, router))
        },
    );
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubReleasesConfig {}

pub struct GitHubReleases {
    ctx: StrategyContext,
    cache: Cache,
}

impl Strategy for GitHubReleases {
    fn name(&self) -> String {
        "github-releases".to_string()
    }
}

impl GitHubReleases {
    fn new(ctx: StrategyContext, _config: GitHubReleasesConfig) -> (Arc<Self>, Router) {
        let cache = ctx.cache.clone();
        let strategy = Arc::new(Self { ctx, cache });
        let router = Router::new()
            .route("/github.com/{*path}", get(handle))
            .with_state(Arc::clone(&strategy));
        (strategy, router)
    }
}

async fn handle(State(strategy): State<Arc<GitHubReleases>>, Path(path): Path<String>) -> Response {
    serve_release_asset(&strategy.ctx, &strategy.cache, &path).await
}

/// Whether a `{host}/{path}` pair points at a GitHub release asset.
pub(crate) fn is_release_path(host: &str, path: &str) -> bool {
    host == "github.com" && path.contains("/releases/download/")
}

/// Fetch-through a release asset at `https://github.com/{path}` into
/// `cache`, with token injection for the owning organisation.
pub(crate) async fn serve_release_asset(
    ctx: &StrategyContext,
    cache: &Cache,
    path: &str,
) -> Response {
    if !path.contains("/releases/download/") {
        return (StatusCode::NOT_FOUND, "not a release asset path").into_response();
    }

    let url = format!("https://github.com/{path}");
    let mut request = ctx.http_client.get(&url);

    if let Some(provider) = &ctx.token_provider {
        let org = path.split('/').find(|segment| !segment.is_empty());
        if let Some(org) = org {
            if let Some(token) = provider.token_for_org(org).await {
                debug!(org, "authenticating release asset download");
                request = request.header("Authorization", format!("token {token}"));
            }
        }
    }

    match request.build() {
        Ok(request) => serve_fetch_through(ctx, "github-releases", cache, request).await,
        Err(err) => {
            tracing::error!(%url, error = %err, "failed to build release request");
            (StatusCode::INTERNAL_SERVER_ERROR, "bad release URL").into_response()
        }
    }
}
