//! Artifactory strategy: fetch-through against an Artifactory base URL with
//! optional access-token authentication.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::cache::Cache;
use crate::strategy::{serve_fetch_through, Registry, Strategy, StrategyContext};

pub fn register(registry: &mut Registry) {
    registry.register(
        "artifactory",
        "Caches Artifactory repository downloads.",
        "artifactory:\n  url: https://artifactory.example.com/artifactory\n  token_env: ARTIFACTORY_TOKEN\n",
        |ctx, config: ArtifactoryConfig| async move {
            let (strategy, router) = Artifactory::new(ctx, config)?;
            Ok((strategy as Arc<dyn Strategy>, router))
        },
    );
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactoryConfig {
    /// Artifactory base URL.
    pub url: String,
    /// Environment variable holding an access token, if authentication is
    /// required.
    #[serde(default)]
    pub token_env: Option<String>,
}

pub struct Artifactory {
    ctx: StrategyContext,
    cache: Cache,
    base: url::Url,
    token: Option<String>,
}

impl Strategy for Artifactory {
    fn name(&self) -> String {
        format!("artifactory:{}", self.base.host_str().unwrap_or("?"))
    }
}

impl Artifactory {
    fn new(ctx: StrategyContext, config: ArtifactoryConfig) -> Result<(Arc<Self>, Router)> {
        let base = url::Url::parse(&config.url).context("invalid artifactory URL")?;
        let token = config
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.is_empty());

        let cache = ctx.cache.clone();
        let strategy = Arc::new(Self {
            ctx,
            cache,
            base,
            token,
        });
        let router = Router::new()
            .route("/artifactory/{*path}", get(handle))
            .with_state(Arc::clone(&strategy));
        Ok((strategy, router))
    }
}

async fn handle(
    State(strategy): State<Arc<Artifactory>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let mut url = strategy.base.clone();
    let joined = format!("{}/{}", url.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    if let Some(query) = &query {
        url.set_query(Some(query));
    }

    let mut request = strategy.ctx.http_client.get(url.as_str());
    if let Some(token) = &strategy.token {
        request = request.bearer_auth(token);
    }

    match request.build() {
        Ok(request) => {
            serve_fetch_through(&strategy.ctx, "artifactory", &strategy.cache, request).await
        }
        Err(err) => {
            tracing::error!(url = %url, error = %err, "failed to build artifactory request");
            (StatusCode::INTERNAL_SERVER_ERROR, "bad artifactory URL").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::tests::test_context;

    #[test]
    fn invalid_url_is_rejected() {
        let ctx = test_context();
        assert!(Artifactory::new(
            ctx,
            ArtifactoryConfig {
                url: "definitely not a url".to_string(),
                token_env: None,
            },
        )
        .is_err());
    }

    #[test]
    fn name_includes_host() {
        let ctx = test_context();
        let (strategy, _router) = Artifactory::new(
            ctx,
            ArtifactoryConfig {
                url: "https://artifactory.example.com/artifactory".to_string(),
                token_env: None,
            },
        )
        .unwrap();
        assert_eq!(strategy.name(), "artifactory:artifactory.example.com");
    }
}
