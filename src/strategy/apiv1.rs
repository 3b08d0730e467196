//! Introspection API strategy.  Always enabled; reports cache statistics
//! and the namespaces in use.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::cache::{Cache, CacheError};
use crate::strategy::{Registry, Strategy, StrategyContext};

pub fn register(registry: &mut Registry) {
    registry.register(
        "apiv1",
        "Cache introspection API (always enabled).",
        "apiv1: {}\n",
        |ctx, config: ApiV1Config| async move {
            let (strategy, router) = ApiV1::new(ctx, config);
            Ok((strategy as Arc<dyn Strategy>, router))
        },
    );
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiV1Config {}

pub struct ApiV1 {
    cache: Cache,
}

impl Strategy for ApiV1 {
    fn name(&self) -> String {
        "apiv1".to_string()
    }
}

impl ApiV1 {
    fn new(ctx: StrategyContext, _config: ApiV1Config) -> (Arc<Self>, Router) {
        let strategy = Arc::new(Self { cache: ctx.cache });
        let router = Router::new()
            .route("/api/v1/stats", get(handle_stats))
            .route("/api/v1/namespaces", get(handle_namespaces))
            .with_state(Arc::clone(&strategy));
        (strategy, router)
    }
}

async fn handle_stats(State(strategy): State<Arc<ApiV1>>) -> Response {
    match strategy.cache.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(CacheError::StatsUnavailable) => {
            (StatusCode::SERVICE_UNAVAILABLE, "statistics unavailable").into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to compute cache stats");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_namespaces(State(strategy): State<Arc<ApiV1>>) -> Response {
    match strategy.cache.list_namespaces().await {
        Ok(namespaces) => Json(namespaces).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to list namespaces");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
