//! HTTP 路由模块

pub mod diagnostics;
pub mod metrics;

use axum::{routing::get, Router};

use crate::http::HttpServerState;

/// 创建所有路由
pub fn create_routes() -> Router<HttpServerState> {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .merge(diagnostics::create_route())
}
