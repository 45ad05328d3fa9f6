//! GET /metrics - Prometheus 抓取端点

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::HttpServerState;
use crate::infra::tasks::publish_snapshot;

/// GET /metrics：先发布一次最新快照，再返回 Prometheus 文本格式。
/// 未安装 Recorder 时返回 503。
pub async fn metrics_handler(State(state): State<HttpServerState>) -> Response {
    if !crate::infra::metrics::is_initialized() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response();
    }

    publish_snapshot(&state.counter);
    match crate::infra::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}
