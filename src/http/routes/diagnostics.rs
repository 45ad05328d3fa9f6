//! 诊断路由：统计快照、调用方信息、存活检查

use std::collections::BTreeMap;

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tracing::debug;

use crate::http::HttpServerState;

pub fn create_route() -> Router<HttpServerState> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/clients", get(list_clients))
        .route("/health", get(health))
}

/// GET /stats：按 key 排序的扁平统计
async fn get_stats(State(state): State<HttpServerState>) -> Json<BTreeMap<String, i64>> {
    let stats: BTreeMap<String, i64> = state.counter.stats().into_iter().collect();
    debug!(entries = stats.len(), "GET /stats");
    Json(stats)
}

/// GET /clients：所有被跟踪调用方的快照
async fn list_clients(State(state): State<HttpServerState>) -> Json<Value> {
    let clients = state.counter.client_information();
    Json(json!({
        "limit": state.counter.limit(),
        "total": clients.len(),
        "clients": clients,
    }))
}

async fn health(State(state): State<HttpServerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "limit": state.counter.limit(),
        "tracked_peers": state.counter.peer_ledger().len(),
        "rejected_total": state.counter.rejected_total(),
    }))
}
