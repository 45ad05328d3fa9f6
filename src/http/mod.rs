//! HTTP 诊断服务 - 使用 Axum 暴露请求计数器的状态
//!
//! 路由：
//! - `/metrics` Prometheus 抓取端点
//! - `/stats` 扁平化的统计快照
//! - `/clients` 各调用方的在途与被拒请求
//! - `/health` 存活检查

pub mod routes;
pub mod server;

pub use server::{DiagnosticsServer, HttpServerState};
