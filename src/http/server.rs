//! HTTP 诊断服务器

use std::net::SocketAddr;

use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::counter::RequestCounter;
use crate::http::routes;
use crate::infra::ShutdownSignal;

/// 诊断服务器共享状态
#[derive(Clone)]
pub struct HttpServerState {
    pub counter: RequestCounter,
}

/// HTTP 诊断服务器
pub struct DiagnosticsServer {
    state: HttpServerState,
    addr: SocketAddr,
}

impl DiagnosticsServer {
    pub fn new(counter: RequestCounter, addr: SocketAddr) -> Self {
        Self {
            state: HttpServerState { counter },
            addr,
        }
    }

    /// 构建路由
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// 启动服务器，收到关闭信号后优雅退出
    pub async fn start(
        &self,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!("🌐 HTTP 诊断服务器启动在 {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        info!("🌐 HTTP 诊断服务器已停止");
        Ok(())
    }
}

pub(crate) fn build_router(state: HttpServerState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
