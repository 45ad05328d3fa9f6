//! 服务进程：持有计数器，启动后台任务与诊断服务

use std::future::Future;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::counter::RequestCounter;
use crate::http::DiagnosticsServer;
use crate::infra::{self, ShutdownSignal};

pub struct CounterServer {
    config: ServerConfig,
    counter: RequestCounter,
}

impl CounterServer {
    pub fn new(config: ServerConfig) -> Self {
        info!("🔧 初始化请求计数器...");
        let counter = RequestCounter::new(config.counter_options());
        info!("✅ 请求计数器初始化完成（每个资源在途上限 {}）", counter.limit());
        Self { config, counter }
    }

    /// 计数器句柄，注册到 RPC 服务的拦截器链
    pub fn counter(&self) -> RequestCounter {
        self.counter.clone()
    }

    /// 运行直到 Ctrl-C
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("❌ 监听退出信号失败: {}", e);
            }
            info!("🛑 收到退出信号");
        })
        .await
    }

    /// 运行直到 `stop` 完成，然后通知所有任务退出并等待它们结束
    pub async fn run_until(&self, stop: impl Future<Output = ()>) -> Result<()> {
        self.show_config_info();

        let (shutdown_tx, shutdown) = ShutdownSignal::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        if self.config.telemetry.enabled {
            match infra::metrics::init() {
                Ok(()) => info!("✅ Prometheus 指标已初始化"),
                Err(e) => warn!("⚠️ Prometheus 指标初始化失败: {}", e),
            }
            tasks.push(infra::spawn_stats_poller(
                self.counter.clone(),
                self.config.poll_interval(),
                shutdown.clone(),
            ));
        }

        tasks.push(infra::spawn_peer_sweeper(
            self.counter.clone(),
            self.config.peer_sweep_interval(),
            shutdown.clone(),
        ));

        if self.config.http.enabled {
            let addr = self.config.http_addr()?;
            let server = DiagnosticsServer::new(self.counter.clone(), addr);
            let http_shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.start(http_shutdown).await {
                    error!("❌ HTTP 诊断服务器运行失败: {}", e);
                }
            }));
        }

        stop.await;

        // 所有接收端都已退出时 send 会失败，此时无需通知
        let _ = shutdown_tx.send(true);
        for task in tasks {
            task.await.context("后台任务异常退出")?;
        }
        info!("👋 服务已停止");
        Ok(())
    }

    fn show_config_info(&self) {
        info!("📊 服务配置信息:");
        info!("  - 每个资源在途上限: {}", self.counter.limit());
        info!("  - 调用方空闲窗口: {}秒", self.config.limits.peer_idle_window_secs);
        info!("  - 调用方清理间隔: {}秒", self.config.limits.peer_sweep_interval_secs);
        if self.config.telemetry.enabled {
            info!("  - 统计轮询间隔: {}秒", self.config.telemetry.poll_interval_secs);
        } else {
            info!("  - 统计轮询: 禁用");
        }
        if self.config.http.enabled {
            info!("  - 诊断服务: {}:{}", self.config.http.host, self.config.http.port);
        } else {
            info!("  - 诊断服务: 禁用");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_until_stops_cleanly() {
        let mut config = ServerConfig::default();
        config.http.enabled = false;
        config.telemetry.enabled = false;
        config.limits.resource_requests_limit = Some(4);

        let server = CounterServer::new(config);
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            server.run_until(tokio::time::sleep(std::time::Duration::from_millis(20))),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_http_server_binds_ephemeral_port() {
        let mut config = ServerConfig::default();
        config.http.host = "127.0.0.1".to_string();
        config.http.port = 0;
        config.telemetry.enabled = false;

        let server = CounterServer::new(config);
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            server.run_until(tokio::time::sleep(std::time::Duration::from_millis(50))),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
