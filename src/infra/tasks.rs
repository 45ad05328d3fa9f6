//! 后台任务：统计轮询与空闲调用方清理
//!
//! 两个任务都是 `tokio::time::interval` 循环，收到关闭信号后退出。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::counter::RequestCounter;
use crate::infra::metrics;

/// 关闭信号：发送端 `send(true)` 后所有任务退出
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// 等待关闭；发送端被丢弃也视为关闭
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// 启动统计轮询任务：周期性拉取 `stats()` 并写入 Prometheus
pub fn spawn_stats_poller(
    counter: RequestCounter,
    poll_interval: Duration,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("📊 统计轮询任务已启动（间隔 {:?}）", poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => publish_snapshot(&counter),
                _ = shutdown.wait() => break,
            }
        }
        info!("📊 统计轮询任务已停止");
    })
}

/// 发布一次快照
pub fn publish_snapshot(counter: &RequestCounter) {
    let stats = counter.stats();
    metrics::record_stats(&stats);
    metrics::record_rejected(counter.rejected_total());
    metrics::record_tracked_peers(counter.peer_ledger().len());
    metrics::record_limit(counter.limit());
    debug!(entries = stats.len(), "统计快照已发布");
}

/// 启动空闲调用方清理任务
pub fn spawn_peer_sweeper(
    counter: RequestCounter,
    sweep_interval: Duration,
    mut shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "🧹 空闲调用方清理任务已启动（间隔 {:?}，空闲窗口 {:?}）",
            sweep_interval,
            counter.peer_ledger().idle_window()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = counter.sweep_idle_peers();
                    if removed > 0 {
                        info!("🧹 清理了 {} 个空闲调用方", removed);
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("🧹 空闲调用方清理任务已停止");
    })
}
