//! Prometheus 指标：把请求计数器的统计快照发布为 gauge
//!
//! 通过 `init()` 安装全局 Recorder，通过 HTTP GET `/metrics` 暴露抓取端点。
//! 计数器本身不推送指标，由后台任务周期性拉取 `stats()` 后写入。

use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const GAUGE_REQUEST_STAT: &str = "request_counter_stat";
const COUNTER_REJECTED: &str = "request_counter_rejected_total";
const GAUGE_TRACKED_PEERS: &str = "request_counter_tracked_peers";
const GAUGE_LIMIT: &str = "request_counter_limit";

/// 初始化 Prometheus 指标（安装全局 Recorder）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 是否已初始化（可供 /metrics 使用）
pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// 渲染当前指标为 Prometheus 文本格式，供 GET /metrics 使用。
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 发布统计快照：每个条目一个 gauge，key 作为标签
pub fn record_stats(stats: &HashMap<String, i64>) {
    for (key, value) in stats {
        metrics::gauge!(GAUGE_REQUEST_STAT, "key" => key.clone()).set(*value as f64);
    }
}

/// 累计拒绝数（Counter）。
pub fn record_rejected(total: u64) {
    metrics::counter!(COUNTER_REJECTED).absolute(total);
}

/// 诊断账本中跟踪的调用方数量（Gauge）。
pub fn record_tracked_peers(count: usize) {
    metrics::gauge!(GAUGE_TRACKED_PEERS).set(count as f64);
}

/// 生效的并发上限（Gauge）。
pub fn record_limit(limit: i64) {
    metrics::gauge!(GAUGE_LIMIT).set(limit as f64);
}
