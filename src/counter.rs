//! 请求计数器
//!
//! 每个服务实例构造一个 [`RequestCounter`]，注册到拦截器链中，统计并限制
//! 来自外部客户端和内部模块的每一个一元/流式请求。克隆开销很小，所有克隆共享状态。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::admission::{resolve_limit, InFlightLimiter};
use crate::context::CallContext;
use crate::error::{RequestLimitExceededError, REQ_LIMIT_EXCEEDED_URL};
use crate::ledger::{PeerKey, PeerLedger, DEFAULT_PEER_IDLE_WINDOW};
use crate::peer::{ClientInformation, PeerHandle};
use crate::stats::StatsLedger;

/// 计数器配置
#[derive(Debug, Clone)]
pub struct RequestCounterOptions {
    /// 配置文件中的上限；环境变量优先
    pub limit: Option<i64>,
    /// 调用方空闲清理窗口
    pub peer_idle_window: Duration,
}

impl Default for RequestCounterOptions {
    fn default() -> Self {
        Self {
            limit: None,
            peer_idle_window: DEFAULT_PEER_IDLE_WINDOW,
        }
    }
}

struct Inner {
    /// 限流 key -> 在途请求数。每个资源最多 `limit` 个并发请求，不区分方法：
    /// 例如 `motor-foo` 可以同时有 50 个 `IsPowered` 和 50 个 `GoFor`。
    limiter: InFlightLimiter,
    /// 统计 key -> 调用统计，例如 `motor-foo.MotorService/IsPowered`
    stats: StatsLedger,
    /// 超限时输出“哪个客户端在刷这个资源”的诊断信息
    peers: PeerLedger,
    rejected_total: AtomicU64,
}

/// 请求计数器
#[derive(Clone)]
pub struct RequestCounter {
    inner: Arc<Inner>,
}

impl Default for RequestCounter {
    fn default() -> Self {
        Self::new(RequestCounterOptions::default())
    }
}

impl RequestCounter {
    pub fn new(options: RequestCounterOptions) -> Self {
        Self::with_limit(resolve_limit(options.limit), options.peer_idle_window)
    }

    /// 使用确定的上限构造，不读取环境变量
    pub fn with_limit(limit: i64, peer_idle_window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                limiter: InFlightLimiter::new(limit),
                stats: StatsLedger::new(),
                peers: PeerLedger::new(peer_idle_window),
                rejected_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn limit(&self) -> i64 {
        self.inner.limiter.limit()
    }

    pub fn in_flight(&self, limit_key: &str) -> i64 {
        self.inner.limiter.in_flight(limit_key)
    }

    pub fn rejected_total(&self) -> u64 {
        self.inner.rejected_total.load(Ordering::Relaxed)
    }

    pub fn stats_ledger(&self) -> &StatsLedger {
        &self.inner.stats
    }

    pub fn peer_ledger(&self) -> &PeerLedger {
        &self.inner.peers
    }

    /// 统计快照，供遥测采集周期性拉取
    ///
    /// 每个统计 key 展开为 `<key>`、`<key>.errorCnt`、`<key>.timeSpent`、
    /// `<key>.dataSentBytes`，每个限流 key 输出 `<key>.inFlightRequests`。
    pub fn stats(&self) -> HashMap<String, i64> {
        let mut out = HashMap::new();
        self.inner.stats.flatten_into(&mut out);
        for (key, in_flight) in self.inner.limiter.snapshot() {
            out.insert(format!("{}.inFlightRequests", key), in_flight);
        }
        out
    }

    /// 首次见到某连接时记录客户端元数据
    pub(crate) fn observe_peer(&self, ctx: &CallContext) {
        if let Some(peer) = &ctx.peer {
            self.inner
                .peers
                .set_client_metadata(peer.id(), || ctx.client_metadata());
        }
    }

    /// 占用一个名额；被拒绝时记录诊断日志并返回错误
    pub(crate) fn admit(
        &self,
        method: &str,
        limit_key: &str,
        peer: Option<&PeerHandle>,
    ) -> Result<AdmissionGuard, RequestLimitExceededError> {
        if !self.inner.limiter.try_admit(limit_key) {
            self.inner.peers.record_rejected(peer, limit_key);
            self.inner.rejected_total.fetch_add(1, Ordering::Relaxed);
            let caller_in_flight = self.log_request_limit_exceeded(method, limit_key, peer);
            return Err(RequestLimitExceededError {
                resource: limit_key.to_string(),
                limit: self.limit(),
                caller_in_flight,
            });
        }
        self.inner.peers.record_admitted(peer, limit_key);
        Ok(AdmissionGuard {
            counter: self.clone(),
            limit_key: limit_key.to_string(),
            peer: peer.cloned(),
        })
    }

    /// 记录超限日志，返回冒犯方在该资源上的在途数
    ///
    /// 日志包含调用的方法、资源、冒犯方与其它所有被跟踪调用方的 [`ClientInformation`]。
    fn log_request_limit_exceeded(
        &self,
        method: &str,
        resource: &str,
        peer: Option<&PeerHandle>,
    ) -> i64 {
        let offending = self.inner.peers.snapshot(peer);
        let others = self.inner.peers.snapshot_others(PeerKey::of(peer));

        let offending_json = serde_json::to_string(&offending).unwrap_or_else(|e| {
            error!("Failed to marshal client information {:?}: {}", offending, e);
            "null".to_string()
        });
        let others_json = serde_json::to_string(&others).unwrap_or_else(|e| {
            error!("Failed to marshal client information: {}", e);
            "[]".to_string()
        });

        warn!(
            method,
            resource,
            offending_client_information = %offending_json,
            all_other_client_information = %others_json,
            "Request limit exceeded for resource. See {} for troubleshooting steps.",
            REQ_LIMIT_EXCEEDED_URL
        );

        offending.inflight_requests.get(resource).copied().unwrap_or(0)
    }

    /// 所有被跟踪调用方的诊断信息
    pub fn client_information(&self) -> Vec<ClientInformation> {
        self.inner.peers.snapshot_all()
    }

    /// 清理空闲调用方，返回清理数量
    pub fn sweep_idle_peers(&self) -> usize {
        self.inner.peers.sweep()
    }
}

/// 已占用的名额，drop 时归还（包括 handler 出错、panic、调用被取消）
#[must_use = "dropping the guard releases the admission slot immediately"]
pub struct AdmissionGuard {
    counter: RequestCounter,
    limit_key: String,
    peer: Option<PeerHandle>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        // 错误已在内部记录
        let _ = self.counter.inner.limiter.release(&self.limit_key);
        let _ = self
            .counter
            .inner
            .peers
            .record_released(self.peer.as_ref(), &self.limit_key);
    }
}
