//! 调用方连接
//!
//! 一个 peer 即一条传输层连接（如 WebRTC peer connection），只用于诊断。
//! 传输层统计信息都是尽力而为的，任何字段都可能缺失。

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 连接标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// 传输层连接统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// 传输层自身的连接 ID，便于和传输层日志关联
    pub connection_id: Option<String>,
    /// 是否处于已连接状态；未连接时地址不可信
    pub connected: bool,
    /// 本端（服务端）地址
    pub local_address: Option<IpAddr>,
    /// 对端（客户端）地址
    pub remote_address: Option<IpAddr>,
    /// 近似的连接建立时间（候选地址收集时间），并不精确
    pub connect_time: Option<DateTime<Utc>>,
}

/// 传输层连接句柄
pub trait PeerConnection: Send + Sync {
    fn id(&self) -> PeerId;

    /// 读取连接统计；传输层已关闭或不支持时返回 None
    fn connection_stats(&self) -> Option<ConnectionStats> {
        None
    }
}

pub type PeerHandle = Arc<dyn PeerConnection>;

/// 调用方诊断信息，超限日志中以 JSON 输出
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientInformation {
    /// `[sdk 类型];[sdk 版本];[api 版本]`，模块连接带 `module-<name>-` 前缀
    pub client_metadata: String,
    pub connection_id: String,
    pub connect_time: String,
    pub time_since_connect: String,
    pub server_ip: String,
    pub client_ip: String,
    /// 限流 key -> 该调用方的在途请求数（只含非零项）
    pub inflight_requests: BTreeMap<String, i64>,
    /// 限流 key -> 该调用方被拒绝的次数（只含非零项）
    pub rejected_requests: BTreeMap<String, i64>,
}

/// 把时长格式化为 `1h2m3.5s` 形式
pub(crate) fn format_duration(d: chrono::Duration) -> String {
    let total_ms = d.num_milliseconds().max(0);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms % 60_000) as f64 / 1000.0;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}
