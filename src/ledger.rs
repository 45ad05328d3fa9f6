//! 按调用方的诊断账本
//!
//! 记录每个连接在每个限流 key 上的在途数与被拒次数，以及连接的客户端元数据。
//! 只在请求被拒绝时用来定位“是谁把资源打满了”，不参与准入判断。
//!
//! 为了控制内存，空闲连接会被清理：在途数为零且空闲超过窗口期的连接在生成快照
//! 或后台清扫时移除。清理通过 `remove_if` 在分片写锁内复核在途数，而计数的增加
//! 总是在持有同一分片锁（读或写）时进行，所以不会删掉一个刚刚变为活跃的连接。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{CounterError, Result};
use crate::peer::{format_duration, ClientInformation, PeerHandle, PeerId};

/// 默认空闲窗口
pub const DEFAULT_PEER_IDLE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// 没有可寻址连接（如模块之间的调用）时的连接 ID
pub const NO_PEER_CONNECTION_ID: &str = "no-peer";

/// 账本中的调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Peer(PeerId),
    NoPeer,
}

impl PeerKey {
    pub fn of(peer: Option<&PeerHandle>) -> Self {
        match peer {
            Some(peer) => PeerKey::Peer(peer.id()),
            None => PeerKey::NoPeer,
        }
    }
}

#[derive(Debug, Default)]
struct PeerCounters {
    in_flight: AtomicI64,
    rejected: AtomicI64,
}

struct PeerEntry {
    peer: Option<PeerHandle>,
    first_seen: DateTime<Utc>,
    requests: DashMap<String, Arc<PeerCounters>>,
}

impl PeerEntry {
    fn new(peer: Option<PeerHandle>) -> Self {
        Self {
            peer,
            first_seen: Utc::now(),
            requests: DashMap::new(),
        }
    }

    fn counters(&self, key: &str) -> Arc<PeerCounters> {
        if let Some(counters) = self.requests.get(key) {
            return counters.clone();
        }
        self.requests.entry(key.to_string()).or_default().clone()
    }

    fn total_in_flight(&self) -> i64 {
        self.requests
            .iter()
            .map(|entry| entry.value().in_flight.load(Ordering::Acquire))
            .sum()
    }

    /// 连接建立时间：优先取传输层统计，没有时取首次出现时间
    fn connected_since(&self) -> DateTime<Utc> {
        self.peer
            .as_ref()
            .and_then(|peer| peer.connection_stats())
            .and_then(|stats| stats.connect_time)
            .unwrap_or(self.first_seen)
    }

    fn is_idle(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.total_in_flight() == 0 && now - self.connected_since() > to_chrono(window)
    }
}

#[derive(Debug, Clone)]
struct CachedMetadata {
    value: String,
    first_seen: DateTime<Utc>,
}

/// 诊断账本
pub struct PeerLedger {
    peers: DashMap<PeerKey, PeerEntry>,
    client_metadata: DashMap<PeerId, CachedMetadata>,
    idle_window: Duration,
}

impl Default for PeerLedger {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_IDLE_WINDOW)
    }
}

impl PeerLedger {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            client_metadata: DashMap::new(),
            idle_window,
        }
    }

    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// 在持有该调用方分片锁期间执行 `f`，必要时创建条目
    fn with_entry<R>(&self, peer: Option<&PeerHandle>, f: impl FnOnce(&PeerEntry) -> R) -> R {
        let key = PeerKey::of(peer);
        if let Some(entry) = self.peers.get(&key) {
            return f(&entry);
        }
        let entry = self
            .peers
            .entry(key)
            .or_insert_with(|| PeerEntry::new(peer.cloned()));
        f(&entry)
    }

    pub fn record_admitted(&self, peer: Option<&PeerHandle>, key: &str) {
        self.with_entry(peer, |entry| {
            entry.counters(key).in_flight.fetch_add(1, Ordering::AcqRel);
        });
    }

    pub fn record_rejected(&self, peer: Option<&PeerHandle>, key: &str) {
        self.with_entry(peer, |entry| {
            entry.counters(key).rejected.fetch_add(1, Ordering::AcqRel);
        });
    }

    /// 归还在途数。在途数大于零的条目不会被清理，因此条目必然存在。
    pub fn record_released(&self, peer: Option<&PeerHandle>, key: &str) -> Result<()> {
        let peer_key = PeerKey::of(peer);
        let released = self.peers.get(&peer_key).and_then(|entry| {
            let counters = entry.requests.get(key)?.clone();
            if counters.in_flight.fetch_sub(1, Ordering::AcqRel) <= 0 {
                counters.in_flight.fetch_add(1, Ordering::AcqRel);
                return None;
            }
            Some(())
        });
        released.ok_or_else(|| CounterError::UnbalancedRelease(format!("{:?}/{}", peer_key, key)).raise())
    }

    /// 该调用方在某个 key 上的在途数
    pub fn in_flight(&self, peer: Option<&PeerHandle>, key: &str) -> i64 {
        self.peers
            .get(&PeerKey::of(peer))
            .and_then(|entry| {
                entry
                    .requests
                    .get(key)
                    .map(|counters| counters.in_flight.load(Ordering::Acquire))
            })
            .unwrap_or(0)
    }

    /// 首次见到某连接时记录其客户端元数据；连接存续期间视为不变
    pub fn set_client_metadata(&self, peer: PeerId, harvest: impl FnOnce() -> String) {
        if self.client_metadata.contains_key(&peer) {
            return;
        }
        self.client_metadata
            .entry(peer)
            .or_insert_with(|| CachedMetadata {
                value: harvest(),
                first_seen: Utc::now(),
            });
    }

    pub fn client_metadata(&self, peer: PeerId) -> Option<String> {
        self.client_metadata.get(&peer).map(|m| m.value.clone())
    }

    pub fn tracked_peers(&self) -> Vec<PeerKey> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// 生成某调用方的诊断快照；调用方空闲超过窗口期时顺带清理
    pub fn snapshot(&self, peer: Option<&PeerHandle>) -> ClientInformation {
        self.snapshot_key(PeerKey::of(peer), peer.cloned(), Utc::now())
            .unwrap_or_else(|| self.detached_information(peer, Utc::now()))
    }

    /// 除 `exclude` 外所有被跟踪调用方的快照
    pub fn snapshot_others(&self, exclude: PeerKey) -> Vec<ClientInformation> {
        let now = Utc::now();
        // 先收集 key：生成快照时可能删除条目，不能在遍历期间持有分片锁
        self.tracked_peers()
            .into_iter()
            .filter(|key| *key != exclude)
            .filter_map(|key| self.snapshot_key(key, None, now))
            .collect()
    }

    /// 所有被跟踪调用方的快照
    pub fn snapshot_all(&self) -> Vec<ClientInformation> {
        let now = Utc::now();
        self.tracked_peers()
            .into_iter()
            .filter_map(|key| self.snapshot_key(key, None, now))
            .collect()
    }

    fn snapshot_key(
        &self,
        key: PeerKey,
        peer: Option<PeerHandle>,
        now: DateTime<Utc>,
    ) -> Option<ClientInformation> {
        let (info, idle) = {
            let entry = self.peers.get(&key)?;
            let peer = peer.or_else(|| entry.peer.clone());
            let mut info = self.detached_information(peer.as_ref(), now);
            if info.connect_time.is_empty() && peer.is_none() {
                info.connect_time = entry.first_seen.to_string();
                info.time_since_connect = format_duration(now - entry.first_seen);
            }
            for counters in entry.requests.iter() {
                let in_flight = counters.value().in_flight.load(Ordering::Acquire);
                if in_flight > 0 {
                    info.inflight_requests.insert(counters.key().clone(), in_flight);
                }
                let rejected = counters.value().rejected.load(Ordering::Acquire);
                if rejected > 0 {
                    info.rejected_requests.insert(counters.key().clone(), rejected);
                }
            }
            (info, entry.is_idle(now, self.idle_window))
        };

        if idle {
            self.prune(key, now);
        }
        Some(info)
    }

    /// 不依赖账本条目的部分：元数据与传输层统计
    fn detached_information(&self, peer: Option<&PeerHandle>, now: DateTime<Utc>) -> ClientInformation {
        let mut info = ClientInformation::default();
        let Some(peer) = peer else {
            info.connection_id = NO_PEER_CONNECTION_ID.to_string();
            return info;
        };

        if let Some(metadata) = self.client_metadata(peer.id()) {
            info.client_metadata = metadata;
        }

        // 传输层统计可能缺失或不完整，缺什么就省略什么
        if let Some(stats) = peer.connection_stats() {
            if let Some(connection_id) = stats.connection_id {
                info.connection_id = connection_id;
            }
            if stats.connected {
                if let Some(remote) = stats.remote_address {
                    info.client_ip = remote.to_string();
                }
                if let Some(local) = stats.local_address {
                    info.server_ip = local.to_string();
                }
            }
            if let Some(connect_time) = stats.connect_time {
                info.connect_time = connect_time.to_string();
                info.time_since_connect = format_duration(now - connect_time);
            }
        }
        info
    }

    /// 在写锁内复核后删除；元数据在同一把锁内一并删除
    fn prune(&self, key: PeerKey, now: DateTime<Utc>) -> bool {
        let removed = self
            .peers
            .remove_if(&key, |_, entry| {
                if !entry.is_idle(now, self.idle_window) {
                    return false;
                }
                if let PeerKey::Peer(id) = key {
                    self.client_metadata.remove(&id);
                }
                true
            })
            .is_some();
        if removed {
            debug!(peer = ?key, "pruned idle peer from request ledger");
        }
        removed
    }

    /// 后台清扫：清理所有空闲调用方，以及早已不在账本中的元数据缓存
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub(crate) fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let pruned = self
            .tracked_peers()
            .into_iter()
            .filter(|key| self.prune(*key, now))
            .count();

        let window = to_chrono(self.idle_window);
        let stale: Vec<PeerId> = self
            .client_metadata
            .iter()
            .filter(|m| now - m.value().first_seen > window)
            .map(|m| *m.key())
            .collect();
        for id in stale {
            // 锁顺序与 prune 一致：先账本分片，后元数据
            if let Entry::Vacant(_vacant) = self.peers.entry(PeerKey::Peer(id)) {
                self.client_metadata.remove(&id);
            }
        }
        pruned
    }
}

fn to_chrono(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::max_value())
}
