//! 按资源的在途请求限流
//!
//! 每个限流 key 对应一个原子计数器，首次访问时创建，之后永不删除。
//! 热路径（加一/减一）只做原子操作；map 本身用 DashMap，先 `get` 再
//! `entry().or_insert_with()`，并发首次访问最终收敛到同一个计数器。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{CounterError, Result};

/// 覆盖默认上限的环境变量
pub const RESOURCE_REQUESTS_LIMIT_ENV: &str = "VIAM_RESOURCE_REQUESTS_LIMIT";

/// 默认上限
pub const DEFAULT_RESOURCE_REQUESTS_LIMIT: i64 = 100;

static ENV_LIMIT: OnceLock<Option<i64>> = OnceLock::new();

/// 解析上限取值，非正数或无法解析返回 None
pub fn parse_limit(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|limit| *limit > 0)
}

/// 环境变量中的上限，进程内只读取一次
pub fn env_limit() -> Option<i64> {
    *ENV_LIMIT.get_or_init(|| {
        let raw = std::env::var(RESOURCE_REQUESTS_LIMIT_ENV).ok()?;
        let limit = parse_limit(&raw);
        if limit.is_none() {
            warn!(
                "{} 取值无效: {:?}，使用默认值 {}",
                RESOURCE_REQUESTS_LIMIT_ENV, raw, DEFAULT_RESOURCE_REQUESTS_LIMIT
            );
        }
        limit
    })
}

/// 最终生效的上限：环境变量 > 配置 > 默认值
pub fn resolve_limit(configured: Option<i64>) -> i64 {
    resolve_limit_with(env_limit(), configured)
}

fn resolve_limit_with(env: Option<i64>, configured: Option<i64>) -> i64 {
    env.or(configured.filter(|limit| *limit > 0))
        .unwrap_or(DEFAULT_RESOURCE_REQUESTS_LIMIT)
}

/// 在途请求计数器集合
#[derive(Debug)]
pub struct InFlightLimiter {
    limit: i64,
    counters: DashMap<String, Arc<AtomicI64>>,
}

impl InFlightLimiter {
    pub fn new(limit: i64) -> Self {
        Self {
            limit: limit.max(1),
            counters: DashMap::new(),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// 获取（必要时创建）某个 key 的计数器
    fn counter(&self, key: &str) -> Arc<AtomicI64> {
        if let Some(counter) = self.counters.get(key) {
            return counter.clone();
        }
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    /// 尝试占用一个名额。超过上限时回退并返回 false。
    pub fn try_admit(&self, key: &str) -> bool {
        let counter = self.counter(key);
        let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.limit {
            counter.fetch_sub(1, Ordering::AcqRel);
            debug!(key, count, limit = self.limit, "admission rejected");
            return false;
        }
        true
    }

    /// 归还名额
    ///
    /// 对未占用的 key 归还属于程序错误：计数器恢复原值并返回错误。
    /// 从未占用过的 key 不会因此新建计数器。
    pub fn release(&self, key: &str) -> Result<()> {
        let Some(counter) = self.counters.get(key).map(|counter| counter.clone()) else {
            return Err(CounterError::UnbalancedRelease(key.to_string()).raise());
        };
        if counter.fetch_sub(1, Ordering::AcqRel) <= 0 {
            counter.fetch_add(1, Ordering::AcqRel);
            return Err(CounterError::UnbalancedRelease(key.to_string()).raise());
        }
        Ok(())
    }

    /// 当前在途数；未出现过的 key 为 0
    pub fn in_flight(&self, key: &str) -> i64 {
        self.counters
            .get(key)
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// 所有 key 的当前在途数（逐个读取，不保证跨 key 一致）
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Acquire)))
            .collect()
    }
}
