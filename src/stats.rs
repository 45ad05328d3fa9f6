//! 请求统计
//!
//! 每个统计 key（`<resource>.<Service>/<Method>` 或 `<Service>/<Method>`）一行，
//! 首次出现时创建，进程生命周期内不删除。各字段独立原子，不保证跨字段一致。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{CounterError, Result};

/// 单个统计 key 的计数
#[derive(Debug, Default)]
pub struct RequestStats {
    /// 开始的调用数
    count: AtomicI64,
    /// 以错误结束的调用数
    error_count: AtomicI64,
    /// 累计耗时（毫秒）
    time_spent_ms: AtomicI64,
    /// 累计响应字节数
    data_sent_bytes: AtomicI64,
}

impl RequestStats {
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> i64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn time_spent_ms(&self) -> i64 {
        self.time_spent_ms.load(Ordering::Relaxed)
    }

    pub fn data_sent_bytes(&self) -> i64 {
        self.data_sent_bytes.load(Ordering::Relaxed)
    }
}

/// 统计表
#[derive(Debug, Default)]
pub struct StatsLedger {
    rows: DashMap<String, Arc<RequestStats>>,
}

impl StatsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调用开始：计数加一，必要时创建该行
    pub fn record_start(&self, key: &str) {
        if let Some(stats) = self.rows.get(key) {
            stats.count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // 与其它首次请求竞争插入时，由 entry 保证只有一行
        self.rows
            .entry(key.to_string())
            .or_default()
            .count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// 调用结束：累加耗时与字节数，失败时错误数加一
    ///
    /// 该行必须已由 [`record_start`](Self::record_start) 创建。
    pub fn record_finish(
        &self,
        key: &str,
        time_spent: Duration,
        data_sent: usize,
        was_error: bool,
    ) -> Result<()> {
        let Some(stats) = self.rows.get(key) else {
            return Err(CounterError::MissingStatsRow(key.to_string()).raise());
        };
        let millis = i64::try_from(time_spent.as_millis()).unwrap_or(i64::MAX);
        stats.time_spent_ms.fetch_add(millis, Ordering::Relaxed);
        stats
            .data_sent_bytes
            .fetch_add(i64::try_from(data_sent).unwrap_or(i64::MAX), Ordering::Relaxed);
        if was_error {
            stats.error_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<RequestStats>> {
        self.rows.get(key).map(|stats| stats.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 展开为导出格式：`<key>`、`<key>.errorCnt`、`<key>.timeSpent`、`<key>.dataSentBytes`
    pub fn flatten_into(&self, out: &mut HashMap<String, i64>) {
        for row in self.rows.iter() {
            let key = row.key();
            let stats = row.value();
            out.insert(key.clone(), stats.count());
            out.insert(format!("{}.errorCnt", key), stats.error_count());
            out.insert(format!("{}.timeSpent", key), stats.time_spent_ms());
            out.insert(format!("{}.dataSentBytes", key), stats.data_sent_bytes());
        }
    }
}
