//! 用量与统计聚合：有界请求日志环 + 总量/按模型/按天计数。

use chrono::{TimeZone, Utc};
use std::collections::VecDeque;

use crate::types::{AggregateStats, RequestLogEntry};

const MAX_LOG_ENTRIES: usize = 2000;

#[derive(Debug, Default)]
pub struct StatsStore {
    logs: VecDeque<RequestLogEntry>,
    aggregate: AggregateStats,
}

fn day_key(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d")
        .to_string()
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(logs: Vec<RequestLogEntry>, aggregate: AggregateStats) -> Self {
        let mut deque = VecDeque::from(logs);
        while deque.len() > MAX_LOG_ENTRIES {
            deque.pop_front();
        }
        Self {
            logs: deque,
            aggregate,
        }
    }

    /// 记录一条终态请求：日志入环（满则逐出最旧）+ 聚合计数同步更新。
    /// keep_log=false 时只更新聚合，不留明细（logRequests 关闭）。
    pub fn record(&mut self, entry: RequestLogEntry, keep_log: bool) {
        self.aggregate.total_requests += 1;
        if entry.success {
            self.aggregate.success_requests += 1;
        } else {
            self.aggregate.failed_requests += 1;
        }
        self.aggregate.total_input_tokens += entry.input_tokens;
        self.aggregate.total_output_tokens += entry.output_tokens;
        self.aggregate.total_credits += entry.credits;

        if let Some(model) = &entry.model {
            let bucket = self.aggregate.by_model.entry(model.clone()).or_default();
            bucket.requests += 1;
            bucket.input_tokens += entry.input_tokens;
            bucket.output_tokens += entry.output_tokens;
            bucket.credits += entry.credits;
        }

        let daily = self
            .aggregate
            .daily
            .entry(day_key(entry.timestamp))
            .or_default();
        daily.requests += 1;
        daily.input_tokens += entry.input_tokens;
        daily.output_tokens += entry.output_tokens;
        daily.credits += entry.credits;

        if !keep_log {
            return;
        }
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);
    }

    /// 最新在前，最多 limit 条。
    pub fn get_logs(&self, limit: usize) -> Vec<RequestLogEntry> {
        self.logs.iter().rev().take(limit).cloned().collect()
    }

    pub fn aggregate(&self) -> &AggregateStats {
        &self.aggregate
    }

    pub fn logs_snapshot(&self) -> Vec<RequestLogEntry> {
        self.logs.iter().cloned().collect()
    }

    /// 只清日志环，聚合计数不动。
    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }

    /// 聚合计数归零，日志环不动。
    pub fn reset(&mut self) {
        self.aggregate = AggregateStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(timestamp: i64, model: &str, success: bool) -> RequestLogEntry {
        RequestLogEntry {
            timestamp,
            path: "/v1/chat/completions".to_string(),
            method: "POST".to_string(),
            model: Some(model.to_string()),
            account_id: Some("a".to_string()),
            account_email: None,
            api_key_id: None,
            input_tokens: 10,
            output_tokens: 20,
            credits: 0.5,
            response_time_ms: 100,
            status: if success { 200 } else { 502 },
            success,
            error: None,
        }
    }

    #[test]
    fn record_updates_all_buckets() {
        let mut store = StatsStore::new();
        store.record(entry(1_700_000_000, "claude-sonnet-4.5", true), true);
        store.record(entry(1_700_000_001, "claude-sonnet-4.5", false), true);

        let agg = store.aggregate();
        assert_eq!(agg.total_requests, 2);
        assert_eq!(agg.success_requests, 1);
        assert_eq!(agg.failed_requests, 1);
        assert_eq!(agg.total_input_tokens, 20);
        assert_eq!(agg.total_output_tokens, 40);
        assert!((agg.total_credits - 1.0).abs() < 1e-9);

        let model = agg.by_model.get("claude-sonnet-4.5").expect("model bucket");
        assert_eq!(model.requests, 2);

        let daily = agg.daily.get("2023-11-14").expect("daily bucket");
        assert_eq!(daily.requests, 2);
    }

    #[test]
    fn log_ring_evicts_oldest_at_capacity() {
        let mut store = StatsStore::new();
        for i in 0..(MAX_LOG_ENTRIES as i64 + 10) {
            store.record(entry(i, "m", true), true);
        }
        let logs = store.logs_snapshot();
        assert_eq!(logs.len(), MAX_LOG_ENTRIES);
        // 最旧的 10 条被逐出。
        assert_eq!(logs[0].timestamp, 10);
    }

    #[test]
    fn get_logs_returns_newest_first() {
        let mut store = StatsStore::new();
        for i in 0..5 {
            store.record(entry(i, "m", true), true);
        }
        let logs = store.get_logs(3);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].timestamp, 4);
        assert_eq!(logs[2].timestamp, 2);
    }

    #[test]
    fn clear_logs_and_reset_are_independent() {
        let mut store = StatsStore::new();
        store.record(entry(1, "m", true), true);

        store.clear_logs();
        assert!(store.logs_snapshot().is_empty());
        assert_eq!(store.aggregate().total_requests, 1);

        store.record(entry(2, "m", true), true);
        store.reset();
        assert_eq!(store.aggregate().total_requests, 0);
        assert_eq!(store.logs_snapshot().len(), 1);
    }
}
