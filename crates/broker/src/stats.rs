//! Shared request counters surfaced by the monitor service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::util::now_ms;

#[derive(Debug, Default)]
struct ToolCounters {
    calls: u64,
    successes: u64,
    failures: u64,
}

/// Process-wide counters. Cheap to bump from any task.
pub struct BrokerStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_connections: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_size: AtomicU64,
    last_index_refresh_ms: AtomicI64,
    /// Per-tool counters; `None` disables tool tracking entirely.
    tools: Option<RwLock<HashMap<String, ToolCounters>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_connections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_index_refresh: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStat {
    pub name: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
}

impl BrokerStats {
    pub fn new(track_tools: bool) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_size: AtomicU64::new(0),
            last_index_refresh_ms: AtomicI64::new(0),
            tools: track_tools.then(|| RwLock::new(HashMap::new())),
        }
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tool_call(&self, tool: &str, success: bool) {
        if let Some(tools) = &self.tools {
            let mut map = tools.write();
            let entry = map.entry(tool.to_string()).or_default();
            entry.calls += 1;
            if success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            });
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cache_size(&self, size: u64) {
        self.cache_size.store(size, Ordering::Relaxed);
    }

    pub fn mark_index_refreshed(&self) {
        self.last_index_refresh_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn tool_tracking_enabled(&self) -> bool {
        self.tools.is_some()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let refreshed = self.last_index_refresh_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_size: self.cache_size.load(Ordering::Relaxed),
            last_index_refresh: (refreshed != 0).then_some(refreshed),
        }
    }

    /// Per-tool counters, busiest first. Empty when tracking is disabled.
    pub fn tool_stats(&self, limit: usize) -> Vec<ToolStat> {
        let Some(tools) = &self.tools else {
            return Vec::new();
        };
        let map = tools.read();
        let mut stats: Vec<ToolStat> = map
            .iter()
            .map(|(name, c)| ToolStat {
                name: name.clone(),
                calls: c.calls,
                successes: c.successes,
                failures: c.failures,
            })
            .collect();
        stats.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.name.cmp(&b.name)));
        stats.truncate(limit);
        stats
    }
}
