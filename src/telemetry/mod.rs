//! 遥测模块：汇总闸门、熔断器与会话池的运行指标，并输出到可插拔的指标接收端。
//!
//! Metrics snapshots and sinks.
//!
//! Every guard primitive exposes a read-only snapshot. [`MetricsSnapshot`]
//! bundles them for export; where they go is up to the application.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`MetricsSnapshot`] | Serializable aggregate of gate, breaker and pool stats |
//! | [`MetricsSink`] | Trait for metrics destinations |
//! | [`LogMetricsSink`] | Emits one `tracing` event per component |
//! | [`InMemoryMetricsSink`] | Bounded in-memory sink for testing |

use crate::pool::PoolStats;
use crate::resilience::admission::GateStats;
use crate::resilience::circuit_breaker::{BreakerSnapshot, BreakerState};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub gates: Vec<GateStats>,
    pub breakers: Vec<BreakerSnapshot>,
    pub pools: Vec<PoolStats>,
}

impl MetricsSnapshot {
    pub fn with_pool(mut self, pool: PoolStats) -> Self {
        self.pools.push(pool);
        self
    }

    /// Names of breakers not currently closed.
    pub fn tripped_breakers(&self) -> Vec<&str> {
        self.breakers
            .iter()
            .filter(|b| b.state != BreakerState::Closed)
            .map(|b| b.name.as_str())
            .collect()
    }

    pub fn gate(&self, name: &str) -> Option<&GateStats> {
        self.gates.iter().find(|g| g.name == name)
    }

    pub fn breaker(&self, name: &str) -> Option<&BreakerSnapshot> {
        self.breakers.iter().find(|b| b.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, snapshot: &MetricsSnapshot) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink that writes snapshots to the tracing subscriber.
pub struct LogMetricsSink {
    target_label: String,
}

impl LogMetricsSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            target_label: label.into(),
        }
    }
}

impl Default for LogMetricsSink {
    fn default() -> Self {
        Self::new("foto_guard")
    }
}

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn record(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        for g in &snapshot.gates {
            info!(
                label = %self.target_label,
                gate = %g.name,
                total_requests = g.total_requests,
                requests_throttled = g.requests_throttled,
                throttle_rate = g.throttle_rate(),
                avg_wait_ms = g.avg_wait_ms(),
                slots_in_use = g.slots_in_use(),
                "gate metrics"
            );
        }
        for b in &snapshot.breakers {
            if b.state == BreakerState::Closed {
                info!(
                    label = %self.target_label,
                    breaker = %b.name,
                    state = %b.state,
                    total_requests = b.total_requests,
                    total_failures = b.total_failures,
                    "breaker metrics"
                );
            } else {
                warn!(
                    label = %self.target_label,
                    breaker = %b.name,
                    state = %b.state,
                    current_timeout_ms = b.current_timeout_ms,
                    open_remaining_ms = b.open_remaining_ms,
                    total_failures = b.total_failures,
                    "breaker metrics"
                );
            }
        }
        for p in &snapshot.pools {
            info!(
                label = %self.target_label,
                pool = %p.name,
                size = p.size,
                max_entries = p.max_entries,
                hit_rate = p.hit_rate(),
                evicted = p.sessions_evicted,
                expired = p.sessions_expired,
                "pool metrics"
            );
        }
        Ok(())
    }
}

/// In-memory sink for testing. Keeps the most recent `max` snapshots.
pub struct InMemoryMetricsSink {
    snapshots: RwLock<Vec<MetricsSnapshot>>,
    max_snapshots: usize,
}

impl InMemoryMetricsSink {
    pub fn new(max: usize) -> Self {
        Self {
            snapshots: RwLock::new(Vec::new()),
            max_snapshots: max.max(1),
        }
    }

    pub fn snapshots(&self) -> Vec<MetricsSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetricsSink {
    async fn record(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        snapshots.push(snapshot.clone());
        if snapshots.len() > self.max_snapshots {
            snapshots.remove(0);
        }
        Ok(())
    }
}
