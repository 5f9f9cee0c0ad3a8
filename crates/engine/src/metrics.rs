//! Metrics for framepipe
//!
//! [`MetricsAggregate`] is updated by the scheduler on every terminal
//! transition. Read-only snapshots ([`QueueStatus`], [`PerformanceMetrics`],
//! [`MetricsSnapshot`]) are plain serializable values for dashboards and the
//! HTTP endpoint.

use crate::cache::CacheStats;
use crate::task::{TaskRecord, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Terminal tasks included in the rolling average duration
pub const DURATION_WINDOW: usize = 100;

/// Window over which throughput is measured
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Queue and registry occupancy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueueStatus {
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Every task still in the registry, terminal ones included
    pub total_tracked: usize,
    pub pool_size: u32,
    pub available_workers: usize,
    pub max_queue_size: usize,
    pub accepting: bool,
}

/// Aggregate task statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PerformanceMetrics {
    pub total_submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Failure counts keyed by failure kind
    pub failures_by_kind: BTreeMap<String, u64>,
    /// Mean over the last [`DURATION_WINDOW`] terminal tasks
    pub average_duration_ms: f64,
    /// Completions in the last minute
    pub throughput_per_minute: f64,
    pub hardware_renders: u64,
    pub software_renders: u64,
    pub fallback_renders: u64,
    pub preview_cache_hits: u64,
    pub subprocesses_spawned: u64,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot served by the HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub queue: QueueStatus,
    pub performance: PerformanceMetrics,
    pub cache: CacheStats,
    pub system: SystemMetrics,
    pub gpu_utilization: f32,
}

/// Shared metrics state for concurrent access across engine components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Running totals fed by terminal transitions
#[derive(Debug, Default)]
pub struct MetricsAggregate {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    failures_by_kind: BTreeMap<String, u64>,
    durations: VecDeque<Duration>,
    completions: VecDeque<Instant>,
    hardware_renders: u64,
    software_renders: u64,
    fallback_renders: u64,
    preview_cache_hits: u64,
}

impl MetricsAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&mut self) {
        self.submitted += 1;
    }

    /// Fold one terminal task into the totals
    pub fn record_terminal(&mut self, record: &TaskRecord, now: Instant) {
        match record.status {
            TaskStatus::Completed => {
                self.completed += 1;
                self.completions.push_back(now);
                if let Some(outcome) = &record.outcome {
                    if outcome.from_cache {
                        self.preview_cache_hits += 1;
                    } else if outcome.encoder.is_some() {
                        if outcome.hardware {
                            self.hardware_renders += 1;
                        } else {
                            self.software_renders += 1;
                        }
                        if outcome.fallback_reason.is_some() {
                            self.fallback_renders += 1;
                        }
                    }
                }
            }
            TaskStatus::Failed => {
                self.failed += 1;
                if let Some(error) = &record.error {
                    *self
                        .failures_by_kind
                        .entry(error.kind.as_str().to_string())
                        .or_default() += 1;
                }
            }
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => return,
        }

        if let Some(duration) = record.duration() {
            if self.durations.len() == DURATION_WINDOW {
                self.durations.pop_front();
            }
            self.durations.push_back(duration);
        }
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.completions.front() {
            if now.saturating_duration_since(oldest) > THROUGHPUT_WINDOW {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self, now: Instant, subprocesses_spawned: u64) -> PerformanceMetrics {
        let average_duration_ms = if self.durations.is_empty() {
            0.0
        } else {
            let total: Duration = self.durations.iter().sum();
            total.as_secs_f64() * 1000.0 / self.durations.len() as f64
        };
        let recent = self
            .completions
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) <= THROUGHPUT_WINDOW)
            .count();

        PerformanceMetrics {
            total_submitted: self.submitted,
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            failures_by_kind: self.failures_by_kind.clone(),
            average_duration_ms,
            throughput_per_minute: recent as f64 * 60.0 / THROUGHPUT_WINDOW.as_secs_f64(),
            hardware_renders: self.hardware_renders,
            software_renders: self.software_renders,
            fallback_renders: self.fallback_renders,
            preview_cache_hits: self.preview_cache_hits,
            subprocesses_spawned,
        }
    }
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
