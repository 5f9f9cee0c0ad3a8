//! Worker pool planning for framepipe
//!
//! Derives the worker pool size and per-task encoder thread hint from CPU
//! core count and configuration.

use crate::config::Config;

/// Upper bound for an auto-derived worker pool
const MAX_AUTO_WORKERS: u32 = 8;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Number of tasks that may run at once
    pub pool_size: u32,
    /// Encoder thread hint for tasks that do not set one
    pub threads_per_task: u32,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Pool size is `engine.worker_pool_size` when non-zero, otherwise
    ///   `min(cores, 8)`
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - Splits the target thread budget evenly across the pool
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = ((total_cores as f32) * clamped_utilization).round() as u32;

        let pool_size = if cfg.engine.worker_pool_size > 0 {
            cfg.engine.worker_pool_size
        } else {
            derive_pool_size(total_cores)
        };

        Self {
            total_cores,
            target_threads,
            pool_size,
            threads_per_task: derive_threads_per_task(target_threads, pool_size),
        }
    }

    /// Same host figures with a different pool size
    pub fn with_pool_size(&self, pool_size: u32) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            pool_size,
            threads_per_task: derive_threads_per_task(self.target_threads, pool_size),
            ..self.clone()
        }
    }

    /// Pool size the host would get without an explicit setting
    pub fn auto_pool_size(&self) -> u32 {
        derive_pool_size(self.total_cores)
    }
}

fn derive_pool_size(cores: u32) -> u32 {
    cores.clamp(1, MAX_AUTO_WORKERS)
}

fn derive_threads_per_task(target_threads: u32, pool_size: u32) -> u32 {
    (target_threads / pool_size.max(1)).max(1)
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    util.clamp(0.5, 1.0)
}

/// Public function to derive a worker plan from configuration
pub fn derive_plan(cfg: &Config) -> WorkerPlan {
    WorkerPlan::derive(cfg)
}
