//! Engine facade
//!
//! One explicitly constructed value owning the detector, renderer backend,
//! hybrid cache, scheduler, event bus and metrics. Collaborators hold a
//! reference to it instead of reaching for a global.

use crate::cache::{CacheError, CacheStats, HybridCache};
use crate::concurrency::WorkerPlan;
use crate::config::{Config, ConfigError};
use crate::events::{EngineEvent, EventBus};
use crate::hardware::{HardwareCapabilities, HardwareDetector};
use crate::metrics::{
    collect_system_metrics, new_shared_metrics, PerformanceMetrics, QueueStatus, SharedMetrics,
};
use crate::metrics_server::{run_metrics_server, ServerError};
use crate::render::RendererBackend;
use crate::scheduler::{Scheduler, SubmitError};
use crate::startup::{run_startup_checks, ResolvedTools, StartupError};
use crate::task::{unix_timestamp_ms, TaskId, TaskRecord, TaskRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Error type for engine construction
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Cache could not be opened
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Metrics server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// The video-processing engine
pub struct Engine {
    config: Config,
    plan: Mutex<WorkerPlan>,
    detector: Arc<HardwareDetector>,
    backend: Arc<RendererBackend>,
    cache: Arc<HybridCache>,
    scheduler: Scheduler,
    events: EventBus,
    metrics: SharedMetrics,
    /// Stops the background samplers and sweeper
    background: CancellationToken,
}

impl Engine {
    /// Build an engine after the startup sequence
    ///
    /// 1. Validate the configuration
    /// 2. Resolve ffmpeg and check its version; locate ffprobe
    /// 3. Detect hardware (when `hardware.detect_on_start` is set)
    /// 4. Open the cache and derive the worker plan
    pub async fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let tools = run_startup_checks(&config).await?;

        let detector = HardwareDetector::new(&config.tools);
        let capabilities = if config.hardware.detect_on_start
            && !config.hardware.disallow_hardware_encoding
        {
            detector.detect().await
        } else {
            HardwareCapabilities::none()
        };

        Self::assemble(config, detector, capabilities, Some(tools))
    }

    /// Build an engine without startup checks or hardware detection
    ///
    /// Useful for tests and hosts where the tools are known to be present.
    /// The configuration is still validated.
    pub fn new_without_checks(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let detector = HardwareDetector::new(&config.tools);
        Self::assemble(config, detector, HardwareCapabilities::none(), None)
    }

    fn assemble(
        config: Config,
        detector: HardwareDetector,
        capabilities: HardwareCapabilities,
        tools: Option<ResolvedTools>,
    ) -> Result<Self, EngineError> {
        let cache = Arc::new(HybridCache::open(&config.cache)?);

        let mut backend = RendererBackend::new(&config, capabilities);
        if let Some(tools) = tools {
            backend = backend.with_tools(tools.ffmpeg, tools.ffprobe);
        }
        let backend = Arc::new(backend);

        let plan = WorkerPlan::derive(&config);
        let events = EventBus::new(config.engine.event_capacity);
        let scheduler = Scheduler::new(&config, &plan, backend.clone(), cache.clone(), events.clone());

        info!(
            pool_size = plan.pool_size,
            threads_per_task = plan.threads_per_task,
            cache = ?config.cache.strategy,
            "Engine ready"
        );

        Ok(Self {
            config,
            plan: Mutex::new(plan),
            detector: Arc::new(detector),
            backend,
            cache,
            scheduler,
            events,
            metrics: new_shared_metrics(),
            background: CancellationToken::new(),
        })
    }

    /// Start dispatching and the background maintenance tasks
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.extend(self.scheduler.start());
        handles.push(self.start_metrics_sampler());
        if self.cache.strategy().uses_memory() || self.cache.strategy().uses_disk() {
            handles.push(self.start_cache_sweeper());
        }
        if self.backend.capabilities().has_hardware() {
            handles.push(self.start_utilization_sampler());
        }
        handles
    }

    /// Serve the metrics snapshot over HTTP at `metrics_server.bind`
    pub fn start_metrics_server(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let bind = self.config.metrics_server.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &bind).await {
                error!(error = %e, "Metrics server stopped");
            }
        })
    }

    fn start_metrics_sampler(&self) -> JoinHandle<()> {
        let sampler = self.sampler();
        let interval = Duration::from_millis(self.config.metrics_server.sample_interval_ms.max(50));
        let stop = self.background.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => sampler.sample().await,
                }
            }
        })
    }

    fn start_cache_sweeper(&self) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let interval = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        let stop = self.background.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired().await;
                        if purged > 0 {
                            debug!(purged, "Cache sweep");
                        }
                    }
                }
            }
        })
    }

    fn start_utilization_sampler(&self) -> JoinHandle<()> {
        let detector = self.detector.clone();
        let backend = self.backend.clone();
        let interval = Duration::from_millis(self.config.hardware.utilization_interval_ms.max(100));
        let stop = self.background.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let utilization = detector.get_utilization().await;
                        let mut caps = backend.capabilities();
                        caps.utilization = utilization;
                        backend.set_capabilities(caps);
                    }
                }
            }
        })
    }

    fn sampler(&self) -> MetricsSampler {
        MetricsSampler {
            scheduler: self.scheduler.clone(),
            cache: self.cache.clone(),
            backend: self.backend.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Refresh the shared snapshot now instead of waiting for the sampler
    pub async fn sample_metrics(&self) {
        self.sampler().sample().await;
    }

    pub fn submit(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
        self.scheduler.submit(request)
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.scheduler.task(id)
    }

    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.scheduler.tasks()
    }

    /// Tasks currently being rendered
    pub fn active_tasks(&self) -> Vec<TaskRecord> {
        self.scheduler.active_tasks()
    }

    /// Wait until no task is queued or running; `false` on timeout
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        self.scheduler.wait_for_idle(timeout).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.scheduler.get_queue_status()
    }

    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        self.scheduler.get_performance_metrics()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_completed_tasks(&self) -> usize {
        self.scheduler.clear_completed_tasks()
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn worker_plan(&self) -> WorkerPlan {
        self.plan.lock().clone()
    }

    pub fn capabilities(&self) -> HardwareCapabilities {
        self.backend.capabilities()
    }

    /// Re-run hardware detection and use the result for later tasks
    pub async fn refresh_hardware(&self) -> HardwareCapabilities {
        let caps = if self.config.hardware.disallow_hardware_encoding {
            HardwareCapabilities::none()
        } else {
            self.detector.detect().await
        };
        info!(vendor = caps.vendor.as_str(), encoders = ?caps.encoders, "Hardware refreshed");
        self.backend.set_capabilities(caps.clone());
        caps
    }

    /// Change the worker pool size; running tasks finish on the old pool
    pub async fn reconfigure(&self, pool_size: u32) -> WorkerPlan {
        let plan = self.plan.lock().with_pool_size(pool_size);
        self.scheduler
            .resize_pool(plan.pool_size, plan.threads_per_task)
            .await;
        *self.plan.lock() = plan.clone();
        plan
    }

    /// Resize the pool to what the host supports
    pub async fn optimize_settings(&self) -> WorkerPlan {
        let auto = self.plan.lock().auto_pool_size();
        info!(pool_size = auto, "Applying host-derived pool size");
        self.reconfigure(auto).await
    }

    /// Drain and release resources
    ///
    /// Stops accepting work, cancels waiting tasks, waits for running tasks
    /// to finish, stops background tasks and empties the cache.
    pub async fn cleanup(&self) {
        self.shutdown(false).await;
    }

    /// Like [`Engine::cleanup`], but running tasks are cancelled too
    pub async fn shutdown(&self, cancel_running: bool) {
        self.scheduler.shutdown(cancel_running).await;
        self.background.cancel();
        self.cache.clear().await;
        self.sample_metrics().await;
        info!("Engine stopped");
    }
}

/// Everything the snapshot sampler reads
struct MetricsSampler {
    scheduler: Scheduler,
    cache: Arc<HybridCache>,
    backend: Arc<RendererBackend>,
    metrics: SharedMetrics,
}

impl MetricsSampler {
    async fn sample(&self) {
        // Gather first so the write lock is held only for the swap
        let queue = self.scheduler.get_queue_status();
        let performance = self.scheduler.get_performance_metrics();
        let cache = self.cache.stats();
        let gpu_utilization = self.backend.capabilities().utilization;
        let system = tokio::task::spawn_blocking(collect_system_metrics)
            .await
            .unwrap_or_default();

        let mut snapshot = self.metrics.write().await;
        snapshot.timestamp_unix_ms = unix_timestamp_ms();
        snapshot.queue = queue;
        snapshot.performance = performance;
        snapshot.cache = cache;
        snapshot.system = system;
        snapshot.gpu_utilization = gpu_utilization;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheStrategy;
    use crate::task::{Operation, TaskStatus, TranscodeParams};
    use std::path::{Path, PathBuf};

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.engine.temp_dir = dir.join("tmp");
        config.engine.worker_pool_size = 2;
        config.tools.ffmpeg_path = dir.join("no-ffmpeg");
        config.tools.ffprobe_path = dir.join("no-ffprobe");
        config.cache.directory = dir.join("cache");
        config.cache.strategy = CacheStrategy::Memory;
        config.hardware.detect_on_start = false;
        config.metrics_server.sample_interval_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_new_fails_without_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let err = Engine::new(test_config(dir.path())).await.err().unwrap();
        assert!(matches!(err, EngineError::Startup(StartupError::ToolUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.engine.max_queue_size = 0;
        let err = Engine::new(config).await.err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_unchecked_engine_still_validates_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.engine.max_queue_size = 0;
        let err = Engine::new_without_checks(config).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(!dir.path().join("cache").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_for_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.tools.ffmpeg_path = fake_tool(dir.path(), "ffmpeg", "sleep 0.2\nexit 0");
        let input = dir.path().join("in.mov");
        std::fs::write(&input, b"x").unwrap();

        let engine = Engine::new_without_checks(config).unwrap();
        assert!(engine.wait_for_completion(Duration::from_millis(10)).await);
        engine.start();

        let ids: Vec<TaskId> = (0..4)
            .map(|i| {
                engine
                    .submit(TaskRequest::new(
                        Operation::Transcode(TranscodeParams::default()),
                        &input,
                        dir.path().join(format!("{i}.mp4")),
                    ))
                    .unwrap()
            })
            .collect();
        assert!(!engine.wait_for_completion(Duration::from_millis(50)).await);
        assert!(!engine.active_tasks().is_empty());

        assert!(engine.wait_for_completion(Duration::from_secs(10)).await);
        assert!(engine.active_tasks().is_empty());
        for id in ids {
            assert_eq!(engine.task(id).unwrap().status, TaskStatus::Completed);
        }
        engine.cleanup().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_with_checked_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.tools.ffmpeg_path = fake_tool(
            dir.path(),
            "ffmpeg",
            "echo 'ffmpeg version 6.1.1 Copyright (c) 2000-2023'",
        );

        let engine = Engine::new(config).await.unwrap();
        assert_eq!(engine.capabilities(), HardwareCapabilities::none());
        assert_eq!(engine.worker_plan().pool_size, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_task_lifecycle_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.tools.ffmpeg_path = fake_tool(dir.path(), "ffmpeg", "exit 0");
        let input = dir.path().join("in.mov");
        std::fs::write(&input, b"x").unwrap();

        let engine = Engine::new_without_checks(config).unwrap();
        let mut rx = engine.subscribe();
        engine.start();

        let (tx, done) = tokio::sync::oneshot::channel();
        let id = engine
            .submit(
                TaskRequest::new(
                    Operation::Transcode(TranscodeParams::default()),
                    &input,
                    dir.path().join("out.mp4"),
                )
                .on_complete(move |record| {
                    let _ = tx.send(record.status);
                }),
            )
            .unwrap();

        let status = tokio::time::timeout(Duration::from_secs(10), done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::TaskStarted { task_id: id });

        engine.sample_metrics().await;
        let snapshot = engine.metrics().read().await.clone();
        assert_eq!(snapshot.performance.completed, 1);
        assert_eq!(snapshot.queue.completed, 1);
        assert_eq!(snapshot.queue.pool_size, 2);
        assert!(snapshot.timestamp_unix_ms > 0);

        engine.cleanup().await;
        assert!(matches!(
            engine.submit(TaskRequest::new(
                Operation::Transcode(TranscodeParams::default()),
                &input,
                dir.path().join("again.mp4"),
            )),
            Err(SubmitError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_reconfigure_rebuilds_pool() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new_without_checks(test_config(dir.path())).unwrap();
        engine.start();

        let plan = engine.reconfigure(5).await;
        assert_eq!(plan.pool_size, 5);
        assert_eq!(engine.get_queue_status().pool_size, 5);
        assert_eq!(engine.worker_plan().pool_size, 5);

        let plan = engine.optimize_settings().await;
        assert_eq!(plan.pool_size, plan.auto_pool_size());
        engine.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_empties_cache() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new_without_checks(test_config(dir.path())).unwrap();
        engine.cache.put("thumbnail:a", vec![0u8; 16]).await;
        assert_eq!(engine.cache_stats().memory_entries, 1);

        engine.cleanup().await;
        assert_eq!(engine.cache_stats().memory_entries, 0);
        assert!(!engine.get_queue_status().accepting);
    }
}
