//! framepipe
//!
//! Video-processing engine: accepts transcode, resize, concat, frame
//! extraction, filter and thumbnail tasks, runs them as supervised ffmpeg
//! processes on a bounded, priority-ordered worker pool, and reports
//! progress and outcomes as events and metrics.

pub mod cache;
pub mod concurrency;
pub mod engine;
pub mod events;
pub mod hardware;
pub mod metrics;
pub mod metrics_server;
pub mod render;
pub mod scheduler;
pub mod startup;
pub mod task;

pub use framepipe_config as config;
pub use framepipe_config::Config;
pub use cache::{CacheError, CacheStats, HybridCache};
pub use concurrency::{derive_plan, WorkerPlan};
pub use engine::{Engine, EngineError};
pub use events::{EngineEvent, EventBus};
pub use hardware::{GpuVendor, HardwareCapabilities, HardwareDetector};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, MetricsSnapshot, PerformanceMetrics, QueueStatus,
    SharedMetrics, SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use render::{RenderError, RenderOutcome, RendererBackend};
pub use scheduler::{Scheduler, SubmitError};
pub use startup::{
    check_args_for_hardware_flags, detect_hardware_flag, parse_ffmpeg_version, run_startup_checks,
    ResolvedTools, StartupError,
};
pub use task::{
    ConcatParams, ExtractFramesParams, FailureKind, FilterParams, Operation, OperationKind,
    ResizeParams, TaskFailure, TaskId, TaskRecord, TaskRequest, TaskStatus, ThumbnailParams,
    TranscodeParams,
};
