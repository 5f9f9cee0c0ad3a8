//! Task data model
//!
//! A task is one unit of video work: an operation with typed parameters,
//! input/output paths, a priority and a lifecycle status.

use crate::config::EncodingConfig;
use crate::render::RenderOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task lifecycle status
///
/// `Pending -> Queued -> Processing -> {Completed | Failed | Cancelled}`,
/// with cancellation also accepted from `Pending` and `Queued`.
/// `Paused` is declared for record compatibility only; no transition
/// leads into or out of it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Convert status to string for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TranscodeParams {
    /// Copy audio streams instead of re-encoding to AAC
    #[serde(default)]
    pub copy_audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResizeParams {
    pub width: u32,
    pub height: u32,
}

impl Default for ResizeParams {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConcatParams {
    /// Sources in playback order
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractFramesParams {
    /// Frames extracted per second of source
    pub fps: f64,
}

impl Default for ExtractFramesParams {
    fn default() -> Self {
        Self { fps: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FilterParams {
    /// ffmpeg video filters, applied in order
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThumbnailParams {
    pub timestamp_secs: f64,
    pub width: u32,
    pub height: u32,
}

impl Default for ThumbnailParams {
    fn default() -> Self {
        Self {
            timestamp_secs: 0.0,
            width: 320,
            height: 180,
        }
    }
}

/// Operation to perform, with its own parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Transcode(TranscodeParams),
    Resize(ResizeParams),
    Concat(ConcatParams),
    ExtractFrames(ExtractFramesParams),
    ApplyFilter(FilterParams),
    Thumbnail(ThumbnailParams),
}

/// Parameter-free operation discriminant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Transcode,
    Resize,
    Concat,
    ExtractFrames,
    ApplyFilter,
    Thumbnail,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Transcode => "transcode",
            OperationKind::Resize => "resize",
            OperationKind::Concat => "concat",
            OperationKind::ExtractFrames => "extract_frames",
            OperationKind::ApplyFilter => "apply_filter",
            OperationKind::Thumbnail => "thumbnail",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Transcode(_) => OperationKind::Transcode,
            Operation::Resize(_) => OperationKind::Resize,
            Operation::Concat(_) => OperationKind::Concat,
            Operation::ExtractFrames(_) => OperationKind::ExtractFrames,
            Operation::ApplyFilter(_) => OperationKind::ApplyFilter,
            Operation::Thumbnail(_) => OperationKind::Thumbnail,
        }
    }

    /// Preview-class operations are served from the hybrid cache when possible
    pub fn is_preview(&self) -> bool {
        matches!(self, Operation::Thumbnail(_))
    }
}

/// Classification of a task failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    ToolUnavailable,
    SubprocessFailure,
    Timeout,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::ToolUnavailable => "tool_unavailable",
            FailureKind::SubprocessFailure => "subprocess_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

/// Structured error retained on a failed task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Read-only view of a task, as handed to callbacks and status queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub operation: Operation,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub priority: i32,
    pub status: TaskStatus,
    pub progress: f32,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub error: Option<TaskFailure>,
    pub outcome: Option<RenderOutcome>,
}

impl TaskRecord {
    /// Wall time between dispatch and the terminal transition
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at_ms?;
        let completed = self.completed_at_ms?;
        Some(Duration::from_millis(completed.saturating_sub(started).max(0) as u64))
    }
}

/// Invoked exactly once when the task reaches a terminal status
pub type CompletionCallback = Box<dyn FnOnce(&TaskRecord) + Send + 'static>;

/// Submission request for the scheduler
pub struct TaskRequest {
    pub name: Option<String>,
    pub operation: Operation,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Higher runs sooner
    pub priority: i32,
    /// Overrides the engine's default encoding settings
    pub encoding: Option<EncodingConfig>,
    /// Overrides the per-operation timeout
    pub timeout: Option<Duration>,
    pub callback: Option<CompletionCallback>,
}

impl TaskRequest {
    pub fn new(
        operation: Operation,
        input_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: None,
            operation,
            input_path: input_path.into(),
            output_path: output_path.into(),
            priority: 0,
            encoding: None,
            timeout: None,
            callback: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_encoding(mut self, encoding: EncodingConfig) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&TaskRecord) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Name used when none was given: `<kind>:<input file name>`
    pub(crate) fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let file = self
                .input_path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("{}:{}", self.operation.kind(), file)
        })
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .field("input_path", &self.input_path)
            .field("output_path", &self.output_path)
            .field("priority", &self.priority)
            .field("encoding", &self.encoding)
            .field("timeout", &self.timeout)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Get current timestamp in milliseconds
pub(crate) fn unix_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    #[test]
    fn test_task_status_as_str() {
        assert_eq!(TaskStatus::Pending.as_str(), "pending");
        assert_eq!(TaskStatus::Queued.as_str(), "queued");
        assert_eq!(TaskStatus::Processing.as_str(), "processing");
        assert_eq!(TaskStatus::Paused.as_str(), "paused");
        assert_eq!(TaskStatus::Completed.as_str(), "completed");
        assert_eq!(TaskStatus::Failed.as_str(), "failed");
        assert_eq!(TaskStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_paused_is_unreachable() {
        for other in ALL {
            assert!(!other.can_transition_to(TaskStatus::Paused));
            assert!(!TaskStatus::Paused.can_transition_to(other));
        }
    }

    #[test]
    fn test_forward_path_and_cancellation() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
        for from in [TaskStatus::Pending, TaskStatus::Queued, TaskStatus::Processing] {
            assert!(from.can_transition_to(TaskStatus::Cancelled));
        }
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_operation_serialization_is_tagged() {
        let op = Operation::Resize(ResizeParams {
            width: 1280,
            height: 720,
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["kind"], "resize");
        assert_eq!(json["width"], 1280);

        let parsed: Operation =
            serde_json::from_str(r#"{"kind":"concat","sources":["a.mp4","b.mp4"]}"#).unwrap();
        assert_eq!(parsed.kind(), OperationKind::Concat);
        assert!(!parsed.is_preview());
        assert!(Operation::Thumbnail(ThumbnailParams::default()).is_preview());
    }

    #[test]
    fn test_request_builder_and_display_name() {
        let request = TaskRequest::new(
            Operation::Transcode(TranscodeParams::default()),
            "/media/in/clip.mov",
            "/media/out/clip.mp4",
        )
        .with_priority(5)
        .with_timeout(Duration::from_secs(30))
        .on_complete(|_| {});

        assert_eq!(request.priority, 5);
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
        assert!(request.callback.is_some());
        assert_eq!(request.display_name(), "transcode:clip.mov");
        assert_eq!(request.with_name("intro").display_name(), "intro");
    }

    #[test]
    fn test_record_duration() {
        let record = TaskRecord {
            id: TaskId::new(),
            name: "t".to_string(),
            operation: Operation::Transcode(TranscodeParams::default()),
            input_path: PathBuf::from("in.mp4"),
            output_path: PathBuf::from("out.mp4"),
            priority: 0,
            status: TaskStatus::Completed,
            progress: 1.0,
            created_at_ms: 1_000,
            started_at_ms: Some(2_000),
            completed_at_ms: Some(4_500),
            error: None,
            outcome: None,
        };
        assert_eq!(record.duration(), Some(Duration::from_millis(2_500)));
    }

    #[test]
    fn test_task_ids_are_unique() {
        let ids: std::collections::HashSet<TaskId> = (0..1000).map(|_| TaskId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_unix_timestamp_ms() {
        // Should be a reasonable timestamp (after year 2020)
        assert!(unix_timestamp_ms() > 1577836800000);
    }
}
