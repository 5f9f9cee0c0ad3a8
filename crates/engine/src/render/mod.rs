//! Renderer backend
//!
//! Turns a task into one supervised ffmpeg invocation: validates the
//! operation parameters, selects an encoder from the detected hardware,
//! builds the argument list, then spawns the process and streams its
//! progress until exit, timeout or cancellation.

mod backend;
mod command;
mod encoder;
mod probe;
mod progress;

pub use backend::{effective_timeout, RendererBackend};
pub use command::{build_command, uses_encoder, validate, ConcatList, PreparedCommand, RenderJob};
pub use encoder::{quality_args, select_encoder, EncoderChoice};
pub use probe::{parse_duration, probe_duration};
pub use progress::ProgressParser;

use crate::task::{FailureKind, TaskFailure};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type for a single render
#[derive(Debug, Error)]
pub enum RenderError {
    /// Bad task parameters, caught before anything is spawned
    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("{tool} unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    /// ffmpeg exited non-zero; `stderr` holds the tail of its error output
    #[error("Encoder exited with {}: {stderr}", describe_exit(.code))]
    SubprocessFailure { code: Option<i32>, stderr: String },

    #[error("Timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker driving the render died
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl RenderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RenderError::Validation(_) => FailureKind::Validation,
            RenderError::ToolUnavailable { .. } => FailureKind::ToolUnavailable,
            RenderError::SubprocessFailure { .. } => FailureKind::SubprocessFailure,
            RenderError::Timeout { .. } => FailureKind::Timeout,
            RenderError::Cancelled => FailureKind::Cancelled,
            RenderError::Io(_) | RenderError::Internal(_) => FailureKind::Internal,
        }
    }

    /// Structured form retained on the failed task
    pub fn to_failure(&self) -> TaskFailure {
        TaskFailure::new(self.kind(), self.to_string())
    }
}

/// How a successful task was produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RenderOutcome {
    /// Video encoder used; `None` for stream copies and image outputs
    pub encoder: Option<String>,
    pub hardware: bool,
    /// Why a hardware binding was skipped, when it was
    pub fallback_reason: Option<String>,
    pub duration_ms: u64,
    /// Served from the hybrid cache without spawning ffmpeg
    pub from_cache: bool,
}

impl RenderOutcome {
    pub fn from_cache(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            from_cache: true,
            ..Self::default()
        }
    }
}
