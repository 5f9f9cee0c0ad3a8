//! Event bus for task lifecycle and progress events

use crate::render::RenderOutcome;
use crate::task::{TaskFailure, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Lifecycle and progress events published by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskStarted {
        task_id: TaskId,
    },
    TaskProgress {
        task_id: TaskId,
        progress: f32,
    },
    TaskCompleted {
        task_id: TaskId,
        outcome: Option<RenderOutcome>,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskFailure,
    },
    TaskCancelled {
        task_id: TaskId,
    },
}

impl EngineEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            EngineEvent::TaskStarted { task_id }
            | EngineEvent::TaskProgress { task_id, .. }
            | EngineEvent::TaskCompleted { task_id, .. }
            | EngineEvent::TaskFailed { task_id, .. }
            | EngineEvent::TaskCancelled { task_id } => *task_id,
        }
    }

    /// Whether this event ends the task's stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::TaskCompleted { .. }
                | EngineEvent::TaskFailed { .. }
                | EngineEvent::TaskCancelled { .. }
        )
    }
}

/// Broadcast fan-out of [`EngineEvent`]s
///
/// Publishing never blocks; subscribers that fall behind by more than the
/// channel capacity observe a lag error and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        trace!(?event, "Publishing event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
