//! Run and task state types exposed through `RunStatus`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::task::TaskKind;

/// Overall state of a generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Tasks are still being dispatched or executed
    #[default]
    Running,
    /// The quiz completed
    Completed,
    /// A phase with no fallback failed terminally
    Failed,
    /// Cancelled and drained
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single task node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet eligible, or eligible but not yet evaluated by the gate
    #[default]
    Pending,
    /// On the ready queue
    Queued,
    /// Assigned to a worker
    Running,
    /// Failed retryably; waiting out the backoff delay
    RetryWait,
    Completed,
    Failed { error: String },
    Cancelled,
}

impl TaskStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Cancelled)
    }
}

/// The pipeline stage a run is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Theory,
    Plan,
    Skeleton,
    Html,
    Narrative,
    Quiz,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizState {
    Pending,
    Ready,
    Failed,
}

/// One terminally failed task, as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task: TaskKind,
    pub error: String,
    pub attempts: u32,
}

/// Non-blocking snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub topic_id: String,
    pub state: RunState,
    pub phase: RunPhase,
    pub total_tasks: usize,
    pub completed_count: usize,
    pub failed_tasks: Vec<FailedTask>,
    pub slides_total: usize,
    pub slides_ready: usize,
    pub slides_failed: usize,
    pub quiz: QuizState,
    pub completion_percentage: f64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatus {
    /// One-line progress summary, e.g. "8/10 slides ready, 2 failed, quiz pending".
    pub fn summary(&self) -> String {
        let quiz = match self.quiz {
            QuizState::Pending => "quiz pending",
            QuizState::Ready => "quiz ready",
            QuizState::Failed => "quiz failed",
        };
        format!(
            "{}/{} slides ready, {} failed, {}",
            self.slides_ready, self.slides_total, self.slides_failed, quiz
        )
    }
}
