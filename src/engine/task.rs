//! Units of work in a generation run.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a task node within its run.
pub type TaskId = usize;

/// The closed set of task kinds in the content pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Generate the topic's theory text.
    Theory,
    /// Generate the plain-text style/layout plan.
    Plan,
    /// Split the theory into fragments and persist slide skeletons.
    SkeletonPersist,
    /// Render one slide's HTML.
    Html { order: u32 },
    /// Write one slide's narration.
    Narrative { order: u32 },
    /// Generate the topic quiz.
    Quiz,
}

impl TaskKind {
    pub fn label(&self) -> String {
        match self {
            Self::Theory => "theory".to_string(),
            Self::Plan => "plan".to_string(),
            Self::SkeletonPersist => "skeleton".to_string(),
            Self::Html { order } => format!("html[{}]", order),
            Self::Narrative { order } => format!("narrative[{}]", order),
            Self::Quiz => "quiz".to_string(),
        }
    }

    /// Whether the task is executed by a worker. The skeleton step is pure
    /// persistence and runs inside the dispatcher loop.
    pub fn uses_worker(&self) -> bool {
        !matches!(self, Self::SkeletonPersist)
    }

    pub fn slide_order(&self) -> Option<u32> {
        match self {
            Self::Html { order } | Self::Narrative { order } => Some(*order),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Artifact a task's output is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TaskTarget {
    /// The topic record (theory) or run-local state (plan, skeleton step).
    Topic,
    /// One slide ContentUnit.
    Slide(Uuid),
    /// The topic's quiz ContentUnit.
    Quiz,
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub topic_id: String,
    pub target: TaskTarget,
}

impl GenerationTask {
    pub fn new(id: TaskId, kind: TaskKind, topic_id: &str, target: TaskTarget) -> Self {
        Self {
            id,
            kind,
            topic_id: topic_id.to_string(),
            target,
        }
    }
}
