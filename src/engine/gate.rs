//! Task eligibility.
//!
//! `PhaseGate` is a pure function of a run snapshot. Rules, in precedence
//! order:
//!
//! | Task      | Eligible when                                           |
//! |-----------|---------------------------------------------------------|
//! | theory    | always                                                  |
//! | plan      | theory completed                                        |
//! | skeleton  | theory and plan completed                               |
//! | html(i)   | skeleton record for slide i exists                      |
//! | narrative | html(i) completed                                       |
//! | quiz      | skeleton completed and every slide resolved             |
//!
//! Only `Pending` nodes are considered; queued, running and retry-waiting
//! nodes are never returned twice.

use crate::engine::run::{GenerationRun, PLAN_TASK, SKELETON_TASK, THEORY_TASK};
use crate::engine::state::TaskStatus;
use crate::engine::task::{TaskId, TaskKind};

pub struct PhaseGate;

impl PhaseGate {
    /// Pending tasks of `run` that may be placed on the ready queue now.
    pub fn eligible_tasks(run: &GenerationRun) -> Vec<TaskId> {
        if !run.accepts_work() {
            return Vec::new();
        }
        run.nodes()
            .iter()
            .filter(|node| node.status == TaskStatus::Pending)
            .filter(|node| Self::is_eligible(run, node.task.kind))
            .map(|node| node.task.id)
            .collect()
    }

    pub fn is_eligible(run: &GenerationRun, kind: TaskKind) -> bool {
        match kind {
            TaskKind::Theory => true,
            TaskKind::Plan => run.is_completed(THEORY_TASK),
            TaskKind::SkeletonPersist => {
                run.is_completed(THEORY_TASK) && run.is_completed(PLAN_TASK)
            }
            TaskKind::Html { order } => {
                run.is_completed(SKELETON_TASK) && run.slide(order).is_some()
            }
            TaskKind::Narrative { order } => run
                .slide(order)
                .is_some_and(|track| run.is_completed(track.html_task)),
            TaskKind::Quiz => Self::all_narratives_done(run),
        }
    }

    /// True once the slide set is known and every slide has resolved, either
    /// with a completed narrative or as failed. Counts are taken from
    /// completed results, never from queue emptiness.
    pub fn all_narratives_done(run: &GenerationRun) -> bool {
        run.is_completed(SKELETON_TASK) && run.slides_resolved() == run.slides_total()
    }
}
