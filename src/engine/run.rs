//! In-memory state of one generation run.
//!
//! A `GenerationRun` is owned exclusively by the dispatcher loop. The graph
//! starts with four nodes (theory, plan, skeleton step, quiz); HTML nodes are
//! added once skeletons are persisted and each narrative node is added when
//! its slide's HTML completes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::content::ContentUnit;
use crate::engine::state::{
    FailedTask, QuizState, RunPhase, RunState, RunStatus, TaskStatus,
};
use crate::engine::task::{GenerationTask, TaskId, TaskKind, TaskTarget};

pub const THEORY_TASK: TaskId = 0;
pub const PLAN_TASK: TaskId = 1;
pub const SKELETON_TASK: TaskId = 2;
pub const QUIZ_TASK: TaskId = 3;

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task: GenerationTask,
    pub status: TaskStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideOutcome {
    Pending,
    Ready,
    Failed,
}

/// A slide failure not yet recorded in the store.
#[derive(Debug, Clone)]
pub struct FailureMark {
    pub content_id: Uuid,
    pub task: TaskKind,
    pub reason: String,
    pub attempts: u32,
}

/// Run-local view of one persisted slide.
#[derive(Debug, Clone)]
pub struct SlideTrack {
    pub content_id: Uuid,
    pub order: u32,
    pub full_text: String,
    pub html_task: TaskId,
    pub narrative_task: Option<TaskId>,
    pub html: Option<String>,
    pub narrative: Option<String>,
    pub outcome: SlideOutcome,
    pub failure_mark: Option<FailureMark>,
}

#[derive(Debug)]
pub struct GenerationRun {
    pub run_id: Uuid,
    pub topic_id: String,
    pub title: String,
    nodes: Vec<TaskNode>,
    slides: Vec<SlideTrack>,
    /// Theory text as produced by the theory task.
    pub theory: Option<String>,
    /// Plan text shared by every slide of this run.
    pub plan: Option<String>,
    /// Tasks currently held by a worker.
    pub in_flight: usize,
    cancelled: bool,
    abort_reason: Option<String>,
    failed: Vec<FailedTask>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationRun {
    pub fn new(run_id: Uuid, topic_id: &str, title: &str) -> Self {
        let nodes = [
            (TaskKind::Theory, TaskTarget::Topic),
            (TaskKind::Plan, TaskTarget::Topic),
            (TaskKind::SkeletonPersist, TaskTarget::Topic),
            (TaskKind::Quiz, TaskTarget::Quiz),
        ]
        .into_iter()
        .enumerate()
        .map(|(id, (kind, target))| TaskNode {
            task: GenerationTask::new(id, kind, topic_id, target),
            status: TaskStatus::Pending,
            attempts: 0,
        })
        .collect();

        Self {
            run_id,
            topic_id: topic_id.to_string(),
            title: title.to_string(),
            nodes,
            slides: Vec::new(),
            theory: None,
            plan: None,
            in_flight: 0,
            cancelled: false,
            abort_reason: None,
            failed: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn is_completed(&self, id: TaskId) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|n| n.status == TaskStatus::Completed)
    }

    pub fn slides(&self) -> &[SlideTrack] {
        &self.slides
    }

    pub fn slide(&self, order: u32) -> Option<&SlideTrack> {
        self.slides.iter().find(|s| s.order == order)
    }

    fn slide_mut(&mut self, order: u32) -> Option<&mut SlideTrack> {
        self.slides.iter_mut().find(|s| s.order == order)
    }

    fn push_node(&mut self, kind: TaskKind, target: TaskTarget) -> TaskId {
        let id = self.nodes.len();
        self.nodes.push(TaskNode {
            task: GenerationTask::new(id, kind, &self.topic_id, target),
            status: TaskStatus::Pending,
            attempts: 0,
        });
        id
    }

    /// Register persisted skeletons and create one HTML node per slide.
    pub fn expand_slides(&mut self, units: &[ContentUnit]) {
        for unit in units {
            let Some(slide) = unit.slide() else {
                continue;
            };
            let html_task = self.push_node(
                TaskKind::Html { order: slide.order },
                TaskTarget::Slide(unit.id),
            );
            self.slides.push(SlideTrack {
                content_id: unit.id,
                order: slide.order,
                full_text: slide.full_text.clone(),
                html_task,
                narrative_task: None,
                html: None,
                narrative: None,
                outcome: SlideOutcome::Pending,
                failure_mark: None,
            });
        }
        self.slides.sort_by_key(|s| s.order);
    }

    /// Record a successful HTML result and create the slide's narrative node.
    /// No node is created once the run is cancelled.
    pub fn record_html(&mut self, order: u32, html: String) -> Option<TaskId> {
        let cancelled = self.cancelled;
        let content_id = {
            let track = self.slide_mut(order)?;
            track.html = Some(html);
            track.content_id
        };
        if cancelled {
            return None;
        }
        let id = self.push_node(TaskKind::Narrative { order }, TaskTarget::Slide(content_id));
        if let Some(track) = self.slide_mut(order) {
            track.narrative_task = Some(id);
        }
        Some(id)
    }

    pub fn record_narrative(&mut self, order: u32, text: String) {
        if let Some(track) = self.slide_mut(order) {
            track.narrative = Some(text);
            track.outcome = SlideOutcome::Ready;
        }
    }

    /// Mark a slide resolved-as-failed; it no longer blocks the quiz.
    pub fn record_slide_failure(&mut self, order: u32) {
        if let Some(track) = self.slide_mut(order) {
            track.outcome = SlideOutcome::Failed;
        }
    }

    /// Remember that a slide's failure still has to reach the store.
    pub fn queue_failure_mark(&mut self, order: u32, task: TaskKind, reason: &str) {
        if let Some(track) = self.slide_mut(order) {
            track.failure_mark = Some(FailureMark {
                content_id: track.content_id,
                task,
                reason: reason.to_string(),
                attempts: 0,
            });
        }
    }

    pub fn failure_mark_mut(&mut self, order: u32) -> Option<&mut FailureMark> {
        self.slide_mut(order).and_then(|t| t.failure_mark.as_mut())
    }

    /// The failure is now recorded in the store.
    pub fn clear_failure_mark(&mut self, order: u32) {
        if let Some(track) = self.slide_mut(order) {
            track.failure_mark = None;
        }
    }

    /// Stop trying to record a slide failure and surface it to callers.
    pub fn abandon_failure_mark(&mut self, order: u32, error: &str) {
        let Some(mark) = self.slide_mut(order).and_then(|t| t.failure_mark.take()) else {
            return;
        };
        self.failed.push(FailedTask {
            task: mark.task,
            error: format!("slide failure not recorded: {}", error),
            attempts: mark.attempts,
        });
    }

    pub fn has_pending_failure_marks(&self) -> bool {
        self.slides.iter().any(|s| s.failure_mark.is_some())
    }

    pub fn record_failure(&mut self, id: TaskId, error: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = TaskStatus::Failed {
                error: error.to_string(),
            };
            self.failed.push(FailedTask {
                task: node.task.kind,
                error: error.to_string(),
                attempts: node.attempts,
            });
        }
    }

    pub fn slides_total(&self) -> usize {
        self.slides.len()
    }

    pub fn slides_resolved(&self) -> usize {
        self.slides
            .iter()
            .filter(|s| s.outcome != SlideOutcome::Pending)
            .count()
    }

    fn slides_with(&self, outcome: SlideOutcome) -> usize {
        self.slides.iter().filter(|s| s.outcome == outcome).count()
    }

    /// Narratives of the slides that completed, in slide order.
    pub fn narratives(&self) -> Vec<String> {
        self.slides
            .iter()
            .filter_map(|s| s.narrative.clone())
            .collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    /// Whether the gate may release new work for this run.
    pub fn accepts_work(&self) -> bool {
        !self.cancelled && self.abort_reason.is_none()
    }

    /// Stop dispatching: every task not yet handed to a worker is cancelled.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        for node in &mut self.nodes {
            if matches!(
                node.status,
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::RetryWait
            ) {
                node.status = TaskStatus::Cancelled;
            }
        }
    }

    /// End the run as failed. Outstanding tasks are cancelled; anything in
    /// flight still drains.
    pub fn abort(&mut self, reason: &str) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason.to_string());
        }
        for node in &mut self.nodes {
            if matches!(
                node.status,
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::RetryWait
            ) {
                node.status = TaskStatus::Cancelled;
            }
        }
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Tasks waiting on the queue or on a retry timer, or slide failures
    /// still being written.
    pub fn has_waiting_tasks(&self) -> bool {
        self.has_pending_failure_marks()
            || self
                .nodes
                .iter()
                .any(|n| matches!(n.status, TaskStatus::Queued | TaskStatus::RetryWait))
    }

    pub fn state(&self) -> RunState {
        let quiz = &self.nodes[QUIZ_TASK].status;
        if self.in_flight > 0 || self.has_pending_failure_marks() {
            return RunState::Running;
        }
        if self.abort_reason.is_some() || matches!(quiz, TaskStatus::Failed { .. }) {
            RunState::Failed
        } else if *quiz == TaskStatus::Completed {
            RunState::Completed
        } else if self.cancelled {
            RunState::Cancelled
        } else {
            RunState::Running
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn phase(&self) -> RunPhase {
        match self.state() {
            RunState::Completed => return RunPhase::Completed,
            RunState::Failed => return RunPhase::Failed,
            RunState::Cancelled => return RunPhase::Cancelled,
            RunState::Running => {}
        }
        if !self.is_completed(THEORY_TASK) {
            return RunPhase::Theory;
        }
        if !self.is_completed(PLAN_TASK) {
            return RunPhase::Plan;
        }
        if !self.is_completed(SKELETON_TASK) {
            return RunPhase::Skeleton;
        }
        let html_open = self.slides.iter().any(|s| {
            s.outcome == SlideOutcome::Pending && s.narrative_task.is_none()
        });
        if html_open {
            return RunPhase::Html;
        }
        if self.slides_resolved() < self.slides_total() {
            return RunPhase::Narrative;
        }
        RunPhase::Quiz
    }

    pub fn quiz_state(&self) -> QuizState {
        match self.nodes[QUIZ_TASK].status {
            TaskStatus::Completed => QuizState::Ready,
            TaskStatus::Failed { .. } => QuizState::Failed,
            _ => QuizState::Pending,
        }
    }

    pub fn status(&self) -> RunStatus {
        // Expected graph size: four fixed nodes plus two per slide.
        let total_tasks = 4 + 2 * self.slides.len();
        let completed_count = self
            .nodes
            .iter()
            .filter(|n| n.status == TaskStatus::Completed)
            .count();
        // A slide whose HTML failed never gets a narrative node; count it as resolved.
        let skipped_narratives = self
            .slides
            .iter()
            .filter(|s| s.outcome == SlideOutcome::Failed && s.narrative_task.is_none())
            .count();
        let resolved = self.nodes.iter().filter(|n| n.status.is_resolved()).count()
            + skipped_narratives;
        let state = self.state();
        let completion_percentage = if state == RunState::Completed {
            100.0
        } else {
            (resolved.min(total_tasks) as f64 / total_tasks as f64) * 100.0
        };

        RunStatus {
            run_id: self.run_id,
            topic_id: self.topic_id.clone(),
            state,
            phase: self.phase(),
            total_tasks,
            completed_count,
            failed_tasks: self.failed.clone(),
            slides_total: self.slides.len(),
            slides_ready: self.slides_with(SlideOutcome::Ready),
            slides_failed: self.slides_with(SlideOutcome::Failed),
            quiz: self.quiz_state(),
            completion_percentage,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}
