//! The dispatcher control loop.
//!
//! One spawned task owns every `GenerationRun`. It reacts to three event
//! sources and processes each event to completion before taking the next:
//!
//! | Source            | Effect                                               |
//! |-------------------|------------------------------------------------------|
//! | caller commands   | submit, cancel, shutdown                             |
//! | worker messages   | persist output or classify failure, then re-gate     |
//! | retry timers      | return a backed-off task to the gate, or rewrite a   |
//! |                   | slide failure the store did not accept               |
//!
//! Because run state has a single writer, PhaseGate always evaluates a
//! snapshot that reflects every completion received so far.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::content::validate::{ensure_plain_text, validate_topic_id};
use crate::content::{Fragment, split_theory};
use crate::engine::gate::PhaseGate;
use crate::engine::generator::{GenerationInput, GenerationRequest, Generator};
use crate::engine::pool::{Assignment, WorkerMessage, WorkerPool, WorkerReport};
use crate::engine::retry::RetryPolicy;
use crate::engine::run::GenerationRun;
use crate::engine::state::{RunStatus, TaskStatus};
use crate::engine::task::{GenerationTask, TaskId, TaskKind};
use crate::errors::{EngineError, TaskError, ValidationError};
use crate::store::ArtifactStore;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker pool size, fixed for the dispatcher's lifetime.
    pub workers: usize,
    /// Upper bound on one generation call.
    pub task_timeout: Duration,
    /// Fragment size limit passed to the theory splitter.
    pub max_fragment_chars: usize,
    pub retry: RetryPolicy,
    /// Finished runs whose final status stays pollable.
    pub retain_finished_runs: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            task_timeout: Duration::from_secs(120),
            max_fragment_chars: 1200,
            retry: RetryPolicy::default(),
            retain_finished_runs: 128,
        }
    }
}

impl DispatcherConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_max_fragment_chars(mut self, max: usize) -> Self {
        self.max_fragment_chars = max;
        self
    }

    pub fn with_retain_finished_runs(mut self, runs: usize) -> Self {
        self.retain_finished_runs = runs;
        self
    }
}

/// Events broadcast while runs progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        topic_id: String,
    },
    TaskStarted {
        run_id: Uuid,
        task: TaskKind,
        worker: usize,
        attempt: u32,
    },
    TaskCompleted {
        run_id: Uuid,
        task: TaskKind,
    },
    TaskRetrying {
        run_id: Uuid,
        task: TaskKind,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    TaskFailed {
        run_id: Uuid,
        task: TaskKind,
        reason: String,
    },
    SlidesPersisted {
        run_id: Uuid,
        count: usize,
    },
    RunFinished {
        run_id: Uuid,
        status: Box<RunStatus>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::TaskStarted { run_id, .. }
            | Self::TaskCompleted { run_id, .. }
            | Self::TaskRetrying { run_id, .. }
            | Self::TaskFailed { run_id, .. }
            | Self::SlidesPersisted { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}

/// Caller-side handle to one submitted run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub topic_id: String,
    status: watch::Receiver<RunStatus>,
}

impl RunHandle {
    /// Latest status without waiting.
    pub fn poll(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Wait until the run reaches a terminal state.
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|s| s.state.is_terminal()).await {
            return status.clone();
        }
        rx.borrow().clone()
    }
}

enum Command {
    Submit {
        topic_id: String,
        reply: oneshot::Sender<Result<RunHandle, EngineError>>,
    },
    Cancel {
        run_id: Uuid,
        reply: oneshot::Sender<Result<RunStatus, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type StatusBoard = Arc<RwLock<HashMap<Uuid, watch::Receiver<RunStatus>>>>;

/// A backoff timer that fired.
#[derive(Debug, Clone, Copy)]
enum RetryDue {
    Task { run_id: Uuid, task_id: TaskId },
    FailureMark { run_id: Uuid, order: u32 },
}

/// Handle to a running dispatcher. Cheap to clone; all clones drive the
/// same control loop.
#[derive(Clone)]
pub struct Dispatcher {
    cmd_tx: mpsc::UnboundedSender<Command>,
    board: StatusBoard,
    events: broadcast::Sender<RunEvent>,
    workers: usize,
}

impl Dispatcher {
    /// Spawn the worker pool and the control loop. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: DispatcherConfig,
        store: Arc<dyn ArtifactStore>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let workers = config.workers.max(1);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let board: StatusBoard = Arc::new(RwLock::new(HashMap::new()));

        let pool = WorkerPool::spawn(workers, generator, worker_tx, config.task_timeout);
        let control = DispatchLoop {
            config,
            store,
            pool,
            runs: HashMap::new(),
            active_topics: HashMap::new(),
            ready: VecDeque::new(),
            idle: workers,
            board: Arc::clone(&board),
            finished: VecDeque::new(),
            events: events.clone(),
            retry_tx,
            shutting_down: false,
            shutdown_replies: Vec::new(),
        };
        tokio::spawn(control.run(cmd_rx, worker_rx, retry_rx));
        info!(workers, "Dispatcher started");

        Self {
            cmd_tx,
            board,
            events,
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start a generation run for `topic_id`.
    pub async fn submit(&self, topic_id: &str) -> Result<RunHandle, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit {
                topic_id: topic_id.to_string(),
                reply,
            })
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Snapshot of a run's status; finished runs stay pollable for a while.
    pub async fn poll(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        self.board
            .read()
            .await
            .get(&run_id)
            .map(|rx| rx.borrow().clone())
            .ok_or(EngineError::RunNotFound { run_id })
    }

    /// Stop dispatching for a run. In-flight tasks finish and persist.
    pub async fn cancel(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Cancel { run_id, reply })
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Cancel every run, drain in-flight work and stop the workers.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { reply })
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)
    }
}

struct ActiveRun {
    run: GenerationRun,
    status_tx: watch::Sender<RunStatus>,
}

struct DispatchLoop {
    config: DispatcherConfig,
    store: Arc<dyn ArtifactStore>,
    pool: WorkerPool,
    runs: HashMap<Uuid, ActiveRun>,
    active_topics: HashMap<String, Uuid>,
    /// FIFO of tasks in readiness order, shared across runs.
    ready: VecDeque<(Uuid, TaskId)>,
    idle: usize,
    board: StatusBoard,
    finished: VecDeque<Uuid>,
    events: broadcast::Sender<RunEvent>,
    retry_tx: mpsc::UnboundedSender<RetryDue>,
    shutting_down: bool,
    shutdown_replies: Vec<oneshot::Sender<()>>,
}

fn emit(events: &broadcast::Sender<RunEvent>, event: RunEvent) {
    // No subscribers is fine.
    let _ = events.send(event);
}

fn schedule(retry_tx: &mpsc::UnboundedSender<RetryDue>, delay: Duration, due: RetryDue) {
    let retry_tx = retry_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = retry_tx.send(due);
    });
}

fn build_request(run: &GenerationRun, kind: TaskKind) -> Option<GenerationRequest> {
    let theory = || run.theory.clone().unwrap_or_default();
    let input = match kind {
        TaskKind::Theory => GenerationInput::Theory {
            title: run.title.clone(),
        },
        TaskKind::Plan => GenerationInput::Plan { theory: theory() },
        TaskKind::SkeletonPersist => return None,
        TaskKind::Html { order } => {
            let slide = run.slide(order)?;
            GenerationInput::Html {
                order,
                full_text: slide.full_text.clone(),
                plan: run.plan.clone().unwrap_or_default(),
            }
        }
        TaskKind::Narrative { order } => {
            let slide = run.slide(order)?;
            GenerationInput::Narrative {
                order,
                full_text: slide.full_text.clone(),
                html: slide.html.clone().unwrap_or_default(),
            }
        }
        TaskKind::Quiz => GenerationInput::Quiz {
            theory: theory(),
            narratives: run.narratives(),
        },
    };
    Some(GenerationRequest {
        topic_id: run.topic_id.clone(),
        input,
    })
}

fn slide_content_id(run: &GenerationRun, order: u32) -> Result<Uuid, TaskError> {
    run.slide(order)
        .map(|s| s.content_id)
        .ok_or_else(|| TaskError::terminal(format!("slide {} is not tracked", order)))
}

impl DispatchLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
        mut retry_rx: mpsc::UnboundedReceiver<RetryDue>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Every handle was dropped.
                        commands_open = false;
                        self.begin_shutdown().await;
                    }
                },
                Some(msg) = worker_rx.recv() => self.handle_worker_message(msg).await,
                Some(due) = retry_rx.recv() => match due {
                    RetryDue::Task { run_id, task_id } => self.retry_due(run_id, task_id).await,
                    RetryDue::FailureMark { run_id, order } => {
                        self.write_failure_mark(run_id, order).await;
                        self.advance(run_id).await;
                    }
                },
                else => break,
            }

            if self.shutting_down && self.runs.is_empty() {
                break;
            }
        }

        self.pool.shutdown().await;
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        info!("Dispatcher stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { topic_id, reply } => {
                let result = self.submit(&topic_id).await;
                let _ = reply.send(result);
            }
            Command::Cancel { run_id, reply } => {
                let result = self.cancel(run_id).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.shutdown_replies.push(reply);
                self.begin_shutdown().await;
            }
        }
    }

    async fn submit(&mut self, topic_id: &str) -> Result<RunHandle, EngineError> {
        if self.shutting_down {
            return Err(EngineError::ShutDown);
        }
        validate_topic_id(topic_id)?;
        if let Some(run_id) = self.active_topics.get(topic_id) {
            return Err(EngineError::Conflict {
                topic_id: topic_id.to_string(),
                run_id: *run_id,
            });
        }
        let topic = self.store.get_topic(topic_id).await?.ok_or_else(|| {
            ValidationError::MissingTopic {
                topic_id: topic_id.to_string(),
            }
        })?;

        let run_id = Uuid::new_v4();
        let run = GenerationRun::new(run_id, topic_id, &topic.title);
        let (status_tx, status_rx) = watch::channel(run.status());
        self.board.write().await.insert(run_id, status_rx.clone());
        self.active_topics.insert(topic_id.to_string(), run_id);
        self.runs.insert(run_id, ActiveRun { run, status_tx });

        info!(%run_id, topic_id, "Generation run submitted");
        emit(
            &self.events,
            RunEvent::RunStarted {
                run_id,
                topic_id: topic_id.to_string(),
            },
        );
        self.advance(run_id).await;

        Ok(RunHandle {
            run_id,
            topic_id: topic_id.to_string(),
            status: status_rx,
        })
    }

    async fn cancel(&mut self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        if let Some(active) = self.runs.get_mut(&run_id) {
            active.run.cancel();
            info!(
                %run_id,
                in_flight = active.run.in_flight,
                "Run cancelled; draining in-flight tasks"
            );
            self.ready.retain(|(r, _)| *r != run_id);
            self.publish(run_id).await;
        }
        self.board
            .read()
            .await
            .get(&run_id)
            .map(|rx| rx.borrow().clone())
            .ok_or(EngineError::RunNotFound { run_id })
    }

    async fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            info!(active_runs = self.runs.len(), "Dispatcher shutting down");
        }
        self.shutting_down = true;
        let run_ids: Vec<Uuid> = self.runs.keys().copied().collect();
        for run_id in run_ids {
            if let Some(active) = self.runs.get_mut(&run_id) {
                active.run.cancel();
            }
            self.ready.retain(|(r, _)| *r != run_id);
            self.publish(run_id).await;
        }
    }

    /// Queue every newly eligible task of a run, run the skeleton step
    /// inline, hand ready work to idle workers and publish the new status.
    async fn advance(&mut self, run_id: Uuid) {
        loop {
            let Some(active) = self.runs.get_mut(&run_id) else {
                return;
            };
            let eligible = PhaseGate::eligible_tasks(&active.run);
            if eligible.is_empty() {
                break;
            }

            let mut inline = Vec::new();
            for task_id in eligible {
                let Some(node) = active.run.node_mut(task_id) else {
                    continue;
                };
                if node.task.kind.uses_worker() {
                    node.status = TaskStatus::Queued;
                    self.ready.push_back((run_id, task_id));
                } else {
                    node.status = TaskStatus::Running;
                    inline.push(task_id);
                }
            }
            for task_id in inline {
                self.persist_skeletons(run_id, task_id).await;
            }
        }

        self.dispatch_ready();
        self.check_stalled(run_id);
        self.publish(run_id).await;
    }

    /// Assign queued tasks to idle workers in readiness order.
    fn dispatch_ready(&mut self) {
        while self.idle > 0 {
            let Some((run_id, task_id)) = self.ready.pop_front() else {
                break;
            };
            let Some(active) = self.runs.get_mut(&run_id) else {
                continue;
            };
            let run = &mut active.run;
            let Some(kind) = run
                .node(task_id)
                .filter(|n| n.status == TaskStatus::Queued)
                .map(|n| n.task.kind)
            else {
                continue;
            };
            let Some(request) = build_request(run, kind) else {
                continue;
            };
            let Some(node) = run.node_mut(task_id) else {
                continue;
            };
            node.status = TaskStatus::Running;
            node.attempts += 1;
            let assignment = Assignment {
                run_id,
                task: node.task.clone(),
                request,
                attempt: node.attempts,
            };

            if let Err(e) = self.pool.assign(assignment) {
                warn!(%run_id, task = %kind, error = %e, "Worker pool rejected assignment");
                node.status = TaskStatus::Queued;
                node.attempts -= 1;
                self.ready.push_front((run_id, task_id));
                break;
            }
            run.in_flight += 1;
            self.idle -= 1;
            debug!(%run_id, task = %kind, idle = self.idle, "Task assigned");
        }
    }

    async fn handle_worker_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Started {
                worker,
                run_id,
                task,
                attempt,
                at,
            } => {
                debug!(%run_id, task = %task.kind, worker, attempt, started_at = %at, "Task started");
                emit(
                    &self.events,
                    RunEvent::TaskStarted {
                        run_id,
                        task: task.kind,
                        worker,
                        attempt,
                    },
                );
            }
            WorkerMessage::Finished(report) => self.handle_report(report).await,
        }
    }

    async fn handle_report(&mut self, report: WorkerReport) {
        self.idle += 1;
        let run_id = report.run_id;
        let task_id = report.task.id;
        let Some(active) = self.runs.get_mut(&run_id) else {
            warn!(%run_id, "Report for unknown run dropped");
            self.dispatch_ready();
            return;
        };
        active.run.in_flight = active.run.in_flight.saturating_sub(1);
        debug!(
            %run_id,
            task = %report.task.kind,
            worker = report.worker,
            attempt = report.attempt,
            elapsed_ms = report.elapsed.as_millis() as u64,
            ok = report.result.is_ok(),
            "Task finished"
        );

        let outcome = match report.result {
            Ok(output) => self.persist_output(run_id, &report.task, output).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => self.complete_task(run_id, task_id),
            Err(err) => self.handle_task_error(run_id, task_id, err).await,
        }
        self.advance(run_id).await;
    }

    /// Write a task's output through the store. Validation failures of the
    /// output are terminal; store failures are retryable.
    async fn persist_output(
        &mut self,
        run_id: Uuid,
        task: &GenerationTask,
        output: String,
    ) -> Result<(), TaskError> {
        let Some(active) = self.runs.get_mut(&run_id) else {
            return Ok(());
        };
        let run = &mut active.run;

        match task.kind {
            TaskKind::Theory => {
                if output.trim().is_empty() {
                    return Err(TaskError::terminal("theory output is empty"));
                }
                self.store.set_theory(&run.topic_id, &output).await?;
                run.theory = Some(output);
            }
            TaskKind::Plan => {
                ensure_plain_text("plan_snapshot", &output)
                    .map_err(|e| TaskError::terminal(e.to_string()))?;
                run.plan = Some(output);
            }
            TaskKind::SkeletonPersist => {}
            TaskKind::Html { order } => {
                let content_id = slide_content_id(run, order)?;
                self.store.update_html(content_id, &output).await?;
                run.record_html(order, output);
            }
            TaskKind::Narrative { order } => {
                let content_id = slide_content_id(run, order)?;
                self.store.update_narrative(content_id, &output).await?;
                run.record_narrative(order, output);
            }
            TaskKind::Quiz => {
                let payload: serde_json::Value = serde_json::from_str(output.trim())
                    .map_err(|e| TaskError::terminal(format!("quiz output is not JSON: {}", e)))?;
                self.store.upsert_quiz(&run.topic_id, payload).await?;
            }
        }
        Ok(())
    }

    /// Split the generated theory and upsert one skeleton per fragment.
    async fn persist_skeletons(&mut self, run_id: Uuid, task_id: TaskId) {
        let result = {
            let Some(active) = self.runs.get_mut(&run_id) else {
                return;
            };
            let run = &mut active.run;
            if let Some(node) = run.node_mut(task_id) {
                node.attempts += 1;
            }
            let theory = run.theory.clone().unwrap_or_default();
            let plan = run.plan.clone().unwrap_or_default();
            let fragments: Vec<Fragment> =
                split_theory(&theory, self.config.max_fragment_chars)
                    .into_iter()
                    .map(|text| Fragment::new(text, plan.as_str()))
                    .collect();
            self.store.upsert_skeletons(&run.topic_id, &fragments).await
        };

        match result {
            Ok(units) => {
                if let Some(active) = self.runs.get_mut(&run_id) {
                    active.run.expand_slides(&units);
                    info!(%run_id, slides = units.len(), "Skeletons persisted");
                    emit(
                        &self.events,
                        RunEvent::SlidesPersisted {
                            run_id,
                            count: units.len(),
                        },
                    );
                }
                self.complete_task(run_id, task_id);
            }
            Err(e) => self.handle_task_error(run_id, task_id, e.into()).await,
        }
    }

    fn complete_task(&mut self, run_id: Uuid, task_id: TaskId) {
        let Some(node) = self
            .runs
            .get_mut(&run_id)
            .and_then(|a| a.run.node_mut(task_id))
        else {
            return;
        };
        node.status = TaskStatus::Completed;
        let kind = node.task.kind;
        debug!(%run_id, task = %kind, attempts = node.attempts, "Task completed");
        emit(&self.events, RunEvent::TaskCompleted { run_id, task: kind });
    }

    async fn handle_task_error(&mut self, run_id: Uuid, task_id: TaskId, err: TaskError) {
        let Some(active) = self.runs.get_mut(&run_id) else {
            return;
        };
        let run = &mut active.run;
        let accepts_work = run.accepts_work();
        let Some(node) = run.node_mut(task_id) else {
            return;
        };
        let kind = node.task.kind;
        let attempts = node.attempts;

        if err.is_retryable() && accepts_work && self.config.retry.allows_retry(attempts) {
            node.status = TaskStatus::RetryWait;
            let delay = self.config.retry.delay_for(attempts);
            warn!(
                %run_id,
                task = %kind,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                reason = err.reason(),
                "Task failed; retrying"
            );
            emit(
                &self.events,
                RunEvent::TaskRetrying {
                    run_id,
                    task: kind,
                    attempt: attempts,
                    delay_ms: delay.as_millis() as u64,
                    reason: err.reason().to_string(),
                },
            );
            schedule(&self.retry_tx, delay, RetryDue::Task { run_id, task_id });
            return;
        }

        if err.is_retryable() && !accepts_work {
            node.status = TaskStatus::Cancelled;
            debug!(%run_id, task = %kind, "Retry skipped for stopped run");
            return;
        }

        let reason = err.reason().to_string();
        run.record_failure(task_id, &reason);
        emit(
            &self.events,
            RunEvent::TaskFailed {
                run_id,
                task: kind,
                reason: reason.clone(),
            },
        );

        match kind {
            TaskKind::Html { order } | TaskKind::Narrative { order } => {
                warn!(%run_id, task = %kind, attempts, reason = %reason, "Slide failed; skipping");
                run.record_slide_failure(order);
                run.queue_failure_mark(order, kind, &reason);
                self.write_failure_mark(run_id, order).await;
            }
            TaskKind::Theory | TaskKind::Plan | TaskKind::SkeletonPersist | TaskKind::Quiz => {
                error!(%run_id, task = %kind, attempts, reason = %reason, "Run aborted");
                run.abort(&format!("{} failed: {}", kind, reason));
            }
        }
    }

    /// Move a failed slide to `failed` in the store. Backend errors are
    /// retried on the task backoff schedule; once the budget is spent the
    /// unrecorded failure is reported in the run status.
    async fn write_failure_mark(&mut self, run_id: Uuid, order: u32) {
        let Some(active) = self.runs.get_mut(&run_id) else {
            return;
        };
        let run = &mut active.run;
        let Some(mark) = run.failure_mark_mut(order) else {
            return;
        };
        mark.attempts += 1;
        let (content_id, attempts) = (mark.content_id, mark.attempts);
        let reason = mark.reason.clone();

        let err = match self.store.mark_failed(content_id, &reason).await {
            Ok(_) => {
                run.clear_failure_mark(order);
                return;
            }
            Err(e) => TaskError::from(e),
        };

        if err.is_retryable() && self.config.retry.allows_retry(attempts) {
            let delay = self.config.retry.delay_for(attempts);
            warn!(
                %run_id,
                %content_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = err.reason(),
                "Could not record slide failure; retrying"
            );
            schedule(&self.retry_tx, delay, RetryDue::FailureMark { run_id, order });
        } else {
            error!(
                %run_id,
                %content_id,
                attempts,
                error = err.reason(),
                "Slide failure not recorded in store"
            );
            run.abandon_failure_mark(order, err.reason());
        }
    }

    async fn retry_due(&mut self, run_id: Uuid, task_id: TaskId) {
        let Some(active) = self.runs.get_mut(&run_id) else {
            return;
        };
        let accepts_work = active.run.accepts_work();
        match active.run.node_mut(task_id) {
            Some(node) if node.status == TaskStatus::RetryWait => {
                // Back to the gate; eligibility still holds.
                node.status = if accepts_work {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Cancelled
                };
            }
            _ => return,
        }
        self.advance(run_id).await;
    }

    /// Fail a run that can make no further progress.
    fn check_stalled(&mut self, run_id: Uuid) {
        let Some(active) = self.runs.get_mut(&run_id) else {
            return;
        };
        let run = &mut active.run;
        if run.accepts_work()
            && run.in_flight == 0
            && !run.has_waiting_tasks()
            && !run.is_finished()
        {
            error!(%run_id, "Run stalled with no eligible tasks");
            run.abort("no eligible tasks remain");
        }
    }

    /// Push the latest status to watchers; retire the run if it finished.
    async fn publish(&mut self, run_id: Uuid) {
        let Some(active) = self.runs.get_mut(&run_id) else {
            return;
        };
        if active.run.is_finished() && active.run.finished_at.is_none() {
            active.run.finished_at = Some(Utc::now());
        }
        let status = active.run.status();
        active.status_tx.send_replace(status.clone());
        if !status.state.is_terminal() {
            return;
        }

        if let Some(finished) = self.runs.remove(&run_id)
            && let Some(reason) = finished.run.abort_reason()
        {
            warn!(%run_id, reason, "Run failed");
        }
        self.active_topics.remove(&status.topic_id);
        self.ready.retain(|(r, _)| *r != run_id);
        info!(
            %run_id,
            topic_id = %status.topic_id,
            state = %status.state,
            summary = %status.summary(),
            "Run finished"
        );

        self.finished.push_back(run_id);
        while self.finished.len() > self.config.retain_finished_runs {
            if let Some(old) = self.finished.pop_front() {
                self.board.write().await.remove(&old);
            }
        }
        emit(
            &self.events,
            RunEvent::RunFinished {
                run_id,
                status: Box::new(status),
            },
        );
    }
}
