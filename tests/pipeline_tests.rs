//! End-to-end scenarios for the generation pipeline
//!
//! A scripted generator stands in for the generation service. Runs execute
//! against a `MemoryStore` and are observed through `RunEvent`s and the
//! store contents.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lessonforge::content::{ContentUnit, Fragment, SlideStatus, Topic};
use lessonforge::engine::{
    Dispatcher, DispatcherConfig, GenerationInput, GenerationRequest, Generator, QuizState,
    RetryPolicy, RunEvent, RunState, RunStatus, TaskKind,
};
use lessonforge::errors::{EngineError, StoreError, TaskError, ValidationError};
use lessonforge::store::{ArtifactStore, MemoryStore};

const THREE_PARAGRAPHS: &str = "Alpha one.\n\nBravo two.\n\nCharlie three.";
const FIVE_PARAGRAPHS: &str = "Alpha one.\n\nBravo two.\n\nCharlie three.\n\nDelta four.\n\nEcho five.";

// =============================================================================
// Scripted generator
// =============================================================================

fn label(input: &GenerationInput) -> String {
    match input {
        GenerationInput::Theory { .. } => "theory".to_string(),
        GenerationInput::Plan { .. } => "plan".to_string(),
        GenerationInput::Html { order, .. } => format!("html[{}]", order),
        GenerationInput::Narrative { order, .. } => format!("narrative[{}]", order),
        GenerationInput::Quiz { .. } => "quiz".to_string(),
    }
}

struct Scripted {
    theory: Mutex<String>,
    plan: String,
    quiz: Option<String>,
    terminal: HashSet<String>,
    panics: HashSet<String>,
    /// Remaining retryable failures per task label
    retryable: Mutex<HashMap<String, u32>>,
    delay: Duration,
    html_delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(theory: &str) -> Self {
        Self {
            theory: Mutex::new(theory.to_string()),
            plan: "- one idea per slide\n- short sentences".to_string(),
            quiz: None,
            terminal: HashSet::new(),
            panics: HashSet::new(),
            retryable: Mutex::new(HashMap::new()),
            delay: Duration::from_millis(5),
            html_delay: Duration::from_millis(5),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, task: &str) -> Self {
        self.terminal.insert(task.to_string());
        self
    }

    fn panicking(mut self, task: &str) -> Self {
        self.panics.insert(task.to_string());
        self
    }

    fn flaky(self, task: &str, failures: u32) -> Self {
        self.retryable
            .lock()
            .unwrap()
            .insert(task.to_string(), failures);
        self
    }

    fn set_theory(&self, theory: &str) {
        *self.theory.lock().unwrap() = theory.to_string();
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for Scripted {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, TaskError> {
        let label = label(&request.input);
        self.calls.lock().unwrap().push(label.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = if label.starts_with("html") {
            self.html_delay
        } else {
            self.delay
        };
        tokio::time::sleep(delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.panics.contains(&label) {
            panic!("scripted panic in {}", label);
        }
        if self.terminal.contains(&label) {
            return Err(TaskError::terminal(format!("{} rejected", label)));
        }
        {
            let mut retryable = self.retryable.lock().unwrap();
            if let Some(remaining) = retryable.get_mut(&label)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(TaskError::retryable(format!("{} rate limited", label)));
            }
        }

        Ok(match &request.input {
            GenerationInput::Theory { .. } => self.theory.lock().unwrap().clone(),
            GenerationInput::Plan { .. } => self.plan.clone(),
            GenerationInput::Html { order, full_text, .. } => {
                format!("<section data-order=\"{}\">{}</section>", order, full_text)
            }
            GenerationInput::Narrative { order, .. } => format!("Narration {}", order),
            GenerationInput::Quiz { narratives, .. } => match &self.quiz {
                Some(raw) => raw.clone(),
                None => serde_json::json!({"questions": narratives.len()}).to_string(),
            },
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

fn config(workers: usize) -> DispatcherConfig {
    DispatcherConfig::default()
        .with_workers(workers)
        .with_max_fragment_chars(10)
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
        .with_task_timeout(Duration::from_secs(5))
}

struct Harness {
    store: Arc<MemoryStore>,
    generator: Arc<Scripted>,
    dispatcher: Dispatcher,
}

async fn harness(generator: Scripted, workers: usize) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.put_topic("bio-1", "Cells").await.unwrap();
    let generator = Arc::new(generator);
    let dispatcher = Dispatcher::start(
        config(workers),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
        Arc::clone(&generator) as Arc<dyn Generator>,
    );
    Harness {
        store,
        generator,
        dispatcher,
    }
}

/// Start a dispatcher over any store, with "bio-1" seeded.
async fn dispatcher_over(
    store: Arc<dyn ArtifactStore>,
    generator: Scripted,
    config: DispatcherConfig,
) -> (Dispatcher, Arc<Scripted>) {
    store.put_topic("bio-1", "Cells").await.unwrap();
    let generator = Arc::new(generator);
    let dispatcher = Dispatcher::start(
        config,
        store,
        Arc::clone(&generator) as Arc<dyn Generator>,
    );
    (dispatcher, generator)
}

/// Submit a run and collect its events until it finishes.
async fn run_to_end(dispatcher: &Dispatcher, topic_id: &str) -> (RunStatus, Vec<RunEvent>) {
    let mut rx = dispatcher.subscribe();
    let handle = dispatcher.submit(topic_id).await.unwrap();
    let collect = async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.expect("event stream closed early");
            if event.run_id() != handle.run_id {
                continue;
            }
            let finished = matches!(event, RunEvent::RunFinished { .. });
            events.push(event);
            if finished {
                return events;
            }
        }
    };
    let events = tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("run did not finish in time");
    (handle.wait().await, events)
}

fn position(events: &[RunEvent], pred: impl Fn(&RunEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

fn started(task: TaskKind) -> impl Fn(&RunEvent) -> bool {
    move |e| matches!(e, RunEvent::TaskStarted { task: t, .. } if *t == task)
}

fn completed(task: TaskKind) -> impl Fn(&RunEvent) -> bool {
    move |e| matches!(e, RunEvent::TaskCompleted { task: t, .. } if *t == task)
}

// =============================================================================
// Happy path and ordering
// =============================================================================

mod happy_path {
    use super::*;

    #[tokio::test]
    async fn test_three_fragments_complete() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS), 5).await;
        let (status, events) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.slides_total, 3);
        assert_eq!(status.slides_ready, 3);
        assert_eq!(status.slides_failed, 0);
        assert_eq!(status.quiz, QuizState::Ready);
        assert_eq!(status.completed_count, status.total_tasks);
        assert_eq!(status.completion_percentage, 100.0);
        assert!(status.failed_tasks.is_empty());
        assert!(status.finished_at.is_some());

        let topic = h.store.get_topic("bio-1").await.unwrap().unwrap();
        assert_eq!(topic.theory_content, THREE_PARAGRAPHS);

        let slides = h.store.list_slides("bio-1").await.unwrap();
        assert_eq!(slides.len(), 3);
        for (order, unit) in slides.iter().enumerate() {
            let slide = unit.slide().unwrap();
            assert_eq!(slide.order as usize, order);
            assert_eq!(slide.status, SlideStatus::NarrativeReady);
            assert!(THREE_PARAGRAPHS.contains(slide.full_text.as_str()));
            assert_eq!(slide.narrative_text, format!("Narration {}", order));
            assert!(slide.rendered_html.contains(&slide.full_text));
        }

        let quiz = h.store.get_quiz("bio-1").await.unwrap().unwrap();
        assert_eq!(quiz.quiz().unwrap().payload["questions"], 3);

        assert!(matches!(events.first(), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(events.last(), Some(RunEvent::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_quiz_starts_after_every_narrative() {
        let h = harness(Scripted::new(FIVE_PARAGRAPHS), 5).await;
        let (status, events) = run_to_end(&h.dispatcher, "bio-1").await;
        assert_eq!(status.state, RunState::Completed);

        let quiz_start = position(&events, started(TaskKind::Quiz)).unwrap();
        for order in 0..5 {
            let narrative_done =
                position(&events, completed(TaskKind::Narrative { order })).unwrap();
            assert!(narrative_done < quiz_start, "narrative {} after quiz", order);
        }
        assert_eq!(h.generator.calls().last().map(String::as_str), Some("quiz"));
    }

    #[tokio::test]
    async fn test_phase_order_is_respected() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS), 5).await;
        let (_, events) = run_to_end(&h.dispatcher, "bio-1").await;

        let theory_done = position(&events, completed(TaskKind::Theory)).unwrap();
        let plan_start = position(&events, started(TaskKind::Plan)).unwrap();
        let plan_done = position(&events, completed(TaskKind::Plan)).unwrap();
        let persisted = position(&events, |e| matches!(e, RunEvent::SlidesPersisted { .. }))
            .unwrap();
        assert!(theory_done < plan_start);
        assert!(plan_done < persisted);

        for order in 0..3 {
            let html_start = position(&events, started(TaskKind::Html { order })).unwrap();
            let html_done = position(&events, completed(TaskKind::Html { order })).unwrap();
            let narrative_start =
                position(&events, started(TaskKind::Narrative { order })).unwrap();
            assert!(persisted < html_start);
            assert!(html_done < narrative_start);
        }
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_pool_size() {
        let mut generator = Scripted::new(FIVE_PARAGRAPHS);
        generator.delay = Duration::from_millis(20);
        generator.html_delay = Duration::from_millis(20);
        let h = harness(generator, 2).await;
        assert_eq!(h.dispatcher.workers(), 2);

        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;
        assert_eq!(status.state, RunState::Completed);
        let peak = h.generator.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency {} exceeds pool size", peak);
        assert!(peak >= 1);
    }
}

// =============================================================================
// Failures and retries
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_failed_html_skips_narrative_and_quiz_still_runs() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS).failing("html[1]"), 5).await;
        let (status, events) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.slides_ready, 2);
        assert_eq!(status.slides_failed, 1);
        assert_eq!(status.quiz, QuizState::Ready);
        assert_eq!(status.failed_tasks.len(), 1);
        assert_eq!(status.failed_tasks[0].task, TaskKind::Html { order: 1 });

        assert!(position(&events, started(TaskKind::Narrative { order: 1 })).is_none());
        assert!(!h.generator.calls().contains(&"narrative[1]".to_string()));

        let slides = h.store.list_slides("bio-1").await.unwrap();
        let failed = slides[1].slide().unwrap();
        assert_eq!(failed.status, SlideStatus::Failed);
        assert!(failed.failure.as_deref().unwrap().contains("html[1] rejected"));
        assert!(h.store.get_quiz("bio-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_narrative_resolves_slide() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS).failing("narrative[2]"), 5).await;
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.slides_ready, 2);
        assert_eq!(status.slides_failed, 1);

        let slides = h.store.list_slides("bio-1").await.unwrap();
        let failed = slides[2].slide().unwrap();
        assert_eq!(failed.status, SlideStatus::Failed);
        // The HTML written before the failure is kept.
        assert!(!failed.rendered_html.is_empty());
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS).flaky("narrative[0]", 2), 5).await;
        let (status, events) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.slides_ready, 3);
        let retries = events
            .iter()
            .filter(|e| matches!(e, RunEvent::TaskRetrying { .. }))
            .count();
        assert_eq!(retries, 2);
        let narrative_calls = h
            .generator
            .calls()
            .iter()
            .filter(|c| c.as_str() == "narrative[0]")
            .count();
        assert_eq!(narrative_calls, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_slide_only() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS).flaky("html[2]", u32::MAX), 5).await;
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.slides_failed, 1);
        assert_eq!(status.failed_tasks[0].task, TaskKind::Html { order: 2 });
        assert_eq!(status.failed_tasks[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_generator_panic_fails_the_slide() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS).panicking("html[0]"), 5).await;
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.slides_failed, 1);
        assert!(status.failed_tasks[0].error.contains("panicked"));
    }

    #[tokio::test]
    async fn test_theory_failure_fails_run() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS).failing("theory"), 5).await;
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.slides_total, 0);
        assert!(h.store.list_slides("bio-1").await.unwrap().is_empty());
        assert!(!h.generator.calls().contains(&"plan".to_string()));
    }

    #[tokio::test]
    async fn test_empty_theory_fails_run() {
        let h = harness(Scripted::new("   \n\n  "), 5).await;
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;
        assert_eq!(status.state, RunState::Failed);
        assert!(status.failed_tasks[0].error.contains("empty"));
    }

    #[tokio::test]
    async fn test_structured_plan_fails_run() {
        let mut generator = Scripted::new(THREE_PARAGRAPHS);
        generator.plan = r#"{"slides": [1, 2, 3]}"#.to_string();
        let h = harness(generator, 5).await;
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.failed_tasks[0].task, TaskKind::Plan);
        assert!(h.store.list_slides("bio-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_json_quiz_fails_run() {
        let mut generator = Scripted::new(THREE_PARAGRAPHS);
        generator.quiz = Some("Q1: what is a cell?".to_string());
        let h = harness(generator, 5).await;
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.quiz, QuizState::Failed);
        assert_eq!(status.slides_ready, 3);
        assert!(h.store.get_quiz("bio-1").await.unwrap().is_none());
    }
}

// =============================================================================
// Regeneration
// =============================================================================

mod regeneration {
    use super::*;

    #[tokio::test]
    async fn test_regeneration_is_idempotent() {
        let h = harness(Scripted::new(FIVE_PARAGRAPHS), 5).await;

        let (first, _) = run_to_end(&h.dispatcher, "bio-1").await;
        assert_eq!(first.state, RunState::Completed);
        let first_ids: Vec<_> = h
            .store
            .list_slides("bio-1")
            .await
            .unwrap()
            .iter()
            .map(|u| u.id)
            .collect();
        let first_quiz = h.store.get_quiz("bio-1").await.unwrap().unwrap().id;

        let (second, _) = run_to_end(&h.dispatcher, "bio-1").await;
        assert_eq!(second.state, RunState::Completed);
        assert_ne!(first.run_id, second.run_id);

        let slides = h.store.list_slides("bio-1").await.unwrap();
        assert_eq!(slides.len(), 5);
        let second_ids: Vec<_> = slides.iter().map(|u| u.id).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(h.store.get_quiz("bio-1").await.unwrap().unwrap().id, first_quiz);
    }

    #[tokio::test]
    async fn test_regeneration_shrinks_slide_set() {
        let h = harness(Scripted::new(FIVE_PARAGRAPHS), 5).await;
        run_to_end(&h.dispatcher, "bio-1").await;
        assert_eq!(h.store.list_slides("bio-1").await.unwrap().len(), 5);

        h.generator.set_theory(THREE_PARAGRAPHS);
        let (status, _) = run_to_end(&h.dispatcher, "bio-1").await;
        assert_eq!(status.slides_total, 3);

        let slides = h.store.list_slides("bio-1").await.unwrap();
        assert_eq!(slides.len(), 3);
        let orders: Vec<u32> = slides.iter().map(|u| u.slide().unwrap().order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }
}

// =============================================================================
// Dispatcher API
// =============================================================================

mod dispatcher_api {
    use super::*;

    #[tokio::test]
    async fn test_missing_and_empty_topic_rejected() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS), 5).await;

        let err = h.dispatcher.submit("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::MissingTopic { .. })
        ));

        let err = h.dispatcher.submit("  ").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::EmptyTopicId)
        ));
    }

    #[tokio::test]
    async fn test_second_submit_conflicts_while_running() {
        let mut generator = Scripted::new(THREE_PARAGRAPHS);
        generator.delay = Duration::from_millis(50);
        let h = harness(generator, 5).await;

        let handle = h.dispatcher.submit("bio-1").await.unwrap();
        assert_eq!(handle.poll().state, RunState::Running);

        match h.dispatcher.submit("bio-1").await {
            Err(EngineError::Conflict { topic_id, run_id }) => {
                assert_eq!(topic_id, "bio-1");
                assert_eq!(run_id, handle.run_id);
            }
            other => panic!("Expected Conflict, got {:?}", other.map(|h| h.run_id)),
        }

        let status = handle.wait().await;
        assert_eq!(status.state, RunState::Completed);
        // Finished runs free the topic.
        let again = h.dispatcher.submit("bio-1").await.unwrap();
        assert_eq!(again.wait().await.state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_poll_tracks_progress() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS), 5).await;
        let handle = h.dispatcher.submit("bio-1").await.unwrap();

        let polled = h.dispatcher.poll(handle.run_id).await.unwrap();
        assert_eq!(polled.run_id, handle.run_id);
        assert_eq!(polled.topic_id, "bio-1");

        let done = handle.wait().await;
        let polled = h.dispatcher.poll(handle.run_id).await.unwrap();
        assert_eq!(polled.state, RunState::Completed);
        assert_eq!(polled.completed_count, done.completed_count);
    }

    #[tokio::test]
    async fn test_poll_unknown_run() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS), 5).await;
        let err = h.dispatcher.poll(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound { .. }));
        let err = h.dispatcher.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_and_skips_quiz() {
        let mut generator = Scripted::new(THREE_PARAGRAPHS);
        generator.html_delay = Duration::from_millis(200);
        let h = harness(generator, 5).await;

        let mut rx = h.dispatcher.subscribe();
        let handle = h.dispatcher.submit("bio-1").await.unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no SlidesPersisted event")
                .unwrap();
            if matches!(event, RunEvent::SlidesPersisted { .. }) {
                break;
            }
        }

        h.dispatcher.cancel(handle.run_id).await.unwrap();
        let status = handle.wait().await;
        assert_eq!(status.state, RunState::Cancelled);
        assert_eq!(status.quiz, QuizState::Pending);

        let calls = h.generator.calls();
        assert!(!calls.iter().any(|c| c.starts_with("narrative")));
        assert!(!calls.contains(&"quiz".to_string()));
        assert!(h.store.get_quiz("bio-1").await.unwrap().is_none());

        // In-flight HTML still landed in the store.
        let slides = h.store.list_slides("bio-1").await.unwrap();
        assert!(
            slides
                .iter()
                .all(|u| u.slide().unwrap().status == SlideStatus::HtmlReady)
        );
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let h = harness(Scripted::new(THREE_PARAGRAPHS), 5).await;
        h.dispatcher.shutdown().await.unwrap();
        let err = h.dispatcher.submit("bio-1").await.unwrap_err();
        assert!(matches!(err, EngineError::ShutDown));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_runs() {
        let mut generator = Scripted::new(THREE_PARAGRAPHS);
        generator.delay = Duration::from_millis(50);
        let h = harness(generator, 5).await;

        let handle = h.dispatcher.submit("bio-1").await.unwrap();
        h.dispatcher.shutdown().await.unwrap();
        let status = handle.wait().await;
        assert_eq!(status.state, RunState::Cancelled);
    }
}

// =============================================================================
// Persistence failures
// =============================================================================

mod persistence {
    use super::*;
    use uuid::Uuid;

    /// `MemoryStore` that fails selected writes.
    #[derive(Default)]
    struct UnreliableStore {
        inner: MemoryStore,
        /// Backend errors still to return from `update_html`
        html_failures: AtomicUsize,
        /// Backend errors still to return from `mark_failed`
        mark_failures: AtomicUsize,
        reject_narratives: bool,
        mark_calls: AtomicUsize,
    }

    fn take_failure(remaining: &AtomicUsize) -> bool {
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl ArtifactStore for UnreliableStore {
        async fn put_topic(&self, topic_id: &str, title: &str) -> Result<Topic, StoreError> {
            self.inner.put_topic(topic_id, title).await
        }

        async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError> {
            self.inner.get_topic(topic_id).await
        }

        async fn set_theory(&self, topic_id: &str, theory: &str) -> Result<Topic, StoreError> {
            self.inner.set_theory(topic_id, theory).await
        }

        async fn upsert_skeletons(
            &self,
            topic_id: &str,
            fragments: &[Fragment],
        ) -> Result<Vec<ContentUnit>, StoreError> {
            self.inner.upsert_skeletons(topic_id, fragments).await
        }

        async fn update_html(
            &self,
            content_id: Uuid,
            html: &str,
        ) -> Result<ContentUnit, StoreError> {
            if take_failure(&self.html_failures) {
                return Err(StoreError::Backend("database is locked".into()));
            }
            self.inner.update_html(content_id, html).await
        }

        async fn update_narrative(
            &self,
            content_id: Uuid,
            text: &str,
        ) -> Result<ContentUnit, StoreError> {
            if self.reject_narratives {
                return Err(StoreError::InvalidTransition {
                    content_id,
                    from: "skeleton".into(),
                    to: "narrative_ready".into(),
                });
            }
            self.inner.update_narrative(content_id, text).await
        }

        async fn mark_failed(
            &self,
            content_id: Uuid,
            reason: &str,
        ) -> Result<ContentUnit, StoreError> {
            self.mark_calls.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.mark_failures) {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.mark_failed(content_id, reason).await
        }

        async fn upsert_quiz(
            &self,
            topic_id: &str,
            payload: serde_json::Value,
        ) -> Result<ContentUnit, StoreError> {
            self.inner.upsert_quiz(topic_id, payload).await
        }

        async fn get_content(&self, content_id: Uuid) -> Result<Option<ContentUnit>, StoreError> {
            self.inner.get_content(content_id).await
        }

        async fn list_slides(&self, topic_id: &str) -> Result<Vec<ContentUnit>, StoreError> {
            self.inner.list_slides(topic_id).await
        }

        async fn get_quiz(&self, topic_id: &str) -> Result<Option<ContentUnit>, StoreError> {
            self.inner.get_quiz(topic_id).await
        }
    }

    async fn statuses(store: &UnreliableStore) -> Vec<SlideStatus> {
        store
            .list_slides("bio-1")
            .await
            .unwrap()
            .iter()
            .map(|u| u.slide().unwrap().status)
            .collect()
    }

    #[tokio::test]
    async fn test_store_write_failure_is_retried() {
        let store = Arc::new(UnreliableStore {
            html_failures: AtomicUsize::new(1),
            ..Default::default()
        });
        let (dispatcher, generator) = dispatcher_over(
            Arc::clone(&store) as Arc<dyn ArtifactStore>,
            Scripted::new(THREE_PARAGRAPHS),
            config(5),
        )
        .await;
        let (status, events) = run_to_end(&dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert!(status.failed_tasks.is_empty());
        let retries: Vec<&RunEvent> = events
            .iter()
            .filter(|e| matches!(e, RunEvent::TaskRetrying { .. }))
            .collect();
        assert_eq!(retries.len(), 1);
        match retries[0] {
            RunEvent::TaskRetrying { task, reason, .. } => {
                assert!(matches!(task, TaskKind::Html { .. }));
                assert!(reason.contains("database is locked"));
            }
            other => panic!("Expected TaskRetrying, got {:?}", other),
        }
        let html_calls = generator
            .calls()
            .iter()
            .filter(|c| c.starts_with("html"))
            .count();
        assert_eq!(html_calls, 4);
        assert_eq!(statuses(&store).await, vec![SlideStatus::NarrativeReady; 3]);
    }

    #[tokio::test]
    async fn test_rejected_write_is_not_retried() {
        let store = Arc::new(UnreliableStore {
            reject_narratives: true,
            ..Default::default()
        });
        let (dispatcher, generator) = dispatcher_over(
            Arc::clone(&store) as Arc<dyn ArtifactStore>,
            Scripted::new(THREE_PARAGRAPHS),
            config(5),
        )
        .await;
        let (status, events) = run_to_end(&dispatcher, "bio-1").await;

        assert!(
            !events
                .iter()
                .any(|e| matches!(e, RunEvent::TaskRetrying { .. }))
        );
        let narrative_calls = generator
            .calls()
            .iter()
            .filter(|c| c.starts_with("narrative"))
            .count();
        assert_eq!(narrative_calls, 3);
        assert_eq!(status.slides_failed, 3);
        assert!(status.failed_tasks.iter().all(|f| f.attempts == 1));
    }

    #[tokio::test]
    async fn test_slide_failure_record_is_retried() {
        let store = Arc::new(UnreliableStore {
            mark_failures: AtomicUsize::new(1),
            ..Default::default()
        });
        let (dispatcher, _) = dispatcher_over(
            Arc::clone(&store) as Arc<dyn ArtifactStore>,
            Scripted::new(THREE_PARAGRAPHS).failing("html[1]"),
            config(5),
        )
        .await;
        let (status, _) = run_to_end(&dispatcher, "bio-1").await;

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.slides_failed, 1);
        assert_eq!(status.failed_tasks.len(), 1);
        assert_eq!(store.mark_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            statuses(&store).await,
            vec![
                SlideStatus::NarrativeReady,
                SlideStatus::Failed,
                SlideStatus::NarrativeReady
            ]
        );
    }

    #[tokio::test]
    async fn test_unrecorded_slide_failure_is_reported() {
        let store = Arc::new(UnreliableStore {
            mark_failures: AtomicUsize::new(usize::MAX),
            ..Default::default()
        });
        let (dispatcher, _) = dispatcher_over(
            Arc::clone(&store) as Arc<dyn ArtifactStore>,
            Scripted::new(THREE_PARAGRAPHS).failing("html[1]"),
            config(5),
        )
        .await;
        let (status, _) = run_to_end(&dispatcher, "bio-1").await;

        assert_eq!(store.mark_calls.load(Ordering::SeqCst), 3);
        assert_eq!(status.failed_tasks.len(), 2);
        let unrecorded = &status.failed_tasks[1];
        assert_eq!(unrecorded.task, TaskKind::Html { order: 1 });
        assert_eq!(unrecorded.attempts, 3);
        assert!(unrecorded.error.contains("not recorded"));
        assert!(unrecorded.error.contains("disk full"));
        assert_eq!(statuses(&store).await[1], SlideStatus::Skeleton);
    }
}

// =============================================================================
// Finished run retention
// =============================================================================

mod retention {
    use super::*;

    #[tokio::test]
    async fn test_oldest_finished_run_is_evicted() {
        let (dispatcher, _) = dispatcher_over(
            Arc::new(MemoryStore::new()),
            Scripted::new(THREE_PARAGRAPHS),
            config(5).with_retain_finished_runs(1),
        )
        .await;

        let (first, _) = run_to_end(&dispatcher, "bio-1").await;
        assert_eq!(
            dispatcher.poll(first.run_id).await.unwrap().state,
            RunState::Completed
        );

        let (second, _) = run_to_end(&dispatcher, "bio-1").await;
        let err = dispatcher.poll(first.run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound { run_id } if run_id == first.run_id));
        assert_eq!(
            dispatcher.poll(second.run_id).await.unwrap().state,
            RunState::Completed
        );
    }
}
