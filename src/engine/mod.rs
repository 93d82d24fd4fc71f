//! Content-generation orchestration.
//!
//! The engine sequences one topic's pipeline
//!
//! ```text
//! theory -> plan -> skeleton persist -> html(0..n) -> narrative(0..n) -> quiz
//! ```
//!
//! across a fixed pool of workers. `PhaseGate` decides eligibility,
//! `Dispatcher` owns run state and drives transitions, `WorkerPool` executes
//! generation calls through a `Generator`.

pub mod dispatcher;
pub mod gate;
pub mod generator;
pub mod pool;
pub mod retry;
pub mod run;
pub mod state;
pub mod task;

pub use dispatcher::{Dispatcher, DispatcherConfig, RunEvent, RunHandle};
pub use gate::PhaseGate;
pub use generator::{GenerationInput, GenerationRequest, Generator, HttpGenerator};
pub use pool::WorkerPool;
pub use retry::RetryPolicy;
pub use run::GenerationRun;
pub use state::{FailedTask, QuizState, RunPhase, RunState, RunStatus, TaskStatus};
pub use task::{GenerationTask, TaskId, TaskKind, TaskTarget};
