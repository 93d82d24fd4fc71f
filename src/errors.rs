//! Typed error hierarchy for the lessonforge engine.
//!
//! Four enums cover the four layers:
//! - `ValidationError`: malformed input rejected before any work is created
//! - `StoreError`: artifact store failures (persistence)
//! - `TaskError`: a single generation task failed (retryable or terminal)
//! - `EngineError`: dispatcher-level failures surfaced to callers

use thiserror::Error;
use uuid::Uuid;

/// Input rejected at a boundary (HTTP, CLI, dispatcher submit).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Topic id must not be empty")]
    EmptyTopicId,

    #[error("Topic {topic_id} not found")]
    MissingTopic { topic_id: String },

    #[error("Field '{field}' must be plain text, not structured data")]
    StructuredPlan { field: String },

    #[error("Provider/model selection is not accepted here (found '{key}')")]
    ProviderSelector { key: String },

    #[error("Fragment {order} is not a literal substring of the topic theory")]
    NotASubstring { order: usize },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Errors from an `ArtifactStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Topic {topic_id} not found")]
    TopicNotFound { topic_id: String },

    #[error("Content unit {content_id} not found")]
    ContentNotFound { content_id: Uuid },

    #[error("Content unit {content_id} cannot move from {from} to {to}")]
    InvalidTransition {
        content_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Content unit {content_id} is not a {expected}")]
    KindMismatch { content_id: Uuid, expected: String },

    #[error("Document layout violation: {0}")]
    Layout(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<libsql::Error> for StoreError {
    fn from(err: libsql::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Failure of one generation task, classified for the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure (timeout, rate limit, persistence hiccup).
    #[error("retryable: {reason}")]
    Retryable { reason: String },

    /// Unusable output or validation failure; retrying will not help.
    #[error("terminal: {reason}")]
    Terminal { reason: String },
}

impl TaskError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        TaskError::Retryable {
            reason: reason.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        TaskError::Terminal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            TaskError::Retryable { reason } | TaskError::Terminal { reason } => reason,
        }
    }
}

impl From<StoreError> for TaskError {
    /// Backend failures after a successful generation are retried; the other
    /// store errors are deterministic and would fail again.
    fn from(err: StoreError) -> Self {
        let reason = format!("persistence failed: {}", err);
        match err {
            StoreError::Backend(_) => TaskError::retryable(reason),
            _ => TaskError::terminal(reason),
        }
    }
}

/// Errors returned by the dispatcher API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("A generation run ({run_id}) is already active for topic {topic_id}")]
    Conflict { topic_id: String, run_id: Uuid },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: Uuid },

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error("Dispatcher has shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_classification() {
        assert!(TaskError::retryable("rate limited").is_retryable());
        assert!(!TaskError::terminal("malformed").is_retryable());
        assert_eq!(TaskError::terminal("malformed").reason(), "malformed");
    }

    #[test]
    fn store_backend_error_becomes_retryable_task_error() {
        let err: TaskError = StoreError::Backend("disk full".into()).into();
        assert!(err.is_retryable());
        assert!(err.reason().contains("disk full"));
    }

    #[test]
    fn deterministic_store_errors_are_terminal() {
        let id = Uuid::nil();
        let errors = [
            StoreError::ContentNotFound { content_id: id },
            StoreError::InvalidTransition {
                content_id: id,
                from: "skeleton".into(),
                to: "narrative_ready".into(),
            },
            StoreError::KindMismatch {
                content_id: id,
                expected: "slide".into(),
            },
            StoreError::Layout("stray root key".into()),
            StoreError::Validation(ValidationError::EmptyTopicId),
            StoreError::TopicNotFound {
                topic_id: "ghost".into(),
            },
        ];
        for err in errors {
            let task: TaskError = err.into();
            assert!(!task.is_retryable(), "{} should be terminal", task.reason());
        }
    }

    #[test]
    fn conflict_error_mentions_topic() {
        let err = EngineError::Conflict {
            topic_id: "algebra-1".into(),
            run_id: Uuid::nil(),
        };
        assert!(err.to_string().contains("algebra-1"));
    }

    #[test]
    fn validation_converts_into_engine_and_store_errors() {
        let engine: EngineError = ValidationError::EmptyTopicId.into();
        assert!(matches!(engine, EngineError::Validation(_)));

        let store: StoreError = ValidationError::NotASubstring { order: 2 }.into();
        match store {
            StoreError::Validation(ValidationError::NotASubstring { order }) => {
                assert_eq!(order, 2)
            }
            other => panic!("Expected Validation, got {:?}", other),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ValidationError::EmptyTopicId);
        assert_std_error(&StoreError::Backend("x".into()));
        assert_std_error(&TaskError::terminal("x"));
        assert_std_error(&EngineError::ShutDown);
    }
}
