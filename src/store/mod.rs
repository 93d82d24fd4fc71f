//! Artifact persistence.
//!
//! `ArtifactStore` is the only shared mutable resource of the engine. Every
//! mutation is one of the narrow operations below, each scoped to a single
//! topic or ContentUnit, and each idempotent under repeated identical calls.
//!
//! | Backend        | Use                                                  |
//! |----------------|------------------------------------------------------|
//! | `MemoryStore`  | tests and ephemeral in-process runs                  |
//! | `LibsqlStore`  | the service; local file or `:memory:` libSQL database |

mod libsql;
mod memory;

pub use self::libsql::LibsqlStore;
pub use self::memory::MemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::content::{ContentUnit, Fragment, Topic};
use crate::errors::StoreError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create a topic, or rename it if it exists. Theory is left untouched.
    async fn put_topic(&self, topic_id: &str, title: &str) -> Result<Topic, StoreError>;

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError>;

    /// Replace the topic's theory wholesale (last write wins).
    async fn set_theory(&self, topic_id: &str, theory: &str) -> Result<Topic, StoreError>;

    /// Replace the slide set keyed by order: overwrite existing orders, insert
    /// missing ones, delete orders at or beyond `fragments.len()`. Returns the
    /// slides sorted by order.
    async fn upsert_skeletons(
        &self,
        topic_id: &str,
        fragments: &[Fragment],
    ) -> Result<Vec<ContentUnit>, StoreError>;

    /// Patch only the rendered HTML, advancing `skeleton` to `html_ready`.
    async fn update_html(&self, content_id: Uuid, html: &str) -> Result<ContentUnit, StoreError>;

    /// Patch only the narrative, advancing `html_ready` to `narrative_ready`.
    async fn update_narrative(
        &self,
        content_id: Uuid,
        text: &str,
    ) -> Result<ContentUnit, StoreError>;

    /// Move a non-terminal slide to `failed`.
    async fn mark_failed(&self, content_id: Uuid, reason: &str)
    -> Result<ContentUnit, StoreError>;

    /// Replace the topic's quiz; at most one quiz per topic is ever live.
    async fn upsert_quiz(
        &self,
        topic_id: &str,
        payload: serde_json::Value,
    ) -> Result<ContentUnit, StoreError>;

    async fn get_content(&self, content_id: Uuid) -> Result<Option<ContentUnit>, StoreError>;

    async fn list_slides(&self, topic_id: &str) -> Result<Vec<ContentUnit>, StoreError>;

    async fn get_quiz(&self, topic_id: &str) -> Result<Option<ContentUnit>, StoreError>;
}

/// Checks applied by every backend before a skeleton write.
pub(crate) fn check_skeletons(topic: &Topic, fragments: &[Fragment]) -> Result<(), StoreError> {
    crate::content::validate::ensure_substrings(&topic.theory_content, fragments)?;
    Ok(())
}
