use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ArtifactStore, check_skeletons};
use crate::content::{ContentBody, ContentUnit, Fragment, QuizContent, SlideContent, Topic};
use crate::errors::StoreError;

#[derive(Default)]
struct MemoryState {
    topics: HashMap<String, Topic>,
    units: HashMap<Uuid, ContentUnit>,
}

impl MemoryState {
    fn topic(&self, topic_id: &str) -> Result<&Topic, StoreError> {
        self.topics
            .get(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound {
                topic_id: topic_id.to_string(),
            })
    }

    fn slides(&self, topic_id: &str) -> Vec<ContentUnit> {
        let mut slides: Vec<ContentUnit> = self
            .units
            .values()
            .filter(|u| u.topic_id == topic_id && !u.is_quiz())
            .cloned()
            .collect();
        slides.sort_by_key(|u| u.slide().map(|s| s.order).unwrap_or_default());
        slides
    }

    /// Store a unit after checking its document layout.
    fn write(&mut self, unit: ContentUnit) -> Result<ContentUnit, StoreError> {
        unit.to_document()?;
        self.units.insert(unit.id, unit.clone());
        Ok(unit)
    }

    fn patch_slide<F>(&mut self, content_id: Uuid, patch: F) -> Result<ContentUnit, StoreError>
    where
        F: FnOnce(&mut SlideContent, Uuid) -> Result<bool, StoreError>,
    {
        let mut unit = self
            .units
            .get(&content_id)
            .cloned()
            .ok_or(StoreError::ContentNotFound { content_id })?;
        let changed = patch(unit.slide_mut()?, content_id)?;
        if !changed {
            return Ok(unit);
        }
        unit.touch();
        self.write(unit)
    }
}

/// In-process store backed by hash maps behind one async `RwLock`.
///
/// Each operation holds the write lock for its whole read-modify-write, so
/// concurrent duplicate calls serialize and converge.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn put_topic(&self, topic_id: &str, title: &str) -> Result<Topic, StoreError> {
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .entry(topic_id.to_string())
            .and_modify(|t| {
                t.title = title.to_string();
                t.updated_at = Utc::now();
            })
            .or_insert_with(|| Topic::new(topic_id, title));
        Ok(topic.clone())
    }

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError> {
        Ok(self.state.read().await.topics.get(topic_id).cloned())
    }

    async fn set_theory(&self, topic_id: &str, theory: &str) -> Result<Topic, StoreError> {
        let mut state = self.state.write().await;
        let topic = state
            .topics
            .get_mut(topic_id)
            .ok_or_else(|| StoreError::TopicNotFound {
                topic_id: topic_id.to_string(),
            })?;
        topic.theory_content = theory.to_string();
        topic.updated_at = Utc::now();
        Ok(topic.clone())
    }

    async fn upsert_skeletons(
        &self,
        topic_id: &str,
        fragments: &[Fragment],
    ) -> Result<Vec<ContentUnit>, StoreError> {
        let mut state = self.state.write().await;
        check_skeletons(state.topic(topic_id)?, fragments)?;

        let existing: HashMap<u32, ContentUnit> = state
            .slides(topic_id)
            .into_iter()
            .filter_map(|u| u.slide().map(|s| s.order).map(|order| (order, u)))
            .collect();

        let mut written = Vec::with_capacity(fragments.len());
        for (order, fragment) in fragments.iter().enumerate() {
            let order = order as u32;
            let body = ContentBody::Slide(SlideContent::skeleton(order, fragment));
            let unit = match existing.get(&order) {
                Some(prev) => {
                    let mut unit = prev.clone();
                    unit.content = body;
                    unit.touch();
                    unit
                }
                None => ContentUnit::new(topic_id, body),
            };
            written.push(state.write(unit)?);
        }

        let stale: Vec<Uuid> = existing
            .iter()
            .filter(|(order, _)| **order as usize >= fragments.len())
            .map(|(_, u)| u.id)
            .collect();
        for id in &stale {
            state.units.remove(id);
        }

        debug!(
            topic_id,
            slides = written.len(),
            removed = stale.len(),
            "Skeletons upserted"
        );
        Ok(written)
    }

    async fn update_html(&self, content_id: Uuid, html: &str) -> Result<ContentUnit, StoreError> {
        self.state
            .write()
            .await
            .patch_slide(content_id, |slide, id| slide.apply_html(id, html))
    }

    async fn update_narrative(
        &self,
        content_id: Uuid,
        text: &str,
    ) -> Result<ContentUnit, StoreError> {
        self.state
            .write()
            .await
            .patch_slide(content_id, |slide, id| slide.apply_narrative(id, text))
    }

    async fn mark_failed(
        &self,
        content_id: Uuid,
        reason: &str,
    ) -> Result<ContentUnit, StoreError> {
        self.state
            .write()
            .await
            .patch_slide(content_id, |slide, id| slide.apply_failure(id, reason))
    }

    async fn upsert_quiz(
        &self,
        topic_id: &str,
        payload: serde_json::Value,
    ) -> Result<ContentUnit, StoreError> {
        let mut state = self.state.write().await;
        state.topic(topic_id)?;

        let previous: Vec<ContentUnit> = state
            .units
            .values()
            .filter(|u| u.topic_id == topic_id && u.is_quiz())
            .cloned()
            .collect();
        for unit in &previous {
            state.units.remove(&unit.id);
        }

        let body = ContentBody::Quiz(QuizContent { payload });
        let unit = match previous.into_iter().next() {
            Some(mut prev) => {
                prev.content = body;
                prev.touch();
                prev
            }
            None => ContentUnit::new(topic_id, body),
        };
        state.write(unit)
    }

    async fn get_content(&self, content_id: Uuid) -> Result<Option<ContentUnit>, StoreError> {
        Ok(self.state.read().await.units.get(&content_id).cloned())
    }

    async fn list_slides(&self, topic_id: &str) -> Result<Vec<ContentUnit>, StoreError> {
        Ok(self.state.read().await.slides(topic_id))
    }

    async fn get_quiz(&self, topic_id: &str) -> Result<Option<ContentUnit>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .units
            .values()
            .find(|u| u.topic_id == topic_id && u.is_quiz())
            .cloned())
    }
}
