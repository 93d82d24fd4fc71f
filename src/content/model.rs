//! Persisted content types: topics and the ContentUnit document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StoreError;

/// Root keys a persisted ContentUnit document may carry. Everything
/// content-specific lives under `content`.
pub const DOCUMENT_ROOT_KEYS: &[&str] = &["id", "topic_id", "content", "created_at", "updated_at"];

/// A study-plan topic owning one block of theory text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub title: String,
    /// Replaced wholesale by the theory phase; never patched.
    #[serde(default)]
    pub theory_content: String,
    pub updated_at: DateTime<Utc>,
}

impl Topic {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            theory_content: String::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Lifecycle of a slide within one generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlideStatus {
    #[default]
    Skeleton,
    HtmlReady,
    NarrativeReady,
    Failed,
}

impl SlideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skeleton => "skeleton",
            Self::HtmlReady => "html_ready",
            Self::NarrativeReady => "narrative_ready",
            Self::Failed => "failed",
        }
    }

    /// Terminal states count as resolved for quiz gating.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NarrativeReady | Self::Failed)
    }
}

impl std::fmt::Display for SlideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One slice of theory text plus the plan it is rendered against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub full_text: String,
    pub plan_snapshot: String,
}

impl Fragment {
    pub fn new(full_text: impl Into<String>, plan_snapshot: impl Into<String>) -> Self {
        Self {
            full_text: full_text.into(),
            plan_snapshot: plan_snapshot.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlideContent {
    pub order: u32,
    pub full_text: String,
    pub plan_snapshot: String,
    #[serde(default)]
    pub rendered_html: String,
    #[serde(default)]
    pub narrative_text: String,
    #[serde(default)]
    pub status: SlideStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl SlideContent {
    pub fn skeleton(order: u32, fragment: &Fragment) -> Self {
        Self {
            order,
            full_text: fragment.full_text.clone(),
            plan_snapshot: fragment.plan_snapshot.clone(),
            rendered_html: String::new(),
            narrative_text: String::new(),
            status: SlideStatus::Skeleton,
            failure: None,
        }
    }

    /// Patch `rendered_html`. Returns whether anything changed.
    ///
    /// `skeleton` advances to `html_ready`; later statuses keep their
    /// position so the state machine never moves backward.
    pub fn apply_html(&mut self, content_id: Uuid, html: &str) -> Result<bool, StoreError> {
        match self.status {
            SlideStatus::Failed => Err(invalid(content_id, self.status, SlideStatus::HtmlReady)),
            SlideStatus::Skeleton => {
                self.rendered_html = html.to_string();
                self.status = SlideStatus::HtmlReady;
                Ok(true)
            }
            SlideStatus::HtmlReady | SlideStatus::NarrativeReady => {
                if self.rendered_html == html {
                    return Ok(false);
                }
                self.rendered_html = html.to_string();
                Ok(true)
            }
        }
    }

    /// Patch `narrative_text`; requires HTML to be in place first.
    pub fn apply_narrative(&mut self, content_id: Uuid, text: &str) -> Result<bool, StoreError> {
        match self.status {
            SlideStatus::Skeleton | SlideStatus::Failed => Err(invalid(
                content_id,
                self.status,
                SlideStatus::NarrativeReady,
            )),
            SlideStatus::HtmlReady => {
                self.narrative_text = text.to_string();
                self.status = SlideStatus::NarrativeReady;
                Ok(true)
            }
            SlideStatus::NarrativeReady => {
                if self.narrative_text == text {
                    return Ok(false);
                }
                self.narrative_text = text.to_string();
                Ok(true)
            }
        }
    }

    pub fn apply_failure(&mut self, content_id: Uuid, reason: &str) -> Result<bool, StoreError> {
        match self.status {
            SlideStatus::NarrativeReady => {
                Err(invalid(content_id, self.status, SlideStatus::Failed))
            }
            SlideStatus::Failed => Ok(false),
            SlideStatus::Skeleton | SlideStatus::HtmlReady => {
                self.status = SlideStatus::Failed;
                self.failure = Some(reason.to_string());
                Ok(true)
            }
        }
    }
}

fn invalid(content_id: Uuid, from: SlideStatus, to: SlideStatus) -> StoreError {
    StoreError::InvalidTransition {
        content_id,
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizContent {
    /// Questions and answers; the schema belongs to the evaluation subsystem.
    pub payload: serde_json::Value,
}

/// The nested content container of a ContentUnit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBody {
    Slide(SlideContent),
    Quiz(QuizContent),
}

impl ContentBody {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Slide(_) => "slide",
            Self::Quiz(_) => "quiz",
        }
    }
}

/// A persisted generated artifact: a slide or the topic's quiz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: Uuid,
    pub topic_id: String,
    pub content: ContentBody,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentUnit {
    pub fn new(topic_id: &str, content: ContentBody) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            topic_id: topic_id.to_string(),
            content,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn slide(&self) -> Option<&SlideContent> {
        match &self.content {
            ContentBody::Slide(slide) => Some(slide),
            ContentBody::Quiz(_) => None,
        }
    }

    pub fn slide_mut(&mut self) -> Result<&mut SlideContent, StoreError> {
        let id = self.id;
        match &mut self.content {
            ContentBody::Slide(slide) => Ok(slide),
            ContentBody::Quiz(_) => Err(StoreError::KindMismatch {
                content_id: id,
                expected: "slide".into(),
            }),
        }
    }

    pub fn quiz(&self) -> Option<&QuizContent> {
        match &self.content {
            ContentBody::Quiz(quiz) => Some(quiz),
            ContentBody::Slide(_) => None,
        }
    }

    pub fn is_quiz(&self) -> bool {
        matches!(self.content, ContentBody::Quiz(_))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Serialize into the stored document shape, rejecting any layout where a
    /// content-specific field escaped the nested container.
    pub fn to_document(&self) -> Result<serde_json::Value, StoreError> {
        let doc = serde_json::to_value(self)?;
        check_layout(&doc)?;
        Ok(doc)
    }
}

/// Verify a document keeps all content-specific fields under `content`.
pub fn check_layout(doc: &serde_json::Value) -> Result<(), StoreError> {
    let root = doc
        .as_object()
        .ok_or_else(|| StoreError::Layout("document root must be an object".into()))?;
    if let Some(key) = root.keys().find(|k| !DOCUMENT_ROOT_KEYS.contains(&k.as_str())) {
        return Err(StoreError::Layout(format!(
            "field '{}' must live inside the content container",
            key
        )));
    }
    if !root.get("content").is_some_and(|c| c.is_object()) {
        return Err(StoreError::Layout("missing content container".into()));
    }
    Ok(())
}
