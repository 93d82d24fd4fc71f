//! libSQL backend.
//!
//! Each ContentUnit is stored as its full JSON document alongside the few
//! columns needed for lookup and uniqueness. Multi-row writes run inside an
//! explicit transaction on the single guarded connection.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ArtifactStore, check_skeletons};
use crate::content::{
    ContentBody, ContentUnit, Fragment, QuizContent, SlideContent, Topic, check_layout,
};
use crate::errors::StoreError;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS topics (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        theory_content TEXT NOT NULL DEFAULT '',
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS content_units (
        id TEXT PRIMARY KEY,
        topic_id TEXT NOT NULL REFERENCES topics(id),
        kind TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        document TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_units_slide_order
        ON content_units(topic_id, position) WHERE kind = 'slide';
    CREATE UNIQUE INDEX IF NOT EXISTS idx_units_single_quiz
        ON content_units(topic_id) WHERE kind = 'quiz';
"#;

/// libSQL-backed `ArtifactStore`.
pub struct LibsqlStore {
    conn: Mutex<Connection>,
}

impl LibsqlStore {
    /// Open (or create) a local database file and apply the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }
        let db = libsql::Builder::new_local(path).build().await?;
        let store = Self::from_connection(db.connect()?).await?;
        info!(path = %path.display(), "Content database opened");
        Ok(store)
    }

    /// In-memory database, used by tests and `--db-path :memory:`.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:").build().await?;
        Self::from_connection(db.connect()?).await
    }

    async fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).await?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// ── Row helpers ─────────────────────────────────────────────────────

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp {:?}: {}", s, e)))
}

fn row_to_topic(row: &libsql::Row) -> Result<Topic, StoreError> {
    let updated: String = row.get(3)?;
    Ok(Topic {
        id: row.get(0)?,
        title: row.get(1)?,
        theory_content: row.get(2)?,
        updated_at: parse_datetime(&updated)?,
    })
}

fn row_to_unit(row: &libsql::Row) -> Result<ContentUnit, StoreError> {
    let document: String = row.get(0)?;
    let value: serde_json::Value = serde_json::from_str(&document)?;
    check_layout(&value)?;
    Ok(serde_json::from_value(value)?)
}

fn position_of(unit: &ContentUnit) -> i64 {
    unit.slide().map(|s| s.order as i64).unwrap_or(0)
}

async fn fetch_topic(conn: &Connection, topic_id: &str) -> Result<Option<Topic>, StoreError> {
    let mut rows = conn
        .query(
            "SELECT id, title, theory_content, updated_at FROM topics WHERE id = ?1",
            params![topic_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_topic(&row)?)),
        None => Ok(None),
    }
}

async fn require_topic(conn: &Connection, topic_id: &str) -> Result<Topic, StoreError> {
    fetch_topic(conn, topic_id)
        .await?
        .ok_or_else(|| StoreError::TopicNotFound {
            topic_id: topic_id.to_string(),
        })
}

async fn fetch_unit(conn: &Connection, content_id: Uuid) -> Result<Option<ContentUnit>, StoreError> {
    let mut rows = conn
        .query(
            "SELECT document FROM content_units WHERE id = ?1",
            params![content_id.to_string()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_unit(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_slides(conn: &Connection, topic_id: &str) -> Result<Vec<ContentUnit>, StoreError> {
    let mut rows = conn
        .query(
            "SELECT document FROM content_units
             WHERE topic_id = ?1 AND kind = 'slide' ORDER BY position",
            params![topic_id],
        )
        .await?;
    let mut slides = Vec::new();
    while let Some(row) = rows.next().await? {
        slides.push(row_to_unit(&row)?);
    }
    Ok(slides)
}

async fn fetch_quiz(conn: &Connection, topic_id: &str) -> Result<Option<ContentUnit>, StoreError> {
    let mut rows = conn
        .query(
            "SELECT document FROM content_units WHERE topic_id = ?1 AND kind = 'quiz'",
            params![topic_id],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_unit(&row)?)),
        None => Ok(None),
    }
}

/// Insert or overwrite one unit by primary key.
async fn write_unit(conn: &Connection, unit: &ContentUnit) -> Result<(), StoreError> {
    let document = serde_json::to_string(&unit.to_document()?)?;
    conn.execute(
        "INSERT INTO content_units (id, topic_id, kind, position, document, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            position = excluded.position,
            document = excluded.document,
            updated_at = excluded.updated_at",
        params![
            unit.id.to_string(),
            unit.topic_id.as_str(),
            unit.content.kind_str(),
            position_of(unit),
            document,
            unit.updated_at.to_rfc3339()
        ],
    )
    .await?;
    Ok(())
}

/// Overwrite slides by order and drop orders beyond the new set.
async fn replace_skeletons(
    conn: &Connection,
    topic_id: &str,
    fragments: &[Fragment],
) -> Result<Vec<ContentUnit>, StoreError> {
    let existing: HashMap<u32, ContentUnit> = fetch_slides(conn, topic_id)
        .await?
        .into_iter()
        .filter_map(|u| u.slide().map(|s| s.order).map(|order| (order, u)))
        .collect();

    conn.execute(
        "DELETE FROM content_units
         WHERE topic_id = ?1 AND kind = 'slide' AND position >= ?2",
        params![topic_id, fragments.len() as i64],
    )
    .await?;

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
        write_unit(conn, &unit).await?;
        written.push(unit);
    }
    Ok(written)
}

impl LibsqlStore {
    async fn patch_slide<F>(&self, content_id: Uuid, patch: F) -> Result<ContentUnit, StoreError>
    where
        F: FnOnce(&mut SlideContent, Uuid) -> Result<bool, StoreError>,
    {
        let conn = self.conn.lock().await;
        let mut unit = fetch_unit(&conn, content_id)
            .await?
            .ok_or(StoreError::ContentNotFound { content_id })?;
        if !patch(unit.slide_mut()?, content_id)? {
            return Ok(unit);
        }
        unit.touch();
        write_unit(&conn, &unit).await?;
        Ok(unit)
    }
}

#[async_trait]
impl ArtifactStore for LibsqlStore {
    async fn put_topic(&self, topic_id: &str, title: &str) -> Result<Topic, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO topics (id, title, theory_content, updated_at)
             VALUES (?1, ?2, '', ?3)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
            params![topic_id, title, Utc::now().to_rfc3339()],
        )
        .await?;
        require_topic(&conn, topic_id).await
    }

    async fn get_topic(&self, topic_id: &str) -> Result<Option<Topic>, StoreError> {
        let conn = self.conn.lock().await;
        fetch_topic(&conn, topic_id).await
    }

    async fn set_theory(&self, topic_id: &str, theory: &str) -> Result<Topic, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE topics SET theory_content = ?2, updated_at = ?3 WHERE id = ?1",
                params![topic_id, theory, Utc::now().to_rfc3339()],
            )
            .await?;
        if changed == 0 {
            return Err(StoreError::TopicNotFound {
                topic_id: topic_id.to_string(),
            });
        }
        require_topic(&conn, topic_id).await
    }

    async fn upsert_skeletons(
        &self,
        topic_id: &str,
        fragments: &[Fragment],
    ) -> Result<Vec<ContentUnit>, StoreError> {
        let conn = self.conn.lock().await;
        let topic = require_topic(&conn, topic_id).await?;
        check_skeletons(&topic, fragments)?;

        // Dropping the transaction on any early return rolls it back.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;
        let written = replace_skeletons(&tx, topic_id, fragments).await?;
        tx.commit().await?;

        debug!(topic_id, slides = written.len(), "Skeletons upserted");
        Ok(written)
    }

    async fn update_html(&self, content_id: Uuid, html: &str) -> Result<ContentUnit, StoreError> {
        self.patch_slide(content_id, |slide, id| slide.apply_html(id, html))
            .await
    }

    async fn update_narrative(
        &self,
        content_id: Uuid,
        text: &str,
    ) -> Result<ContentUnit, StoreError> {
        self.patch_slide(content_id, |slide, id| slide.apply_narrative(id, text))
            .await
    }

    async fn mark_failed(
        &self,
        content_id: Uuid,
        reason: &str,
    ) -> Result<ContentUnit, StoreError> {
        self.patch_slide(content_id, |slide, id| slide.apply_failure(id, reason))
            .await
    }

    async fn upsert_quiz(
        &self,
        topic_id: &str,
        payload: serde_json::Value,
    ) -> Result<ContentUnit, StoreError> {
        let conn = self.conn.lock().await;
        require_topic(&conn, topic_id).await?;

        let body = ContentBody::Quiz(QuizContent { payload });
        let unit = match fetch_quiz(&conn, topic_id).await? {
            Some(mut prev) => {
                prev.content = body;
                prev.touch();
                prev
            }
            None => ContentUnit::new(topic_id, body),
        };
        write_unit(&conn, &unit).await?;
        Ok(unit)
    }

    async fn get_content(&self, content_id: Uuid) -> Result<Option<ContentUnit>, StoreError> {
        let conn = self.conn.lock().await;
        fetch_unit(&conn, content_id).await
    }

    async fn list_slides(&self, topic_id: &str) -> Result<Vec<ContentUnit>, StoreError> {
        let conn = self.conn.lock().await;
        fetch_slides(&conn, topic_id).await
    }

    async fn get_quiz(&self, topic_id: &str) -> Result<Option<ContentUnit>, StoreError> {
        let conn = self.conn.lock().await;
        fetch_quiz(&conn, topic_id).await
    }
}
