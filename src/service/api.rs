use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::content::validate::{plain_text_value, reject_provider_selector, validate_topic_id};
use crate::content::{ContentUnit, Fragment};
use crate::engine::{Dispatcher, RunStatus};
use crate::errors::{EngineError, StoreError, ValidationError};
use crate::store::ArtifactStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn ArtifactStore>,
    pub dispatcher: Dispatcher,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTopicRequest {
    pub id: String,
    pub title: String,
}

#[derive(Deserialize)]
pub struct SetTheoryRequest {
    pub theory_content: String,
}

#[derive(Deserialize)]
pub struct BulkContentRequest {
    pub fragments: Vec<Value>,
}

#[derive(Deserialize)]
pub struct UpdateHtmlRequest {
    pub rendered_html: String,
}

#[derive(Deserialize)]
pub struct UpdateNarrativeRequest {
    pub narrative_text: String,
}

#[derive(Deserialize)]
pub struct UpsertQuizRequest {
    pub payload: Value,
}

#[derive(Serialize)]
pub struct TopicContent {
    pub topic_id: String,
    pub slides: Vec<ContentUnit>,
    pub quiz: Option<ContentUnit>,
}

#[derive(Serialize)]
pub struct SubmittedRun {
    pub run_id: Uuid,
    pub topic_id: String,
    pub status: RunStatus,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::MissingTopic { .. } => ApiError::NotFound(err.to_string()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TopicNotFound { .. } | StoreError::ContentNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            StoreError::Validation(inner) => inner.into(),
            StoreError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            StoreError::KindMismatch { .. } => ApiError::BadRequest(err.to_string()),
            StoreError::Layout(_) | StoreError::Backend(_) | StoreError::Serialization(_) => {
                warn!(error = %err, "Store operation failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(inner) => inner.into(),
            EngineError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            EngineError::RunNotFound { .. } => ApiError::NotFound(err.to_string()),
            EngineError::Persistence(inner) => inner.into(),
            EngineError::ShutDown => ApiError::Unavailable(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/topics", post(create_topic))
        .route("/api/topics/{id}", get(get_topic))
        .route("/api/topics/{id}/theory", put(set_theory))
        .route("/api/topics/{id}/content", get(list_content))
        .route("/api/topics/{id}/content/bulk", post(upsert_skeletons))
        .route("/api/topics/{id}/quiz", post(upsert_quiz))
        .route("/api/topics/{id}/generate", post(submit_run))
        .route("/api/content/{id}/html", patch(update_html))
        .route("/api/content/{id}/narrative", patch(update_narrative))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Screen a raw body for provider selectors, then decode it.
fn decode<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    reject_provider_selector(&body)?;
    serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))
}

/// One bulk fragment: `full_text` plus a plain-text plan under either
/// `plan_snapshot` or `slide_plan`.
fn fragment_from_value(order: usize, value: &Value) -> Result<Fragment, ApiError> {
    reject_provider_selector(value)?;
    let object = value.as_object().ok_or_else(|| {
        ValidationError::InvalidPayload(format!("fragment {} must be an object", order))
    })?;
    let full_text = object
        .get("full_text")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ValidationError::InvalidPayload(format!("fragment {} is missing full_text", order))
        })?;
    let plan = match (object.get("plan_snapshot"), object.get("slide_plan")) {
        (Some(plan), _) => plain_text_value("plan_snapshot", plan)?,
        (None, Some(plan)) => plain_text_value("slide_plan", plan)?,
        (None, None) => String::new(),
    };
    Ok(Fragment::new(full_text, plan))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_topic(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let req: CreateTopicRequest = decode(body)?;
    validate_topic_id(&req.id)?;
    let existed = state.store.get_topic(&req.id).await?.is_some();
    let topic = state.store.put_topic(&req.id, &req.title).await?;
    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(topic)))
}

async fn get_topic(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.store.get_topic(&id).await? {
        Some(topic) => Ok(Json(topic)),
        None => Err(ApiError::NotFound(format!("Topic {} not found", id))),
    }
}

async fn set_theory(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let req: SetTheoryRequest = decode(body)?;
    let topic = state.store.set_theory(&id, &req.theory_content).await?;
    Ok(Json(topic))
}

async fn list_content(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_topic(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Topic {} not found", id)));
    }
    let slides = state.store.list_slides(&id).await?;
    let quiz = state.store.get_quiz(&id).await?;
    Ok(Json(TopicContent {
        topic_id: id,
        slides,
        quiz,
    }))
}

async fn upsert_skeletons(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let req: BulkContentRequest = decode(body)?;
    let fragments = req
        .fragments
        .iter()
        .enumerate()
        .map(|(order, value)| fragment_from_value(order, value))
        .collect::<Result<Vec<_>, _>>()?;
    let slides = state.store.upsert_skeletons(&id, &fragments).await?;
    info!(topic_id = %id, slides = slides.len(), "Slide skeletons written");
    Ok(Json(slides))
}

async fn update_html(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let req: UpdateHtmlRequest = decode(body)?;
    let unit = state.store.update_html(id, &req.rendered_html).await?;
    Ok(Json(unit))
}

async fn update_narrative(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let req: UpdateNarrativeRequest = decode(body)?;
    let unit = state.store.update_narrative(id, &req.narrative_text).await?;
    Ok(Json(unit))
}

async fn upsert_quiz(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let req: UpsertQuizRequest = decode(body)?;
    let unit = state.store.upsert_quiz(&id, req.payload).await?;
    Ok(Json(unit))
}

/// The body is optional; when present it is screened like any other.
async fn submit_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if !body.is_empty() {
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?;
        reject_provider_selector(&value)?;
    }
    let handle = state.dispatcher.submit(&id).await?;
    let status = handle.poll();
    Ok((
        StatusCode::CREATED,
        Json(SubmittedRun {
            run_id: handle.run_id,
            topic_id: handle.topic_id,
            status,
        }),
    ))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.dispatcher.poll(id).await?;
    Ok(Json(status))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.dispatcher.cancel(id).await?;
    info!(run_id = %id, "Run cancelled via API");
    Ok(Json(status))
}

// ── Tests ─────────────────────────────────────────────────────────────
