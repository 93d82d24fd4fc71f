//! The external generation capability.
//!
//! The engine treats text generation as a black box: given a task kind and
//! its inputs it returns text or a classified failure. `HttpGenerator` talks
//! to a generation service over HTTP; tests plug in scripted generators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::TaskError;

/// Inputs of one generation call, per task kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum GenerationInput {
    Theory {
        title: String,
    },
    Plan {
        theory: String,
    },
    Html {
        order: u32,
        full_text: String,
        plan: String,
    },
    Narrative {
        order: u32,
        full_text: String,
        html: String,
    },
    Quiz {
        theory: String,
        narratives: Vec<String>,
    },
}

/// A generation call. Carries no provider or model selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic_id: String,
    #[serde(flatten)]
    pub input: GenerationInput,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, TaskError>;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    output: String,
}

/// Generator backed by an HTTP endpoint returning `{"output": "..."}`.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Map an HTTP status to the retry classification.
pub fn classify_status(status: StatusCode) -> Option<TaskError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("generation service returned {}", status);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Some(TaskError::retryable(reason))
    } else {
        Some(TaskError::terminal(reason))
    }
}

fn classify_transport(err: &reqwest::Error) -> TaskError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        TaskError::retryable(format!("generation request failed: {}", err))
    } else {
        TaskError::terminal(format!("generation request failed: {}", err))
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, TaskError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await.map_err(|e| classify_transport(&e))?;

        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }

        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| TaskError::terminal(format!("malformed generation response: {}", e)))?;
        debug!(
            topic_id = %request.topic_id,
            bytes = body.output.len(),
            "Generation response received"
        );
        Ok(body.output)
    }
}
