//! Boundary checks shared by the HTTP surface, the CLI and the dispatcher.

use serde_json::Value;

use crate::content::model::Fragment;
use crate::errors::ValidationError;

/// Keys that would let a caller pick the generation provider or model.
pub const PROVIDER_SELECTOR_KEYS: &[&str] = &[
    "provider",
    "model",
    "model_id",
    "model_name",
    "llm",
    "llm_provider",
];

pub fn validate_topic_id(topic_id: &str) -> Result<(), ValidationError> {
    if topic_id.trim().is_empty() {
        return Err(ValidationError::EmptyTopicId);
    }
    Ok(())
}

/// Reject any request body carrying a provider/model selector at its root.
pub fn reject_provider_selector(body: &Value) -> Result<(), ValidationError> {
    if let Some(map) = body.as_object()
        && let Some(key) = map
            .keys()
            .find(|k| PROVIDER_SELECTOR_KEYS.contains(&k.to_ascii_lowercase().as_str()))
    {
        return Err(ValidationError::ProviderSelector { key: key.clone() });
    }
    Ok(())
}

/// Plain text or markdown passes; text that is itself a JSON object or
/// array does not.
pub fn ensure_plain_text(field: &str, text: &str) -> Result<(), ValidationError> {
    let trimmed = text.trim_start();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(text).is_ok_and(|v| v.is_object() || v.is_array())
    {
        return Err(ValidationError::StructuredPlan {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Extract a plain-text field from a JSON value.
pub fn plain_text_value(field: &str, value: &Value) -> Result<String, ValidationError> {
    match value {
        Value::String(text) => {
            ensure_plain_text(field, text)?;
            Ok(text.clone())
        }
        Value::Null => Ok(String::new()),
        _ => Err(ValidationError::StructuredPlan {
            field: field.to_string(),
        }),
    }
}

/// Every fragment must be a non-empty literal substring of the theory.
pub fn ensure_substrings(theory: &str, fragments: &[Fragment]) -> Result<(), ValidationError> {
    for (order, fragment) in fragments.iter().enumerate() {
        if fragment.full_text.is_empty() || !theory.contains(fragment.full_text.as_str()) {
            return Err(ValidationError::NotASubstring { order });
        }
        ensure_plain_text("plan_snapshot", &fragment.plan_snapshot)?;
    }
    Ok(())
}
