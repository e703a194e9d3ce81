//! Structured (JSON) generation on top of any [`ModelGateway`].
//!
//! The model is told to answer with JSON only; the reply is cleaned of code
//! fences and decoded straight into a typed record.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use super::{ChatMessage, CompletionConfig, GatewayError, ModelGateway};

/// Appended to the system prompt of every structured request.
pub const JSON_ONLY_INSTRUCTION: &str = "You must respond with valid JSON only. No other text.";

/// Temperature used for structured requests.
pub const STRUCTURED_TEMPERATURE: f32 = 0.3;

/// The model's output could not be decoded into the expected record.
#[derive(Error, Debug)]
#[error("Malformed structured output ({reason}); raw output: {raw}")]
pub struct MalformedOutputError {
    /// Text exactly as the model returned it
    pub raw: String,
    pub reason: String,
}

/// Failure of a structured generation call.
#[derive(Error, Debug)]
pub enum StructuredError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Malformed(#[from] MalformedOutputError),
}

/// Trim and remove a surrounding ```` ``` ```` / ```` ```json ```` fence.
pub fn strip_code_fences(text: &str) -> &str {
    let mut cleaned = text.trim();

    if let Some(rest) = cleaned.strip_prefix("```json") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }

    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }

    cleaned.trim()
}

/// Decode raw model output into `T`.
pub fn decode_structured<T: DeserializeOwned>(raw: &str) -> Result<T, MalformedOutputError> {
    serde_json::from_str(strip_code_fences(raw)).map_err(|e| MalformedOutputError {
        raw: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Ask the model for JSON and decode it into `T`.
///
/// # Arguments
/// * `gateway` - Model to call
/// * `messages` - Request context
/// * `system_prompt` - Base instructions; the JSON-only instruction is appended
/// * `schema_hint` - Example of the expected shape, shown to the model
/// * `config` - Base settings; temperature is lowered to [`STRUCTURED_TEMPERATURE`]
pub async fn generate_structured<T: DeserializeOwned>(
    gateway: &dyn ModelGateway,
    messages: Vec<ChatMessage>,
    system_prompt: Option<&str>,
    schema_hint: Option<&JsonValue>,
    config: &CompletionConfig,
) -> Result<T, StructuredError> {
    let system = structured_system_prompt(system_prompt, schema_hint);
    let structured_config = CompletionConfig {
        temperature: STRUCTURED_TEMPERATURE,
        ..config.clone()
    };

    let raw = gateway
        .generate(messages, Some(&system), &structured_config)
        .await?;

    Ok(decode_structured(&raw)?)
}

fn structured_system_prompt(base: Option<&str>, schema_hint: Option<&JsonValue>) -> String {
    let mut system = base.unwrap_or_default().trim_end().to_string();
    if !system.is_empty() {
        system.push_str("\n\n");
    }
    system.push_str(JSON_ONLY_INSTRUCTION);

    if let Some(hint) = schema_hint {
        let rendered = serde_json::to_string_pretty(hint).unwrap_or_else(|_| hint.to_string());
        system.push_str("\n\nExpected format:\n");
        system.push_str(&rendered);
    }

    system
}
