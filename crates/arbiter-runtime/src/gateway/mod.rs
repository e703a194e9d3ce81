//! Model gateway abstractions.
//!
//! A [`ModelGateway`] addresses one logical hosted model. The runtime holds
//! two of them: one for the responder and one for the judge.
//!
//! ## Security
//!
//! Gateways use the [`secrets`] module for credential handling.
//! See [`ApiCredential`] for the recommended patterns.

use arbiter_core::Role;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

mod factory;
pub mod secrets;
mod structured;

#[cfg(feature = "anthropic")]
mod anthropic;

pub use factory::{GatewayFactory, GatewayRegistry};
pub use secrets::{ApiCredential, CredentialSource};
pub use structured::{
    decode_structured, generate_structured, strip_code_fences, MalformedOutputError,
    StructuredError, JSON_ONLY_INSTRUCTION, STRUCTURED_TEMPERATURE,
};

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicGateway, AnthropicGatewayFactory};

/// Errors from the remote model boundary.
///
/// The core never retries these.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Failed to decode provider response: {0}")]
    Decode(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Gateway not configured: {0}")]
    NotConfigured(String),
}

impl GatewayError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Http(_) => "http_error",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Api { .. } => "api_error",
            GatewayError::Stream(_) => "stream_error",
            GatewayError::Decode(_) => "decode_error",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::NotConfigured(_) => "not_configured",
        }
    }
}

/// Configuration for a generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionConfig {
    /// Model to use
    pub model: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    pub temperature: f32,

    /// Request timeout
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
        }
    }
}

/// A chat message sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A finite, non-restartable sequence of text chunks.
pub type TextStream = BoxStream<'static, Result<String, GatewayError>>;

/// Access to one hosted model.
///
/// Implementations are the only place the runtime performs network I/O.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Generate a complete response.
    ///
    /// # Arguments
    /// * `messages` - Conversation context; `system` roles are ignored
    /// * `system_prompt` - Instructions sent separately from the messages
    /// * `config` - Model, token budget, temperature and timeout
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        config: &CompletionConfig,
    ) -> Result<String, GatewayError>;

    /// Generate a response as a stream of text chunks.
    ///
    /// The default implementation yields the whole `generate` output as a
    /// single chunk.
    async fn generate_stream(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        config: &CompletionConfig,
    ) -> Result<TextStream, GatewayError> {
        let text = self.generate(messages, system_prompt, config).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }

    /// Check if the gateway is usable.
    async fn health_check(&self) -> bool;

    /// Gateway name for logs and health output.
    fn name(&self) -> &str;
}
