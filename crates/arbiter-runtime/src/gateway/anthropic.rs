//! Anthropic Messages API gateway.
//!
//! Supports plain and server-sent-event streaming generation.
//!
//! ## Security
//!
//! The API key is held in an [`ApiCredential`] and only exposed when the
//! request header is set. See the [`secrets`](super::secrets) module.

use super::{
    factory::GatewayFactory,
    secrets::{ApiCredential, CredentialSource},
    ChatMessage, CompletionConfig, GatewayError, ModelGateway, TextStream,
};
use arbiter_core::Role;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable name for the Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Gateway to Anthropic's hosted Claude models.
pub struct AnthropicGateway {
    credential: ApiCredential,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicGateway")
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl AnthropicGateway {
    /// Create a gateway with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_credential(ApiCredential::new(
            api_key,
            CredentialSource::Programmatic,
            "Anthropic API key",
        ))
    }

    /// Create from JSON configuration, falling back to `ANTHROPIC_API_KEY`.
    ///
    /// Recognised keys: `api_key`, `base_url`.
    pub fn from_config(config: &JsonValue) -> Result<Self, GatewayError> {
        let credential = ApiCredential::from_config_or_env(
            config,
            "api_key",
            ANTHROPIC_API_KEY_ENV,
            "Anthropic API key",
        )?;

        let mut gateway = Self::with_credential(credential);
        if let Some(url) = config["base_url"].as_str() {
            gateway.base_url = url.trim_end_matches('/').to_string();
        }
        Ok(gateway)
    }

    fn with_credential(credential: ApiCredential) -> Self {
        Self {
            credential,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Set custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn build_request(
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        config: &CompletionConfig,
        stream: bool,
    ) -> MessagesRequest {
        let messages = messages
            .into_iter()
            .filter(|m| m.role != Role::System)
            .map(|m| ApiMessage {
                role: m.role.as_str(),
                content: m.content,
            })
            .collect();

        MessagesRequest {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system: system_prompt
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
            messages,
            temperature: config.temperature,
            stream,
        }
    }

    /// Send a request and map HTTP-level failures.
    async fn send(
        &self,
        request: &MessagesRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.credential.expose())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(GatewayError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = match response.json::<ApiErrorBody>().await {
                Ok(body) => body.error.message,
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string(),
            };
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

fn map_transport_error(error: reqwest::Error, timeout: Duration) -> GatewayError {
    map_body_error(error, timeout, GatewayError::Http)
}

/// The request timeout also bounds reading the body.
fn map_body_error(
    error: reqwest::Error,
    timeout: Duration,
    other: fn(String) -> GatewayError,
) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        other(error.to_string())
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type", default)]
    kind: String,
    message: String,
}

/// One `data:` payload of the streaming API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: StreamDelta },
    MessageStop,
    Error { error: ApiErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

/// What a single SSE line contributes to the output.
#[derive(Debug, PartialEq)]
enum SseItem {
    Text(String),
    Stop,
}

fn parse_sse_line(line: &str) -> Result<Option<SseItem>, GatewayError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    let event: StreamEvent =
        serde_json::from_str(data).map_err(|e| GatewayError::Decode(e.to_string()))?;

    match event {
        StreamEvent::ContentBlockDelta {
            delta: StreamDelta::TextDelta { text },
        } => Ok(Some(SseItem::Text(text))),
        StreamEvent::MessageStop => Ok(Some(SseItem::Stop)),
        StreamEvent::Error { error } => Err(GatewayError::Stream(format!(
            "{}: {}",
            error.kind, error.message
        ))),
        _ => Ok(None),
    }
}

/// Turn a streaming response body into text chunks.
fn sse_text_stream(
    response: reqwest::Response,
    timeout: Duration,
) -> impl Stream<Item = Result<String, GatewayError>> {
    try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;

        while !finished {
            let Some(chunk) = body.next().await else {
                break;
            };
            let chunk = chunk.map_err(|e| map_body_error(e, timeout, GatewayError::Stream))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);

                match parse_sse_line(line.trim())? {
                    Some(SseItem::Text(text)) => yield text,
                    Some(SseItem::Stop) => {
                        finished = true;
                        break;
                    }
                    None => {}
                }
            }
        }
    }
}

#[async_trait]
impl ModelGateway for AnthropicGateway {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        config: &CompletionConfig,
    ) -> Result<String, GatewayError> {
        let request = Self::build_request(messages, system_prompt, config, false);
        let response = self.send(&request, config.timeout).await?;

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| map_body_error(e, config.timeout, GatewayError::Decode))?;

        if let Some(usage) = &body.usage {
            tracing::debug!(
                model = %config.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                stop_reason = ?body.stop_reason,
                "Anthropic completion finished"
            );
        }

        Ok(body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn generate_stream(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        config: &CompletionConfig,
    ) -> Result<TextStream, GatewayError> {
        let request = Self::build_request(messages, system_prompt, config, true);
        let response = self.send(&request, config.timeout).await?;
        Ok(sse_text_stream(response, config.timeout).boxed())
    }

    async fn health_check(&self) -> bool {
        !self.credential.is_empty()
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Factory for Anthropic gateways.
///
/// ## Configuration Format
/// ```json
/// {
///   "api_key": "sk-ant-...",   // Optional, falls back to ANTHROPIC_API_KEY env
///   "base_url": "https://..."  // Optional, custom API endpoint
/// }
/// ```
pub struct AnthropicGatewayFactory;

impl GatewayFactory for AnthropicGatewayFactory {
    fn provider_type(&self) -> &'static str {
        "anthropic"
    }

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ModelGateway>, GatewayError> {
        Ok(Arc::new(AnthropicGateway::from_config(config)?))
    }

    fn validate_config(&self, config: &JsonValue) -> Result<(), GatewayError> {
        if !ApiCredential::is_available(config, "api_key", ANTHROPIC_API_KEY_ENV) {
            return Err(GatewayError::NotConfigured(format!(
                "Anthropic API key required: set 'api_key' in config or {} env",
                ANTHROPIC_API_KEY_ENV
            )));
        }

        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(GatewayError::NotConfigured(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn default_config(&self) -> JsonValue {
        serde_json::json!({ "base_url": DEFAULT_BASE_URL })
    }

    fn description(&self) -> &'static str {
        "Anthropic Messages API with SSE streaming"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_drops_system_messages_and_carries_system_prompt() {
        let messages = vec![
            ChatMessage {
                role: Role::System,
                content: "ignored".to_string(),
            },
            ChatMessage::user("What is Rust?"),
            ChatMessage::assistant("A language."),
        ];
        let config = CompletionConfig {
            temperature: 0.3,
            ..CompletionConfig::default()
        };
        let request = AnthropicGateway::build_request(messages, Some("Be brief."), &config, false);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["messages"].as_array().unwrap().len(), 2);
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["system"], "Be brief.");
        assert!(value.get("stream").is_none());
        assert!((value["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_stream_request_sets_flag() {
        let request = AnthropicGateway::build_request(
            vec![ChatMessage::user("hi")],
            None,
            &CompletionConfig::default(),
            true,
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["stream"], true);
        assert!(value.get("system").is_none());
    }

    #[test]
    fn test_parse_sse_text_delta() {
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#;
        assert_eq!(
            parse_sse_line(line).unwrap(),
            Some(SseItem::Text("Hel".to_string()))
        );
    }

    #[test]
    fn test_parse_sse_ignores_other_lines() {
        assert_eq!(parse_sse_line("event: content_block_delta").unwrap(), None);
        assert_eq!(parse_sse_line("").unwrap(), None);
        assert_eq!(
            parse_sse_line(r#"data: {"type":"ping"}"#).unwrap(),
            None
        );
        assert_eq!(
            parse_sse_line(r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#).unwrap(),
            None
        );
        assert_eq!(
            parse_sse_line(r#"data: {"type":"message_stop"}"#).unwrap(),
            Some(SseItem::Stop)
        );
    }

    #[test]
    fn test_parse_sse_error_event() {
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let err = parse_sse_line(line).unwrap_err();
        assert_eq!(err.code(), "stream_error");
        assert!(err.to_string().contains("Overloaded"));
    }

    /// Serves one SSE text delta, then keeps the connection open without ending the body.
    async fn stalling_sse_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut request).await;

            let event = "data: {\"type\":\"content_block_delta\",\"index\":0,\
                         \"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n";
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                        transfer-encoding: chunked\r\n\r\n";
            let chunk = format!("{head}{:x}\r\n{event}\r\n", event.len());
            socket.write_all(chunk.as_bytes()).await.unwrap();
            std::future::pending::<()>().await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_stalled_stream_surfaces_timeout() {
        let gateway = AnthropicGateway::new("key").with_base_url(stalling_sse_server().await);
        let config = CompletionConfig {
            timeout: Duration::from_millis(300),
            ..CompletionConfig::default()
        };

        let items: Vec<_> = gateway
            .generate_stream(vec![ChatMessage::user("hi")], None, &config)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items[0].as_ref().unwrap(), "Hel");
        let err = items.last().unwrap().as_ref().unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[test]
    fn test_api_key_not_in_debug_output() {
        let secret_key = "sk-ant-REDACTED";
        let gateway = AnthropicGateway::new(secret_key);
        let debug_output = format!("{:?}", gateway);
        assert!(!debug_output.contains(secret_key));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_health_check_requires_key() {
        assert!(AnthropicGateway::new("key").health_check().await);
        assert!(!AnthropicGateway::new("").health_check().await);
    }

    #[test]
    fn test_from_config_with_api_key() {
        let config = serde_json::json!({
            "api_key": "config-api-key",
            "base_url": "https://custom.api.com/v1/"
        });
        let gateway = AnthropicGateway::from_config(&config).unwrap();
        assert_eq!(gateway.base_url, "https://custom.api.com/v1");
        assert_eq!(gateway.credential.source(), CredentialSource::Config);
    }

    #[test]
    fn test_factory_rejects_bad_base_url() {
        let config = serde_json::json!({
            "api_key": "test-key",
            "base_url": "invalid-url"
        });
        assert!(AnthropicGatewayFactory.validate_config(&config).is_err());
        assert_eq!(AnthropicGatewayFactory.provider_type(), "anthropic");
    }
}
