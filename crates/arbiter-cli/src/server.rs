//! HTTP and WebSocket transport over the orchestrator.
//!
//! | Route                        | Purpose                                  |
//! |------------------------------|------------------------------------------|
//! | `GET /health`                | status, models and gateway reachability  |
//! | `POST /api/chat`             | run one turn, return outcome and history |
//! | `GET /api/chat/history/:id`  | conversation messages or 404             |
//! | `GET /api/criteria`          | the loaded criteria definition           |
//! | `GET /ws/chat`               | live turns and input evaluation          |
//!
//! WebSocket frames are `{"event": ..., "data": {...}}` in both directions.
//! Server frames also carry a `timestamp`.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use arbiter_core::{generate_id, ConversationMode, Message};
use arbiter_runtime::{
    ConnectionRegistry, EventSink, Orchestrator, StoreError, TurnEvent, TurnOutcome, TurnRequest,
};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    connections: Arc<ConnectionRegistry>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            connections: Arc::new(ConnectionRegistry::new()),
        }
    }
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    addr: SocketAddr,
    cors_origins: &[String],
) -> Result<()> {
    let app = router(AppState::new(orchestrator), cors_origins)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(%addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Build the application router.
pub fn router(state: AppState, cors_origins: &[String]) -> Result<Router> {
    let origins = cors_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin '{origin}'"))
        })
        .collect::<Result<Vec<_>>>()?;

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/history/:conversation_id", get(history))
        .route("/api/criteria", get(criteria))
        .route("/ws/chat", get(ws_chat))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// JSON error body `{"detail": ...}`.
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;
    let (responder_ok, judge_ok) = tokio::join!(
        orchestrator.responder().health_check(),
        orchestrator.judge().health_check()
    );
    let status = if responder_ok && judge_ok {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "responder_model": orchestrator.responder().model(),
        "judge_model": orchestrator.judge().model(),
        "gateways": {
            "responder": responder_ok,
            "judge": judge_ok,
        },
        "connected_clients": state.connections.connected(),
    }))
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    mode: ConversationMode,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    #[serde(flatten)]
    outcome: TurnOutcome,
    history: Vec<Message>,
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .process_turn(
            &request.message,
            request.conversation_id.as_deref(),
            request.mode,
        )
        .await
        .map_err(|e| ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: format!("Chat processing failed: {e}"),
        })?;

    let history = state
        .orchestrator
        .get_history(&outcome.conversation_id)
        .unwrap_or_default();

    Ok(Json(ChatResponse { outcome, history }))
}

async fn history(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.orchestrator.get_history(&conversation_id) {
        Ok(messages) => Ok(Json(json!({
            "conversation_id": conversation_id,
            "messages": messages,
        }))),
        Err(StoreError::NotFound(_)) => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            detail: "Conversation not found".to_string(),
        }),
    }
}

async fn criteria(State(state): State<AppState>) -> Json<arbiter_core::CriteriaDefinition> {
    Json(state.orchestrator.judge().registry().definition().clone())
}

async fn ws_chat(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Frames sent by a WebSocket client.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
enum ClientFrame {
    UserMessage(UserMessageFrame),
    EvaluateInput {
        #[serde(default)]
        input: String,
    },
}

#[derive(Debug, Deserialize, PartialEq)]
struct UserMessageFrame {
    #[serde(default)]
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    skip_user_evaluation: bool,
    #[serde(default)]
    message_id: Option<String>,
}

impl UserMessageFrame {
    /// Live clients default to INPUT_CRITIQUE, also for unrecognised modes.
    fn into_request(self) -> TurnRequest {
        let mode = match self.mode.as_deref() {
            None => ConversationMode::InputCritique,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(mode = raw, "Unknown mode, using input_critique");
                ConversationMode::InputCritique
            }),
        };

        TurnRequest {
            message: self.message,
            conversation_id: self.conversation_id,
            mode,
            skip_input_critique: self.skip_user_evaluation,
            message_id: self.message_id,
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = generate_id("client");
    let mut events = state.connections.connect(client_id.as_str());
    let (mut sender, mut receiver) = socket.split();

    let forward = tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    drive_client(&state, &client_id, &mut receiver).await;

    state.connections.disconnect(&client_id);
    forward.abort();
}

enum Incoming {
    Text(String),
    Ignored,
    Closed,
}

fn classify<E>(frame: Option<Result<WsMessage, E>>) -> Incoming {
    match frame {
        Some(Ok(WsMessage::Text(text))) => Incoming::Text(text),
        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => Incoming::Closed,
        Some(Ok(_)) => Incoming::Ignored,
    }
}

async fn next_text<S, E>(receiver: &mut S) -> Option<String>
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
{
    loop {
        match classify(receiver.next().await) {
            Incoming::Text(text) => return Some(text),
            Incoming::Ignored => {}
            Incoming::Closed => return None,
        }
    }
}

/// Handle client frames in arrival order until the client goes away.
///
/// The socket stays polled while a frame is handled. Frames arriving in the
/// meantime are queued; a disconnect drops the in-flight turn, which releases
/// the conversation and keeps whatever history was already written.
async fn drive_client<S, E>(state: &AppState, client_id: &str, receiver: &mut S)
where
    S: Stream<Item = Result<WsMessage, E>> + Unpin,
{
    let mut queued: VecDeque<String> = VecDeque::new();

    loop {
        let text = match queued.pop_front() {
            Some(text) => text,
            None => match next_text(receiver).await {
                Some(text) => text,
                None => return,
            },
        };

        let work = handle_frame(state, client_id, &text);
        tokio::pin!(work);
        loop {
            tokio::select! {
                () = &mut work => break,
                frame = receiver.next() => match classify(frame) {
                    Incoming::Text(text) => queued.push_back(text),
                    Incoming::Ignored => {}
                    Incoming::Closed => {
                        tracing::info!(client_id, "Client disconnected, abandoning turn");
                        return;
                    }
                },
            }
        }
    }
}

async fn handle_frame(state: &AppState, client_id: &str, text: &str) {
    let sink: &dyn EventSink = state.connections.as_ref();

    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(client_id, error = %e, "Rejected client frame");
            let reply = TurnEvent::Error {
                error: format!("Invalid message: {e}"),
            };
            if let Err(e) = sink.send(client_id, reply) {
                tracing::debug!(client_id, error = %e, "Dropped error event");
            }
            return;
        }
    };

    match frame {
        ClientFrame::EvaluateInput { input } => {
            tracing::info!(client_id, "Evaluating user input");
            state
                .orchestrator
                .evaluate_input_streaming(&input, None, sink, client_id)
                .await;
        }
        ClientFrame::UserMessage(frame) => {
            let request = frame.into_request();
            tracing::info!(client_id, mode = %request.mode, "Received user message");
            // The orchestrator already reported the failure as an error event.
            if let Err(e) = state
                .orchestrator
                .process_turn_streaming(request, sink, client_id)
                .await
            {
                tracing::warn!(client_id, error = %e, "Live turn failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::CriteriaRegistry;
    use arbiter_runtime::{ChatMessage, CompletionConfig, GatewayError, ModelGateway};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    struct FixedGateway {
        reply: &'static str,
    }

    /// Counts calls, then never answers.
    #[derive(Default)]
    struct StalledGateway {
        calls: AtomicUsize,
        called: Notify,
    }

    #[async_trait]
    impl ModelGateway for StalledGateway {
        async fn generate(
            &self,
            _messages: Vec<ChatMessage>,
            _system_prompt: Option<&str>,
            _config: &CompletionConfig,
        ) -> Result<String, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.called.notify_one();
            std::future::pending().await
        }

        async fn health_check(&self) -> bool {
            false
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[async_trait]
    impl ModelGateway for FixedGateway {
        async fn generate(
            &self,
            _messages: Vec<ChatMessage>,
            _system_prompt: Option<&str>,
            _config: &CompletionConfig,
        ) -> Result<String, GatewayError> {
            Ok(self.reply.to_string())
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn app() -> Router {
        let registry = CriteriaRegistry::from_yaml(
            "output_criteria:\n  - name: accuracy\n    weight: 1.0\n    threshold: 70\n",
        )
        .unwrap();
        let orchestrator = Orchestrator::builder()
            .responder(Arc::new(FixedGateway { reply: "Rust is a language." }))
            .judge(Arc::new(FixedGateway {
                reply: r#"{"score": 88, "feedback": "Correct"}"#,
            }))
            .registry(Arc::new(registry))
            .build()
            .unwrap();

        router(
            AppState::new(Arc::new(orchestrator)),
            &["http://localhost:3000".to_string()],
        )
        .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_models() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["judge_model"].is_string());
        assert_eq!(body["gateways"]["responder"], true);
        assert_eq!(body["gateways"]["judge"], true);
    }

    fn stalled_orchestrator(responder: Arc<StalledGateway>) -> Arc<Orchestrator> {
        let registry = CriteriaRegistry::from_yaml(
            "output_criteria:\n  - name: accuracy\n    weight: 1.0\n    threshold: 70\n",
        )
        .unwrap();
        let orchestrator = Orchestrator::builder()
            .responder(responder)
            .judge(Arc::new(FixedGateway {
                reply: r#"{"score": 10, "feedback": "Wrong"}"#,
            }))
            .registry(Arc::new(registry))
            .build()
            .unwrap();
        Arc::new(orchestrator)
    }

    #[tokio::test]
    async fn test_health_reports_unreachable_gateway() {
        let orchestrator = stalled_orchestrator(Arc::new(StalledGateway::default()));
        let app = router(AppState::new(orchestrator), &[]).unwrap();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["gateways"]["responder"], false);
        assert_eq!(body["gateways"]["judge"], true);
    }

    #[tokio::test]
    async fn test_client_disconnect_abandons_running_turn() {
        let responder = Arc::new(StalledGateway::default());
        let orchestrator = stalled_orchestrator(responder.clone());
        let state = AppState::new(orchestrator.clone());

        let (frames, mut receiver) =
            futures::channel::mpsc::unbounded::<Result<WsMessage, axum::Error>>();
        frames
            .unbounded_send(Ok(WsMessage::Text(
                r#"{"event": "user_message", "data": {"message": "hi", "mode": "feedback"}}"#
                    .to_string(),
            )))
            .unwrap();

        let client =
            tokio::spawn(async move { drive_client(&state, "client_test", &mut receiver).await });
        responder.called.notified().await;
        drop(frames);

        tokio::time::timeout(Duration::from_secs(2), client)
            .await
            .expect("turn kept running after disconnect")
            .unwrap();
        assert_eq!(responder.calls.load(Ordering::SeqCst), 1);
        // The conversation and its user message were written before the responder stalled.
        assert_eq!(orchestrator.store().len(), 1);
    }

    #[tokio::test]
    async fn test_chat_returns_outcome_and_history() {
        let request = Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"message": "What is Rust?"}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["response"], "Rust is a language.");
        assert_eq!(body["iteration"], 1);
        assert_eq!(body["evaluation"]["overall_score"], 88.0);
        assert_eq!(body["evaluation"]["traffic_light"], "green");
        assert_eq!(body["history"].as_array().unwrap().len(), 2);
        assert!(body["conversation_id"].as_str().unwrap().starts_with("conv_"));
    }

    #[tokio::test]
    async fn test_unknown_history_is_404() {
        let response = app()
            .oneshot(
                Request::get("/api/chat/history/conv_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["detail"], "Conversation not found");
    }

    #[tokio::test]
    async fn test_criteria_endpoint() {
        let response = app()
            .oneshot(Request::get("/api/criteria").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["output_criteria"][0]["name"], "accuracy");
        assert_eq!(body["settings"]["active_profile"], "moderate");
    }

    #[test]
    fn test_invalid_cors_origin_is_rejected() {
        let orchestrator = Orchestrator::builder()
            .responder(Arc::new(FixedGateway { reply: "" }))
            .registry(Arc::new(
                CriteriaRegistry::from_yaml(
                    "output_criteria:\n  - name: a\n    weight: 1.0\n    threshold: 70\n",
                )
                .unwrap(),
            ))
            .build()
            .unwrap();
        let result = router(
            AppState::new(Arc::new(orchestrator)),
            &["bad\norigin".to_string()],
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_frame_reports_error_event() {
        let state = AppState::new(stalled_orchestrator(Arc::new(StalledGateway::default())));
        let mut events = state.connections.connect("client_a");

        handle_frame(&state, "client_a", "not json").await;
        let envelope = events.recv().await.unwrap();
        assert!(matches!(
            envelope.event,
            TurnEvent::Error { ref error } if error.starts_with("Invalid message")
        ));

        // A client that is already gone only costs a debug log.
        handle_frame(&state, "client_gone", "not json").await;
    }

    #[test]
    fn test_user_message_frame_defaults() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"event": "user_message", "data": {"message": "hi", "message_id": "m1"}}"#,
        )
        .unwrap();

        let ClientFrame::UserMessage(frame) = frame else {
            panic!("expected user_message");
        };
        let request = frame.into_request();
        assert_eq!(request.mode, ConversationMode::InputCritique);
        assert_eq!(request.message_id.as_deref(), Some("m1"));
        assert!(!request.skip_input_critique);
    }

    #[test]
    fn test_unknown_mode_falls_back_to_input_critique() {
        let frame = UserMessageFrame {
            message: "hi".to_string(),
            conversation_id: None,
            mode: Some("turbo".to_string()),
            skip_user_evaluation: true,
            message_id: None,
        };
        let request = frame.into_request();
        assert_eq!(request.mode, ConversationMode::InputCritique);
        assert!(request.skip_input_critique);

        let simple = UserMessageFrame {
            mode: Some("simple".to_string()),
            ..frame_with_message("x")
        };
        assert_eq!(simple.into_request().mode, ConversationMode::Simple);
    }

    fn frame_with_message(message: &str) -> UserMessageFrame {
        UserMessageFrame {
            message: message.to_string(),
            conversation_id: None,
            mode: None,
            skip_user_evaluation: false,
            message_id: None,
        }
    }

    #[test]
    fn test_evaluate_input_frame() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"event": "evaluate_input", "data": {"input": "why?"}}"#)
                .unwrap();
        assert_eq!(
            frame,
            ClientFrame::EvaluateInput {
                input: "why?".to_string()
            }
        );
        assert!(serde_json::from_str::<ClientFrame>(r#"{"event": "dance"}"#).is_err());
    }
}
