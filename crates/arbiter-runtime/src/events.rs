//! Turn events and the sinks that deliver them to live clients.
//!
//! Delivery is best-effort. [`EventSink::send`] never blocks, and a failed
//! send is logged by the caller and otherwise ignored.

use std::collections::HashMap;

use arbiter_core::{CriterionScore, Evaluation};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Something that happened during a turn.
///
/// Serialised as `{"event": "<kind>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TurnEvent {
    /// One input criterion was scored
    UserInputEvaluation {
        criterion: CriterionScore,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Aggregate critique of the user message
    JudgeInputCritique {
        critique: Evaluation,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    ChatbotGenerating { iteration: u32 },

    ChatbotChunk { chunk: String, iteration: u32 },

    /// A complete (possibly refined) response
    ChatbotResponse {
        response: String,
        conversation_id: String,
        iteration: u32,
    },

    /// A refinement round is about to start
    ChatbotRefining {
        iteration: u32,
        previous_score: f64,
    },

    JudgeEvaluating { iteration: u32 },

    JudgeCriterionResult {
        criterion: CriterionScore,
        iteration: u32,
    },

    JudgeResult {
        evaluation: Evaluation,
        iteration: u32,
    },

    FinalResponse {
        conversation_id: String,
        response: String,
        evaluation: Evaluation,
        iteration: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_critique: Option<Evaluation>,
    },

    Error { error: String },
}

impl TurnEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::UserInputEvaluation { .. } => "user_input_evaluation",
            TurnEvent::JudgeInputCritique { .. } => "judge_input_critique",
            TurnEvent::ChatbotGenerating { .. } => "chatbot_generating",
            TurnEvent::ChatbotChunk { .. } => "chatbot_chunk",
            TurnEvent::ChatbotResponse { .. } => "chatbot_response",
            TurnEvent::ChatbotRefining { .. } => "chatbot_refining",
            TurnEvent::JudgeEvaluating { .. } => "judge_evaluating",
            TurnEvent::JudgeCriterionResult { .. } => "judge_criterion_result",
            TurnEvent::JudgeResult { .. } => "judge_result",
            TurnEvent::FinalResponse { .. } => "final_response",
            TurnEvent::Error { .. } => "error",
        }
    }
}

/// Wire envelope: the event plus the time it was emitted.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: TurnEvent,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn now(event: TurnEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }
}

/// Errors from event delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("No connected client with id {0}")]
    UnknownClient(String),

    #[error("Client {0} disconnected")]
    Disconnected(String),
}

/// One-way, non-blocking event delivery.
pub trait EventSink: Send + Sync {
    fn send(&self, client_id: &str, event: TurnEvent) -> Result<(), SinkError>;
}

/// Routes events to connected clients over unbounded channels.
///
/// The transport calls [`connect`](Self::connect) when a client arrives and
/// forwards everything received on the returned channel.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<HashMap<String, mpsc::UnboundedSender<EventEnvelope>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, replacing any previous connection with the same id.
    pub fn connect(&self, client_id: impl Into<String>) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::info!(client_id = %client_id, "Client connected");
        self.clients.write().insert(client_id, tx);
        rx
    }

    pub fn disconnect(&self, client_id: &str) {
        if self.clients.write().remove(client_id).is_some() {
            tracing::info!(client_id = %client_id, "Client disconnected");
        }
    }

    pub fn connected(&self) -> usize {
        self.clients.read().len()
    }
}

impl EventSink for ConnectionRegistry {
    fn send(&self, client_id: &str, event: TurnEvent) -> Result<(), SinkError> {
        let clients = self.clients.read();
        let tx = clients
            .get(client_id)
            .ok_or_else(|| SinkError::UnknownClient(client_id.to_string()))?;

        tx.send(EventEnvelope::now(event))
            .map_err(|_| SinkError::Disconnected(client_id.to_string()))
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connected", &self.connected())
            .finish()
    }
}
