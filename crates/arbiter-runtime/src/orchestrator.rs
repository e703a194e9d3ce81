//! Turn orchestrator.
//!
//! Drives one user turn through:
//! - optional input critique (INPUT_CRITIQUE mode)
//! - response generation
//! - per-criterion judging
//! - a refinement loop bounded by `max_iterations` total rounds
//!
//! The streaming and non-streaming entry points share one code path. With a
//! live sink the responder is streamed and every phase boundary is reported;
//! without one the same decisions are made silently.

use std::sync::Arc;

use arbiter_core::{
    ConfigError, ConversationMode, CriteriaRegistry, CriterionScore, Evaluation, Message,
    Metadata,
};
use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::events::{EventSink, TurnEvent};
use crate::gateway::{GatewayError, ModelGateway};
use crate::judge::{JudgeEngine, JudgeError};
use crate::responder::Responder;
use crate::store::{ConversationStore, StoreError};

/// Phase of a turn in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Generating,
    Evaluating,
    Refining,
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnPhase::Generating => f.write_str("generating"),
            TurnPhase::Evaluating => f.write_str("evaluating"),
            TurnPhase::Refining => f.write_str("refining"),
        }
    }
}

/// Underlying cause of a failed turn.
#[derive(Error, Debug)]
pub enum TurnFailure {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Judge(#[from] JudgeError),
}

/// A turn aborted; history keeps every message appended before the failure.
#[derive(Error, Debug)]
#[error("Turn failed in conversation {conversation_id} while {phase}: {source}")]
pub struct OrchestrationError {
    pub conversation_id: String,
    pub phase: TurnPhase,
    #[source]
    pub source: TurnFailure,
}

/// Errors from assembling an orchestrator.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("No {0} gateway configured")]
    MissingGateway(&'static str),

    #[error("No criteria registry configured")]
    MissingRegistry,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Loop and feature switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Total generate/evaluate rounds, including the first
    pub max_iterations: u32,

    pub enable_input_critique: bool,

    /// When false every mode behaves like SIMPLE with respect to refinement
    pub enable_feedback_loop: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            enable_input_critique: true,
            enable_feedback_loop: true,
        }
    }
}

/// One user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub message: String,

    /// Existing conversation to continue; unknown ids start a new one
    pub conversation_id: Option<String>,

    pub mode: ConversationMode,

    /// Skip the input critique (e.g. the client retries an already critiqued message)
    pub skip_input_critique: bool,

    /// Client-side id echoed on input evaluation events
    pub message_id: Option<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>, mode: ConversationMode) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
            mode,
            skip_input_critique: false,
            message_id: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub conversation_id: String,
    pub response: String,
    pub evaluation: Evaluation,
    /// Generate/evaluate rounds performed
    pub iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_critique: Option<Evaluation>,
}

/// Optional live event target for a turn.
#[derive(Clone, Copy)]
struct Emitter<'a> {
    target: Option<(&'a dyn EventSink, &'a str)>,
}

impl<'a> Emitter<'a> {
    fn silent() -> Self {
        Self { target: None }
    }

    fn live(sink: &'a dyn EventSink, client_id: &'a str) -> Self {
        Self {
            target: Some((sink, client_id)),
        }
    }

    fn is_live(&self) -> bool {
        self.target.is_some()
    }

    fn emit(&self, event: TurnEvent) {
        if let Some((sink, client_id)) = self.target {
            let kind = event.kind();
            if let Err(e) = sink.send(client_id, event) {
                tracing::debug!(client_id, event = kind, error = %e, "Dropped turn event");
            }
        }
    }
}

/// Drives turns; the single writer of conversation history.
pub struct Orchestrator {
    responder: Responder,
    judge: JudgeEngine,
    store: Arc<ConversationStore>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        responder: Responder,
        judge: JudgeEngine,
        store: Arc<ConversationStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            responder,
            judge,
            store,
            settings,
        }
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    pub fn judge(&self) -> &JudgeEngine {
        &self.judge
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one turn without live events.
    ///
    /// # Arguments
    ///
    /// * `user_message` - The new user message
    /// * `conversation_id` - Conversation to continue; unknown or absent ids start a new one
    /// * `mode` - Which path to run
    pub async fn process_turn(
        &self,
        user_message: &str,
        conversation_id: Option<&str>,
        mode: ConversationMode,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let request = TurnRequest::new(user_message, mode)
            .in_conversation(conversation_id.map(str::to_string));
        self.run_turn(request, Emitter::silent()).await
    }

    /// Run one turn, reporting progress to `sink` as it happens.
    ///
    /// A failure is also reported as an `error` event.
    pub async fn process_turn_streaming(
        &self,
        request: TurnRequest,
        sink: &dyn EventSink,
        client_id: &str,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let emitter = Emitter::live(sink, client_id);
        let result = self.run_turn(request, emitter).await;

        if let Err(e) = &result {
            emitter.emit(TurnEvent::Error {
                error: e.to_string(),
            });
        }
        result
    }

    /// Score a user message on its own, streaming each criterion to `sink`.
    ///
    /// Does not touch any conversation.
    pub async fn evaluate_input_streaming(
        &self,
        user_input: &str,
        message_id: Option<&str>,
        sink: &dyn EventSink,
        client_id: &str,
    ) -> Evaluation {
        self.critique_input(user_input, message_id, Emitter::live(sink, client_id))
            .await
    }

    /// Ordered messages of a conversation.
    pub fn get_history(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        self.store.history(conversation_id)
    }

    async fn run_turn(
        &self,
        request: TurnRequest,
        emitter: Emitter<'_>,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let turn = self.store.begin_turn(request.conversation_id.as_deref()).await;
        let conversation_id = turn.conversation_id().to_string();
        let prior = turn.history();
        turn.append(Message::user(request.message.as_str()));

        let fail = |phase: TurnPhase, source: TurnFailure| {
            tracing::error!(
                conversation_id = %conversation_id,
                phase = %phase,
                error = %source,
                "Turn failed"
            );
            OrchestrationError {
                conversation_id: conversation_id.clone(),
                phase,
                source,
            }
        };

        tracing::info!(
            conversation_id = %conversation_id,
            mode = %request.mode,
            history = prior.len(),
            "Processing turn"
        );

        let input_critique = if request.mode == ConversationMode::InputCritique
            && self.settings.enable_input_critique
            && !request.skip_input_critique
        {
            Some(
                self.critique_input(&request.message, request.message_id.as_deref(), emitter)
                    .await,
            )
        } else {
            None
        };

        let refinable = request.mode.allows_refinement() && self.settings.enable_feedback_loop;
        let max_iterations = if refinable {
            self.settings.max_iterations.max(1)
        } else {
            1
        };

        let mut iteration = 1;
        let mut response = self
            .produce(&request.message, &prior, None, &conversation_id, iteration, emitter)
            .await
            .map_err(|e| fail(TurnPhase::Generating, e.into()))?;
        let mut evaluation = self
            .evaluate(&request.message, &response, &prior, iteration, emitter)
            .await
            .map_err(|e| fail(TurnPhase::Evaluating, e.into()))?;

        while evaluation.should_regenerate && iteration < max_iterations {
            iteration += 1;
            tracing::info!(
                conversation_id = %conversation_id,
                iteration,
                previous_score = evaluation.overall_score,
                "Refining response"
            );
            emitter.emit(TurnEvent::ChatbotRefining {
                iteration,
                previous_score: evaluation.overall_score,
            });

            response = self
                .produce(
                    &request.message,
                    &prior,
                    Some((response.as_str(), &evaluation)),
                    &conversation_id,
                    iteration,
                    emitter,
                )
                .await
                .map_err(|e| fail(TurnPhase::Refining, e.into()))?;
            evaluation = self
                .evaluate(&request.message, &response, &prior, iteration, emitter)
                .await
                .map_err(|e| fail(TurnPhase::Evaluating, e.into()))?;
        }

        turn.append(Message::assistant(response.as_str()).with_metadata(assistant_metadata(
            &evaluation,
            iteration,
        )));
        drop(turn);

        tracing::info!(
            conversation_id = %conversation_id,
            iteration,
            score = evaluation.overall_score,
            traffic_light = %evaluation.traffic_light,
            "Turn complete"
        );

        let outcome = TurnOutcome {
            conversation_id,
            response,
            evaluation,
            iteration,
            input_critique,
        };

        if emitter.is_live() {
            emitter.emit(TurnEvent::FinalResponse {
                conversation_id: outcome.conversation_id.clone(),
                response: outcome.response.clone(),
                evaluation: outcome.evaluation.clone(),
                iteration: outcome.iteration,
                input_critique: outcome.input_critique.clone(),
            });
        }

        Ok(outcome)
    }

    async fn critique_input(
        &self,
        user_message: &str,
        message_id: Option<&str>,
        emitter: Emitter<'_>,
    ) -> Evaluation {
        let mut scores: Vec<CriterionScore> = Vec::new();
        let mut stream = self.judge.evaluate_input(user_message);

        while let Some(score) = stream.next().await {
            emitter.emit(TurnEvent::UserInputEvaluation {
                criterion: score.clone(),
                message_id: message_id.map(str::to_string),
            });
            scores.push(score);
        }

        let critique = self.judge.synthesizer().synthesize(scores);
        tracing::info!(
            score = critique.overall_score,
            traffic_light = %critique.traffic_light,
            "Input critique complete"
        );
        emitter.emit(TurnEvent::JudgeInputCritique {
            critique: critique.clone(),
            message_id: message_id.map(str::to_string),
        });
        critique
    }

    /// Generate (or refine, when `previous` is set) one response.
    async fn produce(
        &self,
        user_message: &str,
        prior: &[Message],
        previous: Option<(&str, &Evaluation)>,
        conversation_id: &str,
        iteration: u32,
        emitter: Emitter<'_>,
    ) -> Result<String, GatewayError> {
        if !emitter.is_live() {
            return match previous {
                None => self.responder.generate(user_message, prior).await,
                Some((response, evaluation)) => {
                    self.responder
                        .refine(user_message, response, evaluation)
                        .await
                }
            };
        }

        emitter.emit(TurnEvent::ChatbotGenerating { iteration });

        let mut chunks = match previous {
            None => self.responder.generate_stream(user_message, prior).await?,
            Some((response, evaluation)) => {
                self.responder
                    .refine_stream(user_message, response, evaluation)
                    .await?
            }
        };

        let mut response = String::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            response.push_str(&chunk);
            emitter.emit(TurnEvent::ChatbotChunk { chunk, iteration });
        }

        emitter.emit(TurnEvent::ChatbotResponse {
            response: response.clone(),
            conversation_id: conversation_id.to_string(),
            iteration,
        });
        Ok(response)
    }

    async fn evaluate(
        &self,
        user_message: &str,
        response: &str,
        prior: &[Message],
        iteration: u32,
        emitter: Emitter<'_>,
    ) -> Result<Evaluation, JudgeError> {
        if !emitter.is_live() {
            return self
                .judge
                .evaluate_response_batch(user_message, response, prior)
                .await;
        }

        self.judge.ensure_output_criteria()?;
        emitter.emit(TurnEvent::JudgeEvaluating { iteration });

        let mut scores: Vec<CriterionScore> = Vec::new();
        let mut stream = self.judge.evaluate_response(user_message, response, prior);
        while let Some(score) = stream.next().await {
            emitter.emit(TurnEvent::JudgeCriterionResult {
                criterion: score.clone(),
                iteration,
            });
            scores.push(score);
        }

        let evaluation = self.judge.synthesizer().synthesize(scores);
        tracing::info!(
            iteration,
            score = evaluation.overall_score,
            should_regenerate = evaluation.should_regenerate,
            "Response evaluation complete"
        );
        emitter.emit(TurnEvent::JudgeResult {
            evaluation: evaluation.clone(),
            iteration,
        });
        Ok(evaluation)
    }
}

fn assistant_metadata(evaluation: &Evaluation, iteration: u32) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("judge_score".to_string(), evaluation.overall_score.into());
    metadata.insert("iteration".to_string(), iteration.into());
    metadata.insert("refined".to_string(), (iteration > 1).into());
    metadata.insert(
        "traffic_light".to_string(),
        serde_json::to_value(evaluation.traffic_light).unwrap_or_default(),
    );
    metadata
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    responder: Option<Arc<dyn ModelGateway>>,
    judge: Option<Arc<dyn ModelGateway>>,
    registry: Option<Arc<CriteriaRegistry>>,
    store: Option<Arc<ConversationStore>>,
    config: RuntimeConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            responder: None,
            judge: None,
            registry: None,
            store: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Set the responder model.
    pub fn responder(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.responder = Some(gateway);
        self
    }

    /// Set the judge model. Defaults to the responder gateway.
    pub fn judge(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.judge = Some(gateway);
        self
    }

    pub fn registry(mut self, registry: Arc<CriteriaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share an existing store. A new empty store is used otherwise.
    pub fn store(mut self, store: Arc<ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the orchestrator, rejecting a registry with nothing to score.
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        let registry = self.registry.ok_or(BuildError::MissingRegistry)?;
        registry.ensure_scorable()?;

        let responder_gateway = self
            .responder
            .ok_or(BuildError::MissingGateway("responder"))?;
        let judge_gateway = self.judge.unwrap_or_else(|| responder_gateway.clone());

        let responder = Responder::new(responder_gateway, self.config.responder.completion_config())
            .with_history_window(self.config.responder_history_window);
        let judge = JudgeEngine::new(
            judge_gateway,
            registry,
            self.config.judge.completion_config(),
        )
        .with_history_window(self.config.judge_history_window);

        Ok(Orchestrator::new(
            responder,
            judge,
            self.store.unwrap_or_default(),
            self.config.orchestrator_settings(),
        ))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
