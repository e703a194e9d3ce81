//! The responder: answers user messages and refines answers from judge feedback.

use std::sync::Arc;

use arbiter_core::{Evaluation, Message};

use crate::gateway::{ChatMessage, CompletionConfig, GatewayError, ModelGateway, TextStream};
use crate::prompts;

/// Number of prior messages sent to the responder.
pub const DEFAULT_RESPONDER_HISTORY_WINDOW: usize = 10;

/// Generates answers with the responder model.
pub struct Responder {
    gateway: Arc<dyn ModelGateway>,
    config: CompletionConfig,
    history_window: usize,
}

impl Responder {
    pub fn new(gateway: Arc<dyn ModelGateway>, config: CompletionConfig) -> Self {
        Self {
            gateway,
            config,
            history_window: DEFAULT_RESPONDER_HISTORY_WINDOW,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Whether the responder model is reachable.
    pub async fn health_check(&self) -> bool {
        self.gateway.health_check().await
    }

    /// Answer `user_message` given the prior conversation.
    pub async fn generate(
        &self,
        user_message: &str,
        history: &[Message],
    ) -> Result<String, GatewayError> {
        self.gateway
            .generate(
                self.answer_messages(user_message, history),
                Some(prompts::RESPONDER_SYSTEM_PROMPT),
                &self.config,
            )
            .await
    }

    /// Streaming form of [`generate`](Self::generate).
    pub async fn generate_stream(
        &self,
        user_message: &str,
        history: &[Message],
    ) -> Result<TextStream, GatewayError> {
        self.gateway
            .generate_stream(
                self.answer_messages(user_message, history),
                Some(prompts::RESPONDER_SYSTEM_PROMPT),
                &self.config,
            )
            .await
    }

    /// Produce an improved answer from the previous one and its evaluation.
    pub async fn refine(
        &self,
        user_message: &str,
        previous_response: &str,
        evaluation: &Evaluation,
    ) -> Result<String, GatewayError> {
        self.gateway
            .generate(
                refine_messages(user_message, previous_response, evaluation),
                Some(prompts::RESPONDER_SYSTEM_PROMPT),
                &self.config,
            )
            .await
    }

    /// Streaming form of [`refine`](Self::refine).
    pub async fn refine_stream(
        &self,
        user_message: &str,
        previous_response: &str,
        evaluation: &Evaluation,
    ) -> Result<TextStream, GatewayError> {
        self.gateway
            .generate_stream(
                refine_messages(user_message, previous_response, evaluation),
                Some(prompts::RESPONDER_SYSTEM_PROMPT),
                &self.config,
            )
            .await
    }

    fn answer_messages(&self, user_message: &str, history: &[Message]) -> Vec<ChatMessage> {
        prompts::responder_messages(user_message, history, self.history_window)
    }
}

fn refine_messages(
    user_message: &str,
    previous_response: &str,
    evaluation: &Evaluation,
) -> Vec<ChatMessage> {
    prompts::refinement_messages(
        user_message,
        previous_response,
        &evaluation.feedback,
        &evaluation.suggestions,
    )
}
