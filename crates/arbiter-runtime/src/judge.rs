//! Judge engine: scores user input and responder output, one criterion at a time.
//!
//! Both evaluation operations return a lazy stream. Each criterion is scored
//! by its own structured request and yielded as soon as it completes, so a
//! live client sees results in declaration order while later criteria are
//! still being judged.
//!
//! A criterion whose request fails (transport error, malformed output) is
//! yielded as a zero score carrying the error text. The stream itself never
//! fails and always yields exactly one score per criterion.

use std::sync::Arc;

use arbiter_core::{
    CriteriaKind, CriteriaRegistry, Criterion, CriterionScore, Evaluation, Message, Synthesizer,
};
use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use thiserror::Error;

use crate::gateway::{generate_structured, ChatMessage, CompletionConfig, ModelGateway};
use crate::prompts;

/// Number of prior messages shown to the judge.
pub const DEFAULT_JUDGE_HISTORY_WINDOW: usize = 5;

/// Errors from batch evaluation.
#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("No enabled {0} criteria to evaluate")]
    NoCriteria(CriteriaKind),
}

/// A lazy, finite sequence of criterion scores.
pub type CriterionStream<'a> = BoxStream<'a, CriterionScore>;

/// The judge's reply for a single criterion.
#[derive(Debug, Deserialize)]
struct CriterionVerdict {
    score: f64,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Scores messages against the registry's criteria using the judge model.
pub struct JudgeEngine {
    gateway: Arc<dyn ModelGateway>,
    registry: Arc<CriteriaRegistry>,
    synthesizer: Synthesizer,
    config: CompletionConfig,
    history_window: usize,
}

impl JudgeEngine {
    /// Create a judge.
    ///
    /// # Arguments
    ///
    /// * `gateway` - The judge model
    /// * `registry` - Criteria and thresholds
    /// * `config` - Judge model settings (temperature is lowered for structured calls)
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        registry: Arc<CriteriaRegistry>,
        config: CompletionConfig,
    ) -> Self {
        Self {
            synthesizer: Synthesizer::from_registry(&registry),
            gateway,
            registry,
            config,
            history_window: DEFAULT_JUDGE_HISTORY_WINDOW,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn registry(&self) -> &CriteriaRegistry {
        &self.registry
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Enabled input criteria, or the output criteria when none are enabled.
    pub fn input_criteria(&self) -> Vec<&Criterion> {
        let criteria = self.registry.enabled(CriteriaKind::Input);
        if criteria.is_empty() {
            tracing::debug!("No input criteria enabled, falling back to output criteria");
            return self.registry.enabled(CriteriaKind::Output);
        }
        criteria
    }

    /// Score a user message, one criterion at a time.
    pub fn evaluate_input<'a>(&'a self, user_message: &'a str) -> CriterionStream<'a> {
        let criteria = self.input_criteria();

        stream! {
            for criterion in criteria {
                let prompt = prompts::input_criterion_prompt(criterion, user_message);
                yield self
                    .score_criterion(criterion, prompt, prompts::INPUT_JUDGE_SYSTEM_PROMPT)
                    .await;
            }
        }
        .boxed()
    }

    /// Score a response to `user_message`, one criterion at a time.
    ///
    /// `history` is the conversation before `user_message`.
    pub fn evaluate_response<'a>(
        &'a self,
        user_message: &'a str,
        response: &'a str,
        history: &'a [Message],
    ) -> CriterionStream<'a> {
        let criteria = self.registry.enabled(CriteriaKind::Output);

        stream! {
            for criterion in criteria {
                let prompt = prompts::output_criterion_prompt(
                    criterion,
                    user_message,
                    response,
                    history,
                    self.history_window,
                );
                yield self
                    .score_criterion(criterion, prompt, prompts::OUTPUT_JUDGE_SYSTEM_PROMPT)
                    .await;
            }
        }
        .boxed()
    }

    /// Drain [`evaluate_response`](Self::evaluate_response) and aggregate.
    ///
    /// Fails only when no output criterion is enabled.
    pub async fn evaluate_response_batch(
        &self,
        user_message: &str,
        response: &str,
        history: &[Message],
    ) -> Result<Evaluation, JudgeError> {
        self.ensure_output_criteria()?;

        let scores: Vec<CriterionScore> = self
            .evaluate_response(user_message, response, history)
            .collect()
            .await;

        let evaluation = self.synthesizer.synthesize(scores);
        tracing::info!(
            score = evaluation.overall_score,
            traffic_light = %evaluation.traffic_light,
            should_regenerate = evaluation.should_regenerate,
            "Response evaluation complete"
        );
        Ok(evaluation)
    }

    /// Whether the judge model is reachable.
    pub async fn health_check(&self) -> bool {
        self.gateway.health_check().await
    }

    pub fn ensure_output_criteria(&self) -> Result<(), JudgeError> {
        if self.registry.enabled(CriteriaKind::Output).is_empty() {
            return Err(JudgeError::NoCriteria(CriteriaKind::Output));
        }
        Ok(())
    }

    async fn score_criterion(
        &self,
        criterion: &Criterion,
        prompt: String,
        system_prompt: &str,
    ) -> CriterionScore {
        let hint = prompts::criterion_schema_hint();
        let result = generate_structured::<CriterionVerdict>(
            self.gateway.as_ref(),
            vec![ChatMessage::user(prompt)],
            Some(system_prompt),
            Some(&hint),
            &self.config,
        )
        .await;

        match result {
            Ok(verdict) => {
                let feedback = Some(verdict.feedback).filter(|f| !f.trim().is_empty());
                let score = CriterionScore::new(criterion, verdict.score, feedback)
                    .with_suggestions(verdict.suggestions);
                tracing::debug!(
                    criterion = %criterion.name,
                    score = score.score,
                    passed = score.passed,
                    "Criterion scored"
                );
                score
            }
            Err(e) => {
                tracing::warn!(
                    criterion = %criterion.name,
                    error = %e,
                    "Criterion evaluation failed, scoring as zero"
                );
                CriterionScore::failed(criterion, format!("Evaluation error: {}", e))
            }
        }
    }
}
