//! Core data model shared by the registry, the judge and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::criteria::Criterion;

/// Free-form metadata attached to a message.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id (`msg_` followed by 12 hex characters)
    pub id: String,

    pub role: Role,

    pub content: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with a fresh id and the current timestamp.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: generate_id("msg"),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Attach metadata to the message.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Generate a prefixed short id such as `conv_1a2b3c4d5e6f`.
pub fn generate_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..12])
}

/// Which side of the exchange a criterion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriteriaKind {
    Input,
    Output,
}

impl fmt::Display for CriteriaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriteriaKind::Input => f.write_str("input"),
            CriteriaKind::Output => f.write_str("output"),
        }
    }
}

/// How a turn is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// One generation, one evaluation, never refined
    Simple,
    /// Generation followed by the judge-driven refinement loop
    #[default]
    Feedback,
    /// The user message is critiqued first, then handled as `Feedback`
    InputCritique,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::Simple => "simple",
            ConversationMode::Feedback => "feedback",
            ConversationMode::InputCritique => "input_critique",
        }
    }

    /// Whether this mode allows the refinement loop to run.
    pub fn allows_refinement(&self) -> bool {
        !matches!(self, ConversationMode::Simple)
    }
}

impl fmt::Display for ConversationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a mode name is not recognised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown conversation mode '{0}' (expected simple, feedback or input_critique)")]
pub struct UnknownModeError(pub String);

impl FromStr for ConversationMode {
    type Err = UnknownModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "simple" => Ok(ConversationMode::Simple),
            "feedback" => Ok(ConversationMode::Feedback),
            "input_critique" => Ok(ConversationMode::InputCritique),
            _ => Err(UnknownModeError(s.to_string())),
        }
    }
}

/// The judge's verdict on one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub name: String,

    /// Score in [0, 100]
    pub score: f64,

    pub weight: f64,

    pub threshold: f64,

    /// `score >= threshold`
    pub passed: bool,

    #[serde(default)]
    pub feedback: Option<String>,

    /// Improvement suggestions returned alongside the score
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl CriterionScore {
    /// Build a score for `criterion`, clamping the raw score into [0, 100].
    pub fn new(criterion: &Criterion, score: f64, feedback: Option<String>) -> Self {
        let score = if score.is_finite() {
            score.clamp(0.0, 100.0)
        } else {
            0.0
        };

        Self {
            name: criterion.name.clone(),
            score,
            weight: criterion.weight,
            threshold: criterion.threshold,
            passed: score >= criterion.threshold,
            feedback,
            suggestions: Vec::new(),
        }
    }

    /// A zero score recorded when the criterion could not be evaluated.
    pub fn failed(criterion: &Criterion, detail: impl Into<String>) -> Self {
        Self {
            name: criterion.name.clone(),
            score: 0.0,
            weight: criterion.weight,
            threshold: criterion.threshold,
            passed: false,
            feedback: Some(detail.into()),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }
}

/// Three-level coarse quality signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficLight {
    Green,
    Orange,
    Red,
}

impl TrafficLight {
    /// Map a score onto a light: `>= green` is GREEN, `>= orange` is ORANGE, else RED.
    pub fn from_score(score: f64, thresholds: &TrafficLightThresholds) -> Self {
        if score >= thresholds.green_threshold {
            TrafficLight::Green
        } else if score >= thresholds.orange_threshold {
            TrafficLight::Orange
        } else {
            TrafficLight::Red
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            TrafficLight::Green => "🟢",
            TrafficLight::Orange => "🟠",
            TrafficLight::Red => "🔴",
        }
    }
}

impl fmt::Display for TrafficLight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficLight::Green => f.write_str("GREEN"),
            TrafficLight::Orange => f.write_str("ORANGE"),
            TrafficLight::Red => f.write_str("RED"),
        }
    }
}

/// Score bands for the traffic light.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficLightThresholds {
    #[serde(default = "default_green_threshold")]
    pub green_threshold: f64,

    #[serde(default = "default_orange_threshold")]
    pub orange_threshold: f64,
}

fn default_green_threshold() -> f64 {
    70.0
}

fn default_orange_threshold() -> f64 {
    40.0
}

impl Default for TrafficLightThresholds {
    fn default() -> Self {
        Self {
            green_threshold: default_green_threshold(),
            orange_threshold: default_orange_threshold(),
        }
    }
}

/// Aggregate judgement of one response (or one user input).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Weighted mean of the criterion scores, rounded to two decimals
    pub overall_score: f64,

    pub criteria_scores: Vec<CriterionScore>,

    /// Summary built from the criteria that did not pass
    pub feedback: String,

    /// `overall_score < overall_threshold`
    pub should_regenerate: bool,

    #[serde(default)]
    pub suggestions: Vec<String>,

    pub traffic_light: TrafficLight,
}

impl Evaluation {
    /// Names of the criteria that did not reach their threshold.
    pub fn failing_criteria(&self) -> impl Iterator<Item = &str> {
        self.criteria_scores
            .iter()
            .filter(|s| !s.passed)
            .map(|s| s.name.as_str())
    }
}
