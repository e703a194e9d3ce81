//! # arbiter-core
//!
//! Deterministic building blocks for a responder/judge conversation system.
//!
//! This crate holds everything that does not talk to a model:
//! - the conversation data model ([`Message`], [`ConversationMode`])
//! - the criteria registry, loaded from a YAML/JSON definition file
//! - score aggregation into an [`Evaluation`] with a traffic light
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: the same scores and thresholds always aggregate the same way
//! 2. **No LLM calls**: model access lives in `arbiter-runtime`
//! 3. **Fail fast**: a malformed criteria file is rejected at load time
//!
//! ## Example
//!
//! ```rust,ignore
//! use arbiter_core::{CriteriaKind, CriteriaRegistry, Synthesizer};
//!
//! let registry = CriteriaRegistry::from_file("config/criteria.yaml")?;
//! registry.ensure_scorable()?;
//!
//! let synthesizer = Synthesizer::from_registry(&registry);
//! let evaluation = synthesizer.synthesize(scores);
//! println!("{} {}", evaluation.traffic_light.emoji(), evaluation.overall_score);
//! ```

pub mod criteria;
pub mod synthesizer;
pub mod types;

// Re-export main types at crate root
pub use criteria::{
    ConfigError, CriteriaDefinition, CriteriaRegistry, CriteriaSettings, Criterion,
    QualityProfile,
};
pub use synthesizer::Synthesizer;
pub use types::{
    generate_id, ConversationMode, CriteriaKind, CriterionScore, Evaluation, Message, Metadata,
    Role, TrafficLight, TrafficLightThresholds, UnknownModeError,
};
