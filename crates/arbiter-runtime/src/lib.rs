//! # arbiter-runtime
//!
//! Model-backed half of Arbiter: the responder, the judge, the conversation
//! store and the turn orchestrator.
//!
//! `arbiter-core` holds the deterministic parts (criteria, scoring,
//! aggregation). This crate talks to hosted models through a
//! [`ModelGateway`] and never retries a failed call itself.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arbiter_core::{ConversationMode, CriteriaRegistry};
//! use arbiter_runtime::{GatewayRegistry, Orchestrator, RuntimeConfig};
//!
//! let config = RuntimeConfig::default().with_env_overrides()?;
//! let gateways = GatewayRegistry::with_defaults();
//! let orchestrator = Orchestrator::builder()
//!     .responder(gateways.create("anthropic", &config.responder.gateway)?)
//!     .judge(gateways.create("anthropic", &config.judge.gateway)?)
//!     .registry(Arc::new(CriteriaRegistry::from_file("config/criteria.yaml")?))
//!     .config(config)
//!     .build()?;
//!
//! let outcome = orchestrator
//!     .process_turn("What is Rust?", None, ConversationMode::Feedback)
//!     .await?;
//! println!("{} ({})", outcome.response, outcome.evaluation.traffic_light);
//! ```

pub mod config;
pub mod events;
pub mod gateway;
pub mod judge;
pub mod orchestrator;
pub mod prompts;
pub mod responder;
pub mod store;

pub use config::{ModelSettings, RuntimeConfig, RuntimeConfigError};
pub use events::{ConnectionRegistry, EventEnvelope, EventSink, SinkError, TurnEvent};
pub use gateway::{
    ChatMessage, CompletionConfig, GatewayError, GatewayFactory, GatewayRegistry, ModelGateway,
    TextStream,
};
pub use judge::{CriterionStream, JudgeEngine, JudgeError};
pub use orchestrator::{
    BuildError, OrchestrationError, Orchestrator, OrchestratorBuilder, OrchestratorSettings,
    TurnFailure, TurnOutcome, TurnPhase, TurnRequest,
};
pub use responder::Responder;
pub use store::{ConversationStore, StoreError, TurnHandle};
