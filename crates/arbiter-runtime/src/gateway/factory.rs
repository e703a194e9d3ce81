//! Gateway factories, keyed by provider type.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = GatewayRegistry::with_defaults();
//! let responder = registry.create("anthropic", &serde_json::json!({}))?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{GatewayError, ModelGateway};

/// Creates gateways of one provider type from JSON configuration.
pub trait GatewayFactory: Send + Sync {
    /// Unique identifier for this provider type (e.g., "anthropic").
    fn provider_type(&self) -> &'static str;

    /// Create a gateway from provider-specific configuration.
    fn create(&self, config: &JsonValue) -> Result<Arc<dyn ModelGateway>, GatewayError>;

    /// Validate configuration without creating a gateway.
    fn validate_config(&self, config: &JsonValue) -> Result<(), GatewayError>;

    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    fn description(&self) -> &'static str {
        "Model gateway"
    }
}

/// Registry of available gateway factories.
#[derive(Default)]
pub struct GatewayRegistry {
    factories: BTreeMap<String, Arc<dyn GatewayFactory>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any existing one of the same type.
    pub fn register(&mut self, factory: Arc<dyn GatewayFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Create a gateway from type name and configuration.
    pub fn create(
        &self,
        provider_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn ModelGateway>, GatewayError> {
        let factory = self.factory(provider_type)?;
        factory.validate_config(config)?;
        factory.create(config)
    }

    /// Validate configuration for a provider type.
    pub fn validate(&self, provider_type: &str, config: &JsonValue) -> Result<(), GatewayError> {
        self.factory(provider_type)?.validate_config(config)
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }

    pub fn default_config(&self, provider_type: &str) -> Option<JsonValue> {
        self.factories
            .get(provider_type)
            .map(|f| f.default_config())
    }

    fn factory(&self, provider_type: &str) -> Result<&Arc<dyn GatewayFactory>, GatewayError> {
        self.factories.get(provider_type).ok_or_else(|| {
            GatewayError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                provider_type,
                self.available_types()
            ))
        })
    }

    /// Create a registry with all built-in gateways registered.
    #[cfg(feature = "anthropic")]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::AnthropicGatewayFactory));
        registry
    }

    /// Create a registry with all built-in gateways registered.
    #[cfg(not(feature = "anthropic"))]
    pub fn with_defaults() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}
