//! Read-only queries over a loaded criteria definition.

use std::path::Path;

use super::parser::{default_overall_threshold, ConfigError, CriteriaDefinition, Criterion};
use crate::types::{CriteriaKind, TrafficLightThresholds};

/// Holds the validated criteria sets and the active quality profile.
///
/// The registry is immutable once built; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CriteriaRegistry {
    definition: CriteriaDefinition,
}

impl CriteriaRegistry {
    /// Build a registry from an already parsed definition.
    pub fn new(definition: CriteriaDefinition) -> Result<Self, ConfigError> {
        definition.validate()?;
        Ok(Self { definition })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            definition: CriteriaDefinition::from_yaml(yaml)?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let definition = CriteriaDefinition::from_file(path.as_ref())?;
        tracing::debug!(
            path = %path.as_ref().display(),
            input = definition.input_criteria.len(),
            output = definition.output_criteria.len(),
            "Loaded criteria definition"
        );
        Ok(Self { definition })
    }

    /// All criteria of a kind, in declaration order.
    pub fn criteria(&self, kind: CriteriaKind) -> &[Criterion] {
        match kind {
            CriteriaKind::Input => &self.definition.input_criteria,
            CriteriaKind::Output => &self.definition.output_criteria,
        }
    }

    /// Enabled criteria of a kind, in declaration order.
    pub fn enabled(&self, kind: CriteriaKind) -> Vec<&Criterion> {
        self.criteria(kind).iter().filter(|c| c.enabled).collect()
    }

    pub fn active_profile(&self) -> &str {
        &self.definition.settings.active_profile
    }

    /// Overall pass mark from the active profile (60 when none is declared).
    pub fn overall_threshold(&self) -> f64 {
        self.definition
            .profiles
            .get(self.active_profile())
            .map(|p| p.overall_threshold)
            .unwrap_or_else(default_overall_threshold)
    }

    pub fn traffic_light_thresholds(&self) -> TrafficLightThresholds {
        self.definition.settings.traffic_light
    }

    pub fn definition(&self) -> &CriteriaDefinition {
        &self.definition
    }

    /// Fail unless at least one OUTPUT criterion is enabled.
    ///
    /// Input criteria may be empty; the judge falls back to the output set.
    pub fn ensure_scorable(&self) -> Result<(), ConfigError> {
        if self.enabled(CriteriaKind::Output).is_empty() {
            return Err(ConfigError::NoEnabledCriteria(CriteriaKind::Output));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
input_criteria:
  - name: clarity
    weight: 1.0
    threshold: 50
    enabled: false
output_criteria:
  - name: accuracy
    weight: 0.6
    threshold: 70
  - name: tone
    weight: 0.2
    threshold: 50
    enabled: false
  - name: clarity
    weight: 0.4
    threshold: 70
profiles:
  lenient:
    overall_threshold: 40
  moderate:
    overall_threshold: 65
"#;

    #[test]
    fn test_enabled_preserves_declaration_order() {
        let registry = CriteriaRegistry::from_yaml(YAML).unwrap();
        let names: Vec<&str> = registry
            .enabled(CriteriaKind::Output)
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["accuracy", "clarity"]);
        assert_eq!(registry.criteria(CriteriaKind::Output).len(), 3);
        assert!(registry.enabled(CriteriaKind::Input).is_empty());
    }

    #[test]
    fn test_overall_threshold_from_active_profile() {
        let registry = CriteriaRegistry::from_yaml(YAML).unwrap();
        assert_eq!(registry.active_profile(), "moderate");
        assert_eq!(registry.overall_threshold(), 65.0);
    }

    #[test]
    fn test_overall_threshold_default_without_profiles() {
        let registry = CriteriaRegistry::from_yaml(
            "output_criteria:\n  - name: a\n    weight: 1.0\n    threshold: 10\n",
        )
        .unwrap();
        assert_eq!(registry.overall_threshold(), 60.0);
        assert_eq!(registry.traffic_light_thresholds().green_threshold, 70.0);
    }

    #[test]
    fn test_ensure_scorable() {
        let registry = CriteriaRegistry::from_yaml(YAML).unwrap();
        assert!(registry.ensure_scorable().is_ok());

        let empty = CriteriaRegistry::from_yaml(
            "output_criteria:\n  - name: a\n    weight: 1.0\n    threshold: 10\n    enabled: false\n",
        )
        .unwrap();
        assert!(matches!(
            empty.ensure_scorable(),
            Err(ConfigError::NoEnabledCriteria(CriteriaKind::Output))
        ));
    }
}
