//! Criteria definition parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::schema::validate_criteria_schema;
use crate::types::{CriteriaKind, TrafficLightThresholds};

/// Errors raised while loading or validating a criteria definition.
///
/// All of these are fatal at start-up.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read criteria file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Criteria file does not match schema: {}", .0.join("; "))]
    Schema(Vec<String>),

    #[error("Criteria validation failed: {0}")]
    Validation(String),

    #[error("No enabled {0} criteria configured")]
    NoEnabledCriteria(CriteriaKind),
}

/// A named, weighted rubric dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Criterion {
    /// Unique name within its set (e.g., "accuracy")
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Relative weight in [0, 1]
    pub weight: f64,

    /// Pass mark in [0, 100]
    pub threshold: f64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Extra guidance handed to the judge for this criterion
    #[serde(default)]
    pub evaluation_prompt: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// A named set of thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityProfile {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_overall_threshold")]
    pub overall_threshold: f64,
}

pub(crate) fn default_overall_threshold() -> f64 {
    60.0
}

/// The `settings` block of a criteria definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriteriaSettings {
    #[serde(default = "default_active_profile")]
    pub active_profile: String,

    #[serde(default)]
    pub traffic_light: TrafficLightThresholds,
}

fn default_active_profile() -> String {
    "moderate".to_string()
}

impl Default for CriteriaSettings {
    fn default() -> Self {
        Self {
            active_profile: default_active_profile(),
            traffic_light: TrafficLightThresholds::default(),
        }
    }
}

/// A complete criteria definition as read from disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CriteriaDefinition {
    /// Criteria applied to user input
    #[serde(default)]
    pub input_criteria: Vec<Criterion>,

    /// Criteria applied to responder output (legacy files call this `criteria`)
    #[serde(default, alias = "criteria")]
    pub output_criteria: Vec<Criterion>,

    #[serde(default)]
    pub profiles: BTreeMap<String, QualityProfile>,

    #[serde(default)]
    pub settings: CriteriaSettings,
}

impl CriteriaDefinition {
    /// Parse a definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a definition from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Load a definition from a file. `.json` files are read as JSON, anything
    /// else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Schema-check, deserialize and semantically validate a parsed document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        validate_criteria_schema(&value).map_err(ConfigError::Schema)?;
        let definition: CriteriaDefinition = serde_json::from_value(value)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Validate semantic rules the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_set("input_criteria", &self.input_criteria)?;
        self.validate_set("output_criteria", &self.output_criteria)?;

        let lights = &self.settings.traffic_light;
        if lights.green_threshold <= lights.orange_threshold {
            return Err(ConfigError::Validation(format!(
                "traffic_light.green_threshold ({}) must be greater than orange_threshold ({})",
                lights.green_threshold, lights.orange_threshold
            )));
        }

        for (name, profile) in &self.profiles {
            if !(0.0..=100.0).contains(&profile.overall_threshold) {
                return Err(ConfigError::Validation(format!(
                    "profile '{}' has overall_threshold {} outside [0, 100]",
                    name, profile.overall_threshold
                )));
            }
        }

        if !self.profiles.is_empty() && !self.profiles.contains_key(&self.settings.active_profile)
        {
            return Err(ConfigError::Validation(format!(
                "active profile '{}' is not declared in profiles",
                self.settings.active_profile
            )));
        }

        Ok(())
    }

    fn validate_set(&self, section: &str, criteria: &[Criterion]) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for criterion in criteria {
            if criterion.name.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{} contains a criterion with an empty name",
                    section
                )));
            }

            if !seen.insert(criterion.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate criterion name in {}: {}",
                    section, criterion.name
                )));
            }

            if !(0.0..=1.0).contains(&criterion.weight) {
                return Err(ConfigError::Validation(format!(
                    "{}.{}: weight {} outside [0, 1]",
                    section, criterion.name, criterion.weight
                )));
            }

            if !(0.0..=100.0).contains(&criterion.threshold) {
                return Err(ConfigError::Validation(format!(
                    "{}.{}: threshold {} outside [0, 100]",
                    section, criterion.name, criterion.threshold
                )));
            }
        }

        Ok(())
    }
}
