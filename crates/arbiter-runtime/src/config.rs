//! Runtime configuration.
//!
//! Values come from (lowest to highest precedence): built-in defaults, an
//! optional YAML file, and `ARBITER_*` environment variables. The CLI applies
//! its own flags on top.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::gateway::CompletionConfig;
use crate::judge::DEFAULT_JUDGE_HISTORY_WINDOW;
use crate::orchestrator::OrchestratorSettings;
use crate::responder::DEFAULT_RESPONDER_HISTORY_WINDOW;

/// Errors from loading runtime configuration.
#[derive(Error, Debug)]
pub enum RuntimeConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Settings for one logical model (responder or judge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Gateway provider type (e.g., "anthropic")
    pub provider: String,

    pub model: String,

    pub max_tokens: u32,

    pub temperature: f32,

    /// Request timeout, e.g. "60s" or "2m"
    #[serde(with = "duration_format")]
    pub timeout: Duration,

    /// Provider-specific gateway configuration (api_key, base_url, ...)
    pub gateway: JsonValue,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
            gateway: JsonValue::Object(Default::default()),
        }
    }
}

impl ModelSettings {
    /// Defaults for the judge: shorter replies, lower temperature.
    pub fn judge_defaults() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.3,
            ..Self::default()
        }
    }

    pub fn completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: self.timeout,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub responder: ModelSettings,

    pub judge: ModelSettings,

    /// Total generate/evaluate rounds per turn (at least 1)
    pub max_iterations: u32,

    pub enable_input_critique: bool,

    pub enable_feedback_loop: bool,

    /// Prior messages sent to the responder
    pub responder_history_window: usize,

    /// Prior messages shown to the judge
    pub judge_history_window: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            responder: ModelSettings::default(),
            judge: ModelSettings::judge_defaults(),
            max_iterations: 2,
            enable_input_critique: true,
            enable_feedback_loop: true,
            responder_history_window: DEFAULT_RESPONDER_HISTORY_WINDOW,
            judge_history_window: DEFAULT_JUDGE_HISTORY_WINDOW,
        }
    }
}

impl RuntimeConfig {
    /// Parse from YAML; missing keys take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, RuntimeConfigError> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        Ok(config.normalized())
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuntimeConfigError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|source| RuntimeConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&contents)
    }

    /// Apply `ARBITER_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, RuntimeConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RuntimeConfigError> {
        if let Some(v) = lookup("ARBITER_RESPONDER_MODEL") {
            self.responder.model = v;
        }
        if let Some(v) = lookup("ARBITER_JUDGE_MODEL") {
            self.judge.model = v;
        }
        if let Some(v) = lookup("ARBITER_RESPONDER_PROVIDER") {
            self.responder.provider = v;
        }
        if let Some(v) = lookup("ARBITER_JUDGE_PROVIDER") {
            self.judge.provider = v;
        }
        if let Some(v) = lookup("ARBITER_MAX_ITERATIONS") {
            self.max_iterations = parse_value("ARBITER_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("ARBITER_ENABLE_INPUT_CRITIQUE") {
            self.enable_input_critique = parse_bool("ARBITER_ENABLE_INPUT_CRITIQUE", &v)?;
        }
        if let Some(v) = lookup("ARBITER_ENABLE_FEEDBACK_LOOP") {
            self.enable_feedback_loop = parse_bool("ARBITER_ENABLE_FEEDBACK_LOOP", &v)?;
        }
        if let Some(v) = lookup("ARBITER_REQUEST_TIMEOUT") {
            let timeout =
                humantime::parse_duration(&v).map_err(|e| RuntimeConfigError::Invalid {
                    key: "ARBITER_REQUEST_TIMEOUT".to_string(),
                    value: v.clone(),
                    reason: e.to_string(),
                })?;
            self.responder.timeout = timeout;
            self.judge.timeout = timeout;
        }

        Ok(self.normalized())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_iterations: self.max_iterations.max(1),
            enable_input_critique: self.enable_input_critique,
            enable_feedback_loop: self.enable_feedback_loop,
        }
    }

    fn normalized(mut self) -> Self {
        if self.max_iterations == 0 {
            tracing::warn!("max_iterations of 0 raised to 1");
            self.max_iterations = 1;
        }
        self
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, RuntimeConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| RuntimeConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, RuntimeConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RuntimeConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

/// Serde adapter reading durations as humantime strings ("30s") or seconds.
mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => humantime::parse_duration(&text).map_err(serde::de::Error::custom),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.responder_history_window, 10);
        assert_eq!(config.judge_history_window, 5);
        assert_eq!(config.judge.temperature, 0.3);
        assert!(config.enable_feedback_loop);
    }

    #[test]
    fn test_yaml_with_humantime_timeout() {
        let yaml = r#"
responder:
  model: claude-haiku-4-5
  timeout: 90s
judge:
  timeout: 20
max_iterations: 3
"#;
        let config = RuntimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.responder.model, "claude-haiku-4-5");
        assert_eq!(config.responder.timeout, Duration::from_secs(90));
        assert_eq!(config.judge.timeout, Duration::from_secs(20));
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.responder.provider, "anthropic");
    }

    #[test]
    fn test_zero_iterations_clamped() {
        let config = RuntimeConfig::from_yaml("max_iterations: 0").unwrap();
        assert_eq!(config.max_iterations, 1);
        assert_eq!(config.orchestrator_settings().max_iterations, 1);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ARBITER_JUDGE_MODEL", "judge-model"),
            ("ARBITER_MAX_ITERATIONS", "4"),
            ("ARBITER_ENABLE_FEEDBACK_LOOP", "off"),
            ("ARBITER_REQUEST_TIMEOUT", "2m"),
        ]);
        let config = RuntimeConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.judge.model, "judge-model");
        assert_eq!(config.max_iterations, 4);
        assert!(!config.enable_feedback_loop);
        assert_eq!(config.responder.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_override_reports_key() {
        let err = RuntimeConfig::default()
            .with_overrides(|k| (k == "ARBITER_MAX_ITERATIONS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ARBITER_MAX_ITERATIONS"));
    }

    #[test]
    fn test_completion_config_mapping() {
        let settings = ModelSettings::judge_defaults();
        let completion = settings.completion_config();
        assert_eq!(completion.model, settings.model);
        assert_eq!(completion.max_tokens, 1024);
        assert_eq!(completion.timeout, Duration::from_secs(60));
    }
}
