//! Synthesizer: aggregates per-criterion scores into an [`Evaluation`].
//!
//! The rules are fixed:
//! 1. `overall_score` is the weight-averaged criterion score, rounded to two
//!    decimals (0 when nothing was scored or every weight is zero)
//! 2. `should_regenerate` is `overall_score < overall_threshold`
//! 3. The traffic light comes from `overall_score` and the configured bands
//!
//! Aggregation never calls a model and never fails.

use crate::criteria::CriteriaRegistry;
use crate::types::{CriterionScore, Evaluation, TrafficLight, TrafficLightThresholds};

/// Aggregates criterion scores against a fixed set of thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Synthesizer {
    overall_threshold: f64,
    traffic_light: TrafficLightThresholds,
}

impl Synthesizer {
    pub fn new(overall_threshold: f64, traffic_light: TrafficLightThresholds) -> Self {
        Self {
            overall_threshold,
            traffic_light,
        }
    }

    /// Take the thresholds of the registry's active profile.
    pub fn from_registry(registry: &CriteriaRegistry) -> Self {
        Self::new(
            registry.overall_threshold(),
            registry.traffic_light_thresholds(),
        )
    }

    pub fn overall_threshold(&self) -> f64 {
        self.overall_threshold
    }

    /// Build the aggregate evaluation.
    ///
    /// # Arguments
    ///
    /// * `scores` - Criterion scores in the order they were produced
    pub fn synthesize(&self, scores: Vec<CriterionScore>) -> Evaluation {
        let overall_score = round2(weighted_mean(&scores));

        Evaluation {
            overall_score,
            should_regenerate: overall_score < self.overall_threshold,
            traffic_light: self.traffic_light(overall_score),
            feedback: build_feedback(&scores),
            suggestions: collect_suggestions(&scores),
            criteria_scores: scores,
        }
    }

    pub fn traffic_light(&self, score: f64) -> TrafficLight {
        TrafficLight::from_score(score, &self.traffic_light)
    }
}

/// `Σ(score·weight) / Σweight`, or 0 when the total weight is not positive.
pub fn weighted_mean(scores: &[CriterionScore]) -> f64 {
    let total_weight: f64 = scores.iter().map(|s| s.weight).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }

    let weighted: f64 = scores.iter().map(|s| s.score * s.weight).sum();
    (weighted / total_weight).clamp(0.0, 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn build_feedback(scores: &[CriterionScore]) -> String {
    if scores.is_empty() {
        return "No criteria were evaluated.".to_string();
    }

    let failing: Vec<String> = scores
        .iter()
        .filter(|s| !s.passed)
        .map(|s| match s.feedback.as_deref() {
            Some(text) if !text.trim().is_empty() => format!("{}: {}", s.name, text.trim()),
            _ => format!(
                "{}: scored {:.0}, below threshold {:.0}",
                s.name, s.score, s.threshold
            ),
        })
        .collect();

    if failing.is_empty() {
        format!("All {} criteria met their thresholds.", scores.len())
    } else {
        failing.join("\n")
    }
}

fn collect_suggestions(scores: &[CriterionScore]) -> Vec<String> {
    let mut suggestions = Vec::new();

    for score in scores.iter().filter(|s| !s.passed) {
        if !score.suggestions.is_empty() {
            suggestions.extend(score.suggestions.iter().cloned());
        } else if let Some(text) = score.feedback.as_deref().filter(|t| !t.trim().is_empty()) {
            suggestions.push(text.trim().to_string());
        }
    }

    suggestions
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new(60.0, TrafficLightThresholds::default())
    }
}
