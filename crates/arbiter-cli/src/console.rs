//! Terminal rendering of turn events for `arbiter chat`.
//!
//! Response text goes to stdout as it streams; judge progress goes to stderr.

use std::io::Write;

use arbiter_core::CriterionScore;
use arbiter_runtime::{EventSink, SinkError, TurnEvent};

#[derive(Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for ConsoleSink {
    fn send(&self, client_id: &str, event: TurnEvent) -> Result<(), SinkError> {
        render(&event).map_err(|_| SinkError::Disconnected(client_id.to_string()))
    }
}

fn render(event: &TurnEvent) -> std::io::Result<()> {
    let mut err = std::io::stderr().lock();
    match event {
        TurnEvent::UserInputEvaluation { criterion, .. } => {
            writeln!(err, "  input {}", score_line(criterion))
        }
        TurnEvent::JudgeInputCritique { critique, .. } => writeln!(
            err,
            "Input critique: {:.2} {}\n",
            critique.overall_score, critique.traffic_light
        ),
        TurnEvent::ChatbotGenerating { iteration } if *iteration > 1 => {
            writeln!(err, "--- round {iteration} ---")
        }
        TurnEvent::ChatbotGenerating { .. } => Ok(()),
        TurnEvent::ChatbotChunk { chunk, .. } => {
            let mut out = std::io::stdout().lock();
            out.write_all(chunk.as_bytes())?;
            out.flush()
        }
        TurnEvent::ChatbotResponse { .. } => {
            let mut out = std::io::stdout().lock();
            writeln!(out)
        }
        TurnEvent::ChatbotRefining {
            iteration,
            previous_score,
        } => writeln!(
            err,
            "Score {previous_score:.2} is below the threshold, refining (round {iteration})"
        ),
        TurnEvent::JudgeEvaluating { .. } => writeln!(err, "Judging..."),
        TurnEvent::JudgeCriterionResult { criterion, .. } => {
            writeln!(err, "  {}", score_line(criterion))
        }
        TurnEvent::JudgeResult { evaluation, .. } => writeln!(
            err,
            "  overall {:.2} {}",
            evaluation.overall_score, evaluation.traffic_light
        ),
        TurnEvent::FinalResponse { .. } => Ok(()),
        TurnEvent::Error { error } => writeln!(err, "error: {error}"),
    }
}

fn score_line(score: &CriterionScore) -> String {
    let mark = if score.passed { "✓" } else { "✗" };
    format!(
        "{mark} {:<16} {:>6.2} (threshold {})",
        score.name, score.score, score.threshold
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_line_marks_pass_and_fail() {
        let passing = CriterionScore {
            name: "accuracy".to_string(),
            score: 82.0,
            weight: 0.5,
            threshold: 70.0,
            passed: true,
            feedback: None,
            suggestions: Vec::new(),
        };
        let failing = CriterionScore {
            passed: false,
            score: 12.5,
            ..passing.clone()
        };

        assert!(score_line(&passing).starts_with("✓ accuracy"));
        assert!(score_line(&passing).contains("82.00"));
        assert!(score_line(&failing).starts_with("✗"));
    }
}
