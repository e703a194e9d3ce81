//! Prompt templates for the responder and the judge.
//!
//! Judge prompts are scoped to a single criterion: every criterion is a
//! separate structured request, which is what lets results stream one at a
//! time.

use arbiter_core::{Criterion, Message, Role};
use serde_json::Value as JsonValue;

use crate::gateway::ChatMessage;

/// System prompt for the responder model.
pub const RESPONDER_SYSTEM_PROMPT: &str = r#"You are a helpful, knowledgeable and professional assistant. Your goal is to give accurate, relevant and clear answers to user questions.

GUIDELINES:
- Provide accurate and factual information
- Be comprehensive yet concise
- Use clear and professional language
- Structure your answers well
- Admit when you don't know something
- Be respectful and appropriate"#;

/// System prompt for judging a responder answer.
pub const OUTPUT_JUDGE_SYSTEM_PROMPT: &str = r#"You are an expert evaluator of assistant responses.

You score ONE criterion at a time on a 0-100 scale.
Judge only the criterion you are given; do not invent other criteria.
Feedback must be specific and actionable.
Suggestions, if any, must be concrete changes to the response."#;

/// System prompt for judging a user message.
pub const INPUT_JUDGE_SYSTEM_PROMPT: &str = r#"You are an expert evaluator of user questions sent to an assistant.

You score ONE criterion at a time on a 0-100 scale.
Judge the question itself, not the topic it is about.
Feedback should tell the user how to phrase a clearer, more complete question."#;

/// Closing instruction shared by every per-criterion judge prompt.
const SCORE_INSTRUCTION: &str =
    "Give a score from 0 to 100, concise feedback, and optional suggestions for improvement.";

/// Shape of the per-criterion judge reply, shown to the model.
pub fn criterion_schema_hint() -> JsonValue {
    serde_json::json!({
        "score": "<number 0-100>",
        "feedback": "<text>",
        "suggestions": ["<optional concrete suggestion>"]
    })
}

/// Build the responder request: the last `window` prior messages plus the new
/// user message. System messages are not replayed.
pub fn responder_messages(
    user_message: &str,
    history: &[Message],
    window: usize,
) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(window);
    let mut messages: Vec<ChatMessage> = history[start..]
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();

    messages.push(ChatMessage::user(user_message));
    messages
}

/// Build the refinement request from the previous answer and the judge's verdict.
pub fn refinement_messages(
    user_message: &str,
    previous_response: &str,
    feedback: &str,
    suggestions: &[String],
) -> Vec<ChatMessage> {
    let suggestions_text = if suggestions.is_empty() {
        "- (none)".to_string()
    } else {
        suggestions
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let instruction = format!(
        "Your previous response has been evaluated, and here's the feedback:\n\n\
         ORIGINAL RESPONSE:\n{}\n\n\
         JUDGE'S FEEDBACK:\n{}\n\n\
         SPECIFIC SUGGESTIONS FOR IMPROVEMENT:\n{}\n\n\
         Please provide an improved response that addresses this feedback while keeping \
         it accurate and relevant. Focus on the specific suggestions.",
        previous_response, feedback, suggestions_text
    );

    vec![
        ChatMessage::user(user_message),
        ChatMessage::assistant(previous_response),
        ChatMessage::user(instruction),
    ]
}

/// Prompt for scoring a user message against one criterion.
pub fn input_criterion_prompt(criterion: &Criterion, user_message: &str) -> String {
    format!(
        "Evaluate the following user input on the criterion '{}': {}\n\n\
         USER INPUT:\n{}\n{}\n{}",
        criterion.name,
        criterion.description,
        user_message,
        guidance(criterion),
        SCORE_INSTRUCTION
    )
}

/// Prompt for scoring a response against one criterion.
///
/// `history` is the conversation before the current user message; only the
/// last `window` entries are rendered.
pub fn output_criterion_prompt(
    criterion: &Criterion,
    user_message: &str,
    response: &str,
    history: &[Message],
    window: usize,
) -> String {
    format!(
        "Evaluate the following assistant response on the criterion '{}': {}\n\n\
         USER'S QUESTION:\n{}\n\n\
         ASSISTANT'S RESPONSE:\n{}\n{}{}\n{}",
        criterion.name,
        criterion.description,
        user_message,
        response,
        render_history(history, window),
        guidance(criterion),
        SCORE_INSTRUCTION
    )
}

fn guidance(criterion: &Criterion) -> String {
    match criterion.evaluation_prompt.as_deref().map(str::trim) {
        Some(prompt) if !prompt.is_empty() => format!("\nEVALUATION QUESTION:\n{}\n", prompt),
        _ => String::new(),
    }
}

fn render_history(history: &[Message], window: usize) -> String {
    if history.is_empty() || window == 0 {
        return String::new();
    }

    let start = history.len().saturating_sub(window);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
        .collect();

    format!("\nCONVERSATION HISTORY:\n{}\n", lines.join("\n"))
}
