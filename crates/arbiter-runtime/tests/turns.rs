//! End-to-end turns through the public orchestrator API with in-memory gateways.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arbiter_core::{ConversationMode, CriteriaRegistry, Role, TrafficLight};
use arbiter_runtime::{
    ChatMessage, CompletionConfig, ConnectionRegistry, GatewayError, ModelGateway, Orchestrator,
    RuntimeConfig, TurnRequest,
};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Answers "draft answer", or "refined answer" when asked to refine.
#[derive(Default)]
struct DraftThenRefine {
    context_sizes: Mutex<Vec<usize>>,
}

#[async_trait]
impl ModelGateway for DraftThenRefine {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        _system_prompt: Option<&str>,
        _config: &CompletionConfig,
    ) -> Result<String, GatewayError> {
        self.context_sizes.lock().push(messages.len());
        let refining = messages
            .last()
            .is_some_and(|m| m.content.contains("ORIGINAL RESPONSE"));
        Ok(if refining { "refined answer" } else { "draft answer" }.to_string())
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "draft-then-refine"
    }
}

/// Scores each criterion from a table, with a second table for refined answers.
struct Rubric {
    draft: HashMap<&'static str, f64>,
    refined: HashMap<&'static str, f64>,
}

impl Rubric {
    fn new(draft: &[(&'static str, f64)], refined: &[(&'static str, f64)]) -> Self {
        Self {
            draft: draft.iter().copied().collect(),
            refined: refined.iter().copied().collect(),
        }
    }

    /// Same score for every criterion.
    fn uniform(score: f64) -> Self {
        Self::new(&[("*", score)], &[("*", score)])
    }
}

#[async_trait]
impl ModelGateway for Rubric {
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        _system_prompt: Option<&str>,
        _config: &CompletionConfig,
    ) -> Result<String, GatewayError> {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        let table = if prompt.contains("refined answer") {
            &self.refined
        } else {
            &self.draft
        };

        let score = table
            .iter()
            .find(|(name, _)| prompt.contains(&format!("criterion '{name}'")))
            .map(|(_, score)| *score)
            .or_else(|| table.get("*").copied())
            .unwrap_or(0.0);

        Ok(format!(
            "```json\n{{\"score\": {score}, \"feedback\": \"scored {score}\"}}\n```"
        ))
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "rubric"
    }
}

fn weighted_criteria(profile: &str) -> Arc<CriteriaRegistry> {
    let yaml = format!(
        r#"
output_criteria:
  - name: accuracy
    weight: 0.5
    threshold: 70
  - name: clarity
    weight: 0.3
    threshold: 70
  - name: tone
    weight: 0.2
    threshold: 50
profiles:
  strict:
    overall_threshold: 80
  lenient:
    overall_threshold: 40
settings:
  active_profile: {profile}
"#
    );
    Arc::new(CriteriaRegistry::from_yaml(&yaml).unwrap())
}

fn orchestrator(
    registry: Arc<CriteriaRegistry>,
    responder: Arc<DraftThenRefine>,
    judge: Rubric,
) -> Orchestrator {
    Orchestrator::builder()
        .responder(responder)
        .judge(Arc::new(judge))
        .registry(registry)
        .config(RuntimeConfig::default())
        .build()
        .unwrap()
}

fn rubric_68_then_90() -> Rubric {
    Rubric::new(
        &[("accuracy", 80.0), ("clarity", 60.0), ("tone", 50.0)],
        &[("accuracy", 90.0), ("clarity", 90.0), ("tone", 90.0)],
    )
}

#[tokio::test]
async fn weighted_score_below_strict_profile_triggers_refinement() {
    let responder = Arc::new(DraftThenRefine::default());
    let orchestrator = orchestrator(weighted_criteria("strict"), responder, rubric_68_then_90());

    let outcome = orchestrator
        .process_turn("Explain borrowing", None, ConversationMode::Feedback)
        .await
        .unwrap();

    assert_eq!(outcome.iteration, 2);
    assert_eq!(outcome.response, "refined answer");
    assert_eq!(outcome.evaluation.overall_score, 90.0);
    assert_eq!(outcome.evaluation.traffic_light, TrafficLight::Green);
}

#[tokio::test]
async fn weighted_score_above_lenient_profile_is_kept() {
    let responder = Arc::new(DraftThenRefine::default());
    let orchestrator = orchestrator(weighted_criteria("lenient"), responder, rubric_68_then_90());

    let outcome = orchestrator
        .process_turn("Explain borrowing", None, ConversationMode::Feedback)
        .await
        .unwrap();

    let evaluation = &outcome.evaluation;
    assert_eq!(outcome.iteration, 1);
    assert_eq!(evaluation.overall_score, 68.0);
    assert!(!evaluation.should_regenerate);
    assert_eq!(evaluation.traffic_light, TrafficLight::Orange);

    let failing: Vec<&str> = evaluation.failing_criteria().collect();
    assert_eq!(failing, vec!["clarity"]);
    assert!(evaluation.feedback.contains("clarity: scored 60"));
}

#[tokio::test]
async fn responder_sees_prior_turns() {
    let responder = Arc::new(DraftThenRefine::default());
    let orchestrator = orchestrator(
        weighted_criteria("lenient"),
        responder.clone(),
        Rubric::uniform(95.0),
    );

    let first = orchestrator
        .process_turn("first", None, ConversationMode::Simple)
        .await
        .unwrap();
    orchestrator
        .process_turn("second", Some(&first.conversation_id), ConversationMode::Simple)
        .await
        .unwrap();

    assert_eq!(*responder.context_sizes.lock(), vec![1, 3]);
}

#[tokio::test]
async fn concurrent_turns_on_one_conversation_do_not_interleave() {
    let orchestrator = Arc::new(orchestrator(
        weighted_criteria("lenient"),
        Arc::new(DraftThenRefine::default()),
        Rubric::uniform(95.0),
    ));

    let id = orchestrator
        .process_turn("opening", None, ConversationMode::Simple)
        .await
        .unwrap()
        .conversation_id;

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            tokio::spawn(async move {
                orchestrator
                    .process_turn(&format!("message {i}"), Some(&id), ConversationMode::Simple)
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().conversation_id, id);
    }

    let history = orchestrator.get_history(&id).unwrap();
    assert_eq!(history.len(), 12);
    for pair in history.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
    }
}

#[tokio::test]
async fn live_turn_reaches_connected_client_as_json_frames() {
    let orchestrator = orchestrator(
        weighted_criteria("strict"),
        Arc::new(DraftThenRefine::default()),
        rubric_68_then_90(),
    );
    let connections = ConnectionRegistry::new();
    let mut rx = connections.connect("client-1");

    let outcome = orchestrator
        .process_turn_streaming(
            TurnRequest::new("Explain borrowing", ConversationMode::Feedback),
            &connections,
            "client-1",
        )
        .await
        .unwrap();
    connections.disconnect("client-1");

    let mut frames = Vec::new();
    while let Some(envelope) = rx.recv().await {
        frames.push(serde_json::to_value(&envelope).unwrap());
    }

    let kinds: Vec<&str> = frames.iter().map(|f| f["event"].as_str().unwrap()).collect();
    assert_eq!(kinds.first(), Some(&"chatbot_generating"));
    assert_eq!(kinds.last(), Some(&"final_response"));
    assert_eq!(kinds.iter().filter(|k| **k == "judge_criterion_result").count(), 6);
    assert!(kinds.contains(&"chatbot_refining"));
    assert!(frames.iter().all(|f| f["timestamp"].is_string()));

    let last = frames.last().unwrap();
    assert_eq!(last["data"]["conversation_id"], outcome.conversation_id.as_str());
    assert_eq!(last["data"]["iteration"], 2);
    assert_eq!(last["data"]["response"], "refined answer");
}

#[tokio::test]
async fn bundled_criteria_file_drives_an_input_critique_turn() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/criteria.yaml");
    let registry = Arc::new(CriteriaRegistry::from_file(path).unwrap());
    let orchestrator = orchestrator(
        registry.clone(),
        Arc::new(DraftThenRefine::default()),
        Rubric::uniform(75.0),
    );

    let outcome = orchestrator
        .process_turn("How do lifetimes work?", None, ConversationMode::InputCritique)
        .await
        .unwrap();

    let critique = outcome.input_critique.unwrap();
    assert_eq!(
        critique.criteria_scores.len(),
        registry.enabled(arbiter_core::CriteriaKind::Input).len()
    );
    assert_eq!(critique.overall_score, 75.0);
    assert_eq!(outcome.iteration, 1);
}
