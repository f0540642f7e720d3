//! Agentic Loop - Iterative retrieve, evaluate, repeat
//!
//! Drives one user turn:
//! 1. Consolidate the conversation into a standalone query
//! 2. Iterate: extract knowledge, then evaluate sufficiency
//! 3. Stop on sufficiency, iteration cap, empty extraction or no next query
//! 4. Stream the answer and report the deduplicated sources
//!
//! Only configuration and schema errors abort the turn.

use super::consolidator::QueryConsolidator;
use super::evaluator::{EvaluationDecision, SufficiencyEvaluator};
use super::extractor::KnowledgeExtractor;
use super::search_tool::SearchTool;
use super::sources::{FileReference, FileRegistry};
use super::synthesizer::{SynthesisOptions, SynthesisStatus, Synthesizer};
use crate::config::{AgentConfig, SearchConfig};
use crate::errors::{AppError, Result};
use crate::events::{EventSink, LoopEvent};
use crate::llm::LanguageModel;
use crate::metrics;
use crate::search::{SearchOptions, SemanticSearch};
use crate::session::{prior_user_turns, ConversationTurn, SessionState, SessionUpdate};
use std::sync::Arc;
use std::time::Instant;

/// Working state of one loop execution
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    /// Iterations started so far
    pub iteration: usize,
    pub current_query: String,
    /// One entry per productive iteration, oldest first
    pub knowledge: Vec<String>,
    pub max_iterations: usize,
}

impl LoopState {
    pub fn new(query: impl Into<String>, max_iterations: usize) -> Self {
        Self {
            iteration: 0,
            current_query: query.into(),
            knowledge: Vec::new(),
            max_iterations,
        }
    }
}

/// Why the loop stopped iterating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Sufficient,
    MaxIterations,
    NoNewKnowledge,
    NoNextQuery,
    /// The evaluator failed without a schema error
    EvaluationFailed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Sufficient => "sufficient",
            StopReason::MaxIterations => "max_iterations",
            StopReason::NoNewKnowledge => "no_new_knowledge",
            StopReason::NoNextQuery => "no_next_query",
            StopReason::EvaluationFailed => "evaluation_failed",
        }
    }
}

/// Next move after an evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue(String),
    Stop(StopReason),
}

/// Apply the stopping policy to one decision
pub fn decide(decision: &EvaluationDecision, iteration: usize, max_iterations: usize) -> Transition {
    if decision.is_sufficient {
        return Transition::Stop(StopReason::Sufficient);
    }
    if iteration >= max_iterations {
        return Transition::Stop(StopReason::MaxIterations);
    }
    match &decision.next_query {
        Some(query) => Transition::Continue(query.clone()),
        None => Transition::Stop(StopReason::NoNextQuery),
    }
}

/// Everything a finished turn produced
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Input session with `update` applied; the version is unchanged
    pub session: SessionState,
    /// What to persist: the assistant turn (if any) and the search count
    pub update: SessionUpdate,
    pub answer: String,
    pub files: Vec<FileReference>,
    pub iterations: usize,
    pub searches: usize,
    pub stop_reason: StopReason,
    pub rewritten_query: String,
    pub synthesis: SynthesisStatus,
}

impl LoopOutcome {
    /// Emit `sources` then `done`
    pub async fn emit_completion(&self, events: &EventSink) {
        events.emit(LoopEvent::Sources { files: self.files.clone() }).await;
        events.emit(LoopEvent::Done {}).await;
    }
}

/// Loop controller
pub struct AgenticLoop {
    consolidator: QueryConsolidator,
    extractor: KnowledgeExtractor,
    evaluator: SufficiencyEvaluator,
    synthesizer: Synthesizer,
    max_iterations: usize,
}

impl AgenticLoop {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        search: Arc<dyn SemanticSearch>,
        search_config: &SearchConfig,
        agent: &AgentConfig,
    ) -> Self {
        let tool = SearchTool::new(
            search,
            search_config.collection.clone(),
            SearchOptions::from(search_config),
            agent.snippet_chars,
        );

        Self {
            consolidator: QueryConsolidator::new(model.clone()),
            extractor: KnowledgeExtractor::new(
                model.clone(),
                tool,
                agent.extractor_max_steps,
                agent.extractor_max_searches,
            ),
            evaluator: SufficiencyEvaluator::new(model.clone(), agent.evaluator_attempts),
            synthesizer: Synthesizer::new(model, SynthesisOptions::default()),
            max_iterations: agent.max_iterations.clamp(1, crate::DEFAULT_MAX_ITERATIONS),
        }
    }

    /// Rewrite `current` against the user turns in `history`
    pub async fn consolidate_query(&self, history: &[ConversationTurn], current: &str, events: &EventSink) -> String {
        self.consolidator
            .consolidate(&prior_user_turns(history), current, events)
            .await
    }

    /// Run the loop for the newest user turn of `session`.
    ///
    /// Nothing terminal is emitted: the caller persists the answer and then
    /// calls [`LoopOutcome::emit_completion`], or reports the error.
    pub async fn run(&self, session: SessionState, events: &EventSink) -> Result<LoopOutcome> {
        let message = session
            .pending_user_message()
            .ok_or_else(|| AppError::Validation {
                message: "session has no pending user message".to_string(),
                field: Some("history".to_string()),
            })?
            .to_string();

        let start = Instant::now();
        let question = self.consolidate_query(&session.history, &message, events).await;

        let mut state = LoopState::new(question.clone(), self.max_iterations);
        let mut files = FileRegistry::new();
        let mut searches = 0;

        let stop_reason = loop {
            state.iteration += 1;
            tracing::info!(
                session_id = %session.id,
                iteration = state.iteration,
                query = %state.current_query,
                "Iteration started"
            );

            let extraction = self
                .extractor
                .extract(&question, &state.current_query, &state.knowledge, &mut files, events)
                .await?;
            searches += extraction.searches;

            let Some(knowledge) = extraction.knowledge else {
                break StopReason::NoNewKnowledge;
            };
            state.knowledge.push(knowledge);

            let decision = match self.evaluator.evaluate(&question, &state.knowledge).await {
                Ok(decision) => decision,
                Err(e) if e.is_fatal_for_turn() => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Evaluation unavailable, synthesizing with current knowledge");
                    break StopReason::EvaluationFailed;
                }
            };

            match decide(&decision, state.iteration, state.max_iterations) {
                Transition::Continue(next) => state.current_query = next,
                Transition::Stop(reason) => break reason,
            }
        };

        let synthesis = self.synthesizer.synthesize(&question, &state.knowledge, events).await;
        let answer = synthesis.text.trim().to_string();

        let mut update = SessionUpdate {
            turns: Vec::new(),
            searches: searches as u64,
        };
        if !answer.is_empty() {
            update.turns.push(ConversationTurn::assistant(answer.clone()));
        }
        let mut session = session;
        session.apply(&update);

        let files = files.into_files();

        metrics::record_loop(stop_reason.as_str(), state.iteration);
        tracing::info!(
            session_id = %session.id,
            iterations = state.iteration,
            searches,
            files = files.len(),
            stop_reason = stop_reason.as_str(),
            latency_ms = start.elapsed().as_millis() as u64,
            "Agentic loop finished"
        );

        Ok(LoopOutcome {
            session,
            update,
            answer,
            files,
            iterations: state.iteration,
            searches,
            stop_reason,
            rewritten_query: question,
            synthesis: synthesis.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationStep, MockLanguageModel, ToolCall, OP_GENERATE, OP_STREAM, OP_STRUCTURED};
    use crate::search::MockSearch;
    use crate::session::Role;
    use serde_json::json;
    use uuid::Uuid;

    fn agent(model: Arc<MockLanguageModel>, search: Arc<MockSearch>) -> AgenticLoop {
        let search_config = SearchConfig {
            collection: Some("vs_docs".to_string()),
            ..SearchConfig::default()
        };
        AgenticLoop::new(model, search, &search_config, &AgentConfig::default())
    }

    fn session_with(turns: Vec<ConversationTurn>) -> SessionState {
        let mut session = SessionState::new(Uuid::new_v4());
        session.history = turns;
        session
    }

    fn search_step(query: &str) -> GenerationStep {
        GenerationStep::tool_calls(vec![ToolCall {
            id: format!("call-{}", query.len()),
            name: "searchDocuments".to_string(),
            arguments: json!({ "query": query }),
        }])
    }

    fn not_sufficient(next: &str) -> serde_json::Value {
        json!({ "isSufficient": false, "nextQuery": next })
    }

    async fn drain(mut rx: tokio::sync::mpsc::Receiver<LoopEvent>) -> Vec<LoopEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_decide_policy() {
        let sufficient = EvaluationDecision::sufficient();
        let more = EvaluationDecision::continue_with("clause Y");
        let stuck = EvaluationDecision { is_sufficient: false, next_query: None };

        assert_eq!(decide(&sufficient, 5, 5), Transition::Stop(StopReason::Sufficient));
        assert_eq!(decide(&more, 2, 5), Transition::Continue("clause Y".into()));
        assert_eq!(decide(&more, 5, 5), Transition::Stop(StopReason::MaxIterations));
        assert_eq!(decide(&stuck, 1, 5), Transition::Stop(StopReason::NoNextQuery));
    }

    #[tokio::test]
    async fn test_scenario_single_iteration_two_documents() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_step(Ok(search_step("policy X")))
            .push_step(Ok(GenerationStep::text("- Policy X governs renewals (policy-x.pdf, renewals.md)")));
        model.push_structured(Ok(json!({ "isSufficient": true })));
        let search = Arc::new(MockSearch::with_hits(vec![
            MockSearch::hit("policy-x.pdf", 0.91, "Policy X governs renewals"),
            MockSearch::hit("renewals.md", 0.74, "Renewals follow policy X"),
            MockSearch::hit("noise.txt", 0.1, "below threshold"),
        ]));
        let (sink, rx) = EventSink::channel(64);

        let session = session_with(vec![ConversationTurn::user("What is policy X?")]);
        let outcome = agent(model.clone(), search).run(session, &sink).await.unwrap();
        outcome.emit_completion(&sink).await;
        drop(sink);

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.stop_reason, StopReason::Sufficient);
        assert_eq!(outcome.rewritten_query, "What is policy X?");
        assert_eq!(model.call_count(OP_STREAM), 1);
        let names: Vec<_> = outcome.files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["policy-x.pdf", "renewals.md"]);

        assert_eq!(outcome.session.history.len(), 2);
        assert_eq!(outcome.session.history[1].role, Role::Assistant);
        assert_eq!(outcome.session.search_count, 1);

        let events = drain(rx).await;
        let n = events.len();
        assert_eq!(events[n - 2], LoopEvent::Sources { files: outcome.files.clone() });
        assert_eq!(events[n - 1], LoopEvent::Done {});
        assert!(events[..n - 2].iter().all(|e| !e.is_terminal() && e.kind() != "sources"));
        assert!(events.iter().all(|e| e.kind() != "query-rewritten"));
    }

    #[tokio::test]
    async fn test_scenario_follow_up_is_consolidated_before_search() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_step(Ok(GenerationStep::text("What does clause Y of policy X say?")))
            .push_step(Ok(search_step("clause Y policy X")))
            .push_step(Ok(GenerationStep::text("- Clause Y limits renewals (policy-x.pdf)")));
        let search = Arc::new(MockSearch::with_hits(vec![MockSearch::hit("policy-x.pdf", 0.8, "Clause Y")]));
        let (sink, rx) = EventSink::channel(64);

        let session = session_with(vec![
            ConversationTurn::user("What is policy X?"),
            ConversationTurn::assistant("Policy X governs renewals."),
            ConversationTurn::user("and clause Y?"),
        ]);
        let outcome = agent(model.clone(), search.clone()).run(session, &sink).await.unwrap();
        drop(sink);

        assert_eq!(outcome.rewritten_query, "What does clause Y of policy X say?");

        let events = drain(rx).await;
        let rewritten = events.iter().position(|e| e.kind() == "query-rewritten").unwrap();
        let searched = events.iter().position(|e| e.kind() == "search-started").unwrap();
        assert!(rewritten < searched);

        // The extractor works from the consolidated question
        let calls = model.calls();
        assert!(calls[1].request.messages[1].content.contains("clause Y of policy X"));
        assert_eq!(search.queries(), vec!["clause Y policy X".to_string()]);
    }

    #[tokio::test]
    async fn test_scenario_zero_results_skips_evaluation() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_step(Ok(search_step("policy Z")))
            .push_step(Ok(GenerationStep::text("  ")));
        let (sink, rx) = EventSink::channel(64);

        let session = session_with(vec![ConversationTurn::user("What is policy Z?")]);
        let outcome = agent(model.clone(), Arc::new(MockSearch::new())).run(session, &sink).await.unwrap();
        outcome.emit_completion(&sink).await;
        drop(sink);

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.stop_reason, StopReason::NoNewKnowledge);
        assert_eq!(model.call_count(OP_STRUCTURED), 0);
        assert_eq!(model.call_count(OP_STREAM), 1);
        assert!(outcome.files.is_empty());
        assert!(!outcome.answer.is_empty());

        let events = drain(rx).await;
        assert!(events.contains(&LoopEvent::Sources { files: vec![] }));
    }

    #[tokio::test]
    async fn test_sufficient_at_third_iteration() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_structured(Ok(not_sufficient("second angle")))
            .push_structured(Ok(not_sufficient("third angle")))
            .push_structured(Ok(json!({ "isSufficient": true })));

        let session = session_with(vec![ConversationTurn::user("q")]);
        let outcome = agent(model.clone(), Arc::new(MockSearch::new()))
            .run(session, &EventSink::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.stop_reason, StopReason::Sufficient);
        assert_eq!(model.call_count(OP_STRUCTURED), 3);

        // Each evaluation sees every knowledge entry so far
        let calls = model.calls();
        let last_eval = calls.iter().filter(|c| c.operation == OP_STRUCTURED).last().unwrap();
        assert!(last_eval.request.messages[1].content.contains("### Iteration 3"));
    }

    #[tokio::test]
    async fn test_never_sufficient_stops_at_five() {
        let model = Arc::new(MockLanguageModel::new());
        for i in 0..6 {
            model.push_structured(Ok(not_sufficient(&format!("angle {}", i))));
        }

        let session = session_with(vec![ConversationTurn::user("q")]);
        let outcome = agent(model.clone(), Arc::new(MockSearch::new()))
            .run(session, &EventSink::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.stop_reason, StopReason::MaxIterations);
        assert_eq!(model.call_count(OP_STRUCTURED), 5);
        assert_eq!(model.call_count(OP_GENERATE), 5);
    }

    #[tokio::test]
    async fn test_configured_iterations_capped_at_five() {
        let model = Arc::new(MockLanguageModel::new());
        for i in 0..8 {
            model.push_structured(Ok(not_sufficient(&format!("angle {}", i))));
        }
        let agent_config = AgentConfig {
            max_iterations: 8,
            ..AgentConfig::default()
        };
        let search_config = SearchConfig {
            collection: Some("vs_docs".to_string()),
            ..SearchConfig::default()
        };

        let session = session_with(vec![ConversationTurn::user("q")]);
        let outcome = AgenticLoop::new(model.clone(), Arc::new(MockSearch::new()), &search_config, &agent_config)
            .run(session, &EventSink::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.stop_reason, StopReason::MaxIterations);
        assert_eq!(model.call_count(OP_STRUCTURED), 5);
    }

    #[tokio::test]
    async fn test_missing_next_query_stops() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_structured(Ok(json!({ "isSufficient": false })));

        let session = session_with(vec![ConversationTurn::user("q")]);
        let outcome = agent(model, Arc::new(MockSearch::new()))
            .run(session, &EventSink::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.stop_reason, StopReason::NoNextQuery);
    }

    #[tokio::test]
    async fn test_files_deduplicated_across_iterations() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_step(Ok(search_step("first")))
            .push_step(Ok(GenerationStep::text("- a (a.pdf)")))
            .push_step(Ok(search_step("second")))
            .push_step(Ok(GenerationStep::text("- a again (a.pdf)")));
        model
            .push_structured(Ok(not_sufficient("second")))
            .push_structured(Ok(json!({ "isSufficient": true })));
        let search = Arc::new(MockSearch::with_hits(vec![
            MockSearch::hit("a.pdf", 0.9, "a"),
            MockSearch::hit("b.pdf", 0.8, "b"),
        ]));

        let session = session_with(vec![ConversationTurn::user("q")]);
        let outcome = agent(model, search).run(session, &EventSink::disabled()).await.unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.searches, 2);
        assert_eq!(outcome.files.len(), 2);
    }

    #[tokio::test]
    async fn test_schema_failure_aborts_without_done() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_structured(Ok(json!({ "answer": 42 })))
            .push_structured(Ok(json!({ "answer": 42 })));
        let (sink, rx) = EventSink::channel(64);

        let session = session_with(vec![ConversationTurn::user("q")]);
        let err = agent(model.clone(), Arc::new(MockSearch::new())).run(session, &sink).await.unwrap_err();
        drop(sink);

        assert!(matches!(err, AppError::SchemaValidation { .. }));
        assert_eq!(model.call_count(OP_STREAM), 0);
        let events = drain(rx).await;
        assert!(events.iter().all(|e| !e.is_terminal() && e.kind() != "sources"));
    }

    #[tokio::test]
    async fn test_evaluator_outage_still_answers() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_structured(Err(AppError::upstream("llm", "503")))
            .push_structured(Err(AppError::upstream("llm", "503")));

        let session = session_with(vec![ConversationTurn::user("q")]);
        let outcome = agent(model.clone(), Arc::new(MockSearch::new()))
            .run(session, &EventSink::disabled())
            .await
            .unwrap();

        assert_eq!(outcome.stop_reason, StopReason::EvaluationFailed);
        assert_eq!(model.call_count(OP_STREAM), 1);
    }

    #[tokio::test]
    async fn test_missing_collection_aborts_turn() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_step(Ok(search_step("policy X")));
        let agent = AgenticLoop::new(
            model,
            Arc::new(MockSearch::new()),
            &SearchConfig::default(),
            &AgentConfig::default(),
        );

        let session = session_with(vec![ConversationTurn::user("q")]);
        let err = agent.run(session, &EventSink::disabled()).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_partial_answer_is_kept() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_stream(Ok(vec![
            crate::llm::StreamEvent::TextDelta("Policy X is ".into()),
            crate::llm::StreamEvent::Error("connection reset".into()),
        ]));

        let session = session_with(vec![ConversationTurn::user("q")]);
        let outcome = agent(model, Arc::new(MockSearch::new()))
            .run(session, &EventSink::disabled())
            .await
            .unwrap();

        assert!(matches!(outcome.synthesis, SynthesisStatus::Failed(_)));
        assert_eq!(outcome.update.turns, vec![ConversationTurn::assistant("Policy X is")]);
    }

    #[tokio::test]
    async fn test_requires_pending_user_message() {
        let session = session_with(vec![ConversationTurn::assistant("hello")]);
        let err = agent(Arc::new(MockLanguageModel::new()), Arc::new(MockSearch::new()))
            .run(session, &EventSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }
}
