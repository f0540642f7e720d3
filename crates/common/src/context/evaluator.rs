//! Sufficiency Evaluator - Structured "keep searching?" decision

use crate::errors::{AppError, Result};
use crate::llm::{GenerationRequest, LanguageModel, StructuredSchema};
use crate::metrics;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

const EVALUATOR_PROMPT: &str = "You judge whether gathered knowledge is enough to answer a question.\n\
Return JSON with:\n\
- isSufficient: true if the knowledge fully answers the question\n\
- nextQuery: when not sufficient, one focused search query for the missing information\n\
Do not repeat a query that was already answered by the knowledge.";

/// Decision produced once per iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDecision {
    /// Whether the accumulated knowledge answers the question
    pub is_sufficient: bool,

    /// Query for the next iteration when more is needed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_query: Option<String>,
}

impl EvaluationDecision {
    pub fn sufficient() -> Self {
        Self { is_sufficient: true, next_query: None }
    }

    pub fn continue_with(query: impl Into<String>) -> Self {
        Self { is_sufficient: false, next_query: Some(query.into()) }
    }

    fn normalized(mut self) -> Self {
        self.next_query = self
            .next_query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        self
    }
}

/// Sufficiency evaluator
#[derive(Clone)]
pub struct SufficiencyEvaluator {
    model: Arc<dyn LanguageModel>,
    schema: StructuredSchema,
    attempts: usize,
}

impl SufficiencyEvaluator {
    pub fn new(model: Arc<dyn LanguageModel>, attempts: usize) -> Self {
        Self {
            model,
            schema: StructuredSchema::of::<EvaluationDecision>("evaluation_decision"),
            attempts: attempts.max(1),
        }
    }

    /// Evaluate the full chronological knowledge against the question.
    ///
    /// Retries up to the configured attempts. The last attempt's error is
    /// returned as is: schema failures are fatal to the turn, transport
    /// failures are for the caller to contain.
    pub async fn evaluate(&self, original_query: &str, knowledge: &[String]) -> Result<EvaluationDecision> {
        let request = GenerationRequest::new(
            EVALUATOR_PROMPT,
            format!(
                "Question: {}\n\nKnowledge gathered so far:\n{}",
                original_query,
                super::format_knowledge(knowledge)
            ),
        )
        .with_temperature(0.0);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&request).await {
                Ok(decision) => {
                    tracing::info!(
                        attempt,
                        is_sufficient = decision.is_sufficient,
                        next_query = decision.next_query.as_deref().unwrap_or(""),
                        "Sufficiency evaluated"
                    );
                    return Ok(decision);
                }
                Err(e) if attempt < self.attempts => {
                    metrics::record_evaluator_retry();
                    tracing::warn!(attempt, error = %e, "Evaluation failed, retrying");
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Evaluation failed");
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(&self, request: &GenerationRequest) -> Result<EvaluationDecision> {
        let start = Instant::now();
        let result = self.model.generate_structured(request, &self.schema).await;
        metrics::record_generation(start.elapsed().as_secs_f64(), "evaluate", result.is_ok());

        let decision: EvaluationDecision =
            serde_json::from_value(result?).map_err(|e| AppError::SchemaValidation {
                message: format!("evaluation decision does not match schema: {}", e),
            })?;
        Ok(decision.normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLanguageModel, OP_STRUCTURED};
    use serde_json::json;

    fn knowledge() -> Vec<String> {
        vec!["- Policy X covers renewals (policy-x.pdf)".to_string()]
    }

    #[tokio::test]
    async fn test_parses_decision() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_structured(Ok(json!({ "isSufficient": false, "nextQuery": "clause Y of policy X" })));
        let evaluator = SufficiencyEvaluator::new(model.clone(), 2);

        let decision = evaluator.evaluate("What is policy X?", &knowledge()).await.unwrap();

        assert_eq!(decision, EvaluationDecision::continue_with("clause Y of policy X"));
        let calls = model.calls();
        assert!(calls[0].request.messages[1].content.contains("policy-x.pdf"));
        assert!(calls[0].request.tools.is_empty());
    }

    #[tokio::test]
    async fn test_blank_next_query_is_none() {
        let model = Arc::new(MockLanguageModel::new());
        model.push_structured(Ok(json!({ "isSufficient": false, "nextQuery": "  " })));
        let evaluator = SufficiencyEvaluator::new(model, 2);

        let decision = evaluator.evaluate("q", &knowledge()).await.unwrap();
        assert_eq!(decision.next_query, None);
    }

    #[tokio::test]
    async fn test_retries_once_then_succeeds() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_structured(Ok(json!({ "sufficient": "yes" })))
            .push_structured(Ok(json!({ "isSufficient": true })));
        let evaluator = SufficiencyEvaluator::new(model.clone(), 2);

        let decision = evaluator.evaluate("q", &knowledge()).await.unwrap();
        assert!(decision.is_sufficient);
        assert_eq!(model.call_count(OP_STRUCTURED), 2);
    }

    #[tokio::test]
    async fn test_schema_failure_after_retry_is_fatal() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_structured(Ok(json!({ "isSufficient": "maybe" })))
            .push_structured(Err(AppError::SchemaValidation { message: "not JSON".into() }));
        let evaluator = SufficiencyEvaluator::new(model.clone(), 2);

        let err = evaluator.evaluate("q", &knowledge()).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaValidation { .. }));
        assert!(err.is_fatal_for_turn());
        assert_eq!(model.call_count(OP_STRUCTURED), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_fatal() {
        let model = Arc::new(MockLanguageModel::new());
        model
            .push_structured(Err(AppError::upstream("llm", "503")))
            .push_structured(Err(AppError::upstream("llm", "503")));
        let evaluator = SufficiencyEvaluator::new(model, 2);

        let err = evaluator.evaluate("q", &knowledge()).await.unwrap_err();
        assert!(!err.is_fatal_for_turn());
    }

    #[test]
    fn test_one_generation_sample_per_attempt() {
        let recorder = crate::metrics::testing::CaptureRecorder::default();
        let model = Arc::new(MockLanguageModel::new());
        let evaluator = SufficiencyEvaluator::new(model, 2);

        let decision = ::metrics::with_local_recorder(&recorder, || {
            tokio_test::block_on(evaluator.evaluate("q", &knowledge()))
        });

        tokio_test::assert_ok!(decision);
        assert_eq!(recorder.histograms("quarry_generation_duration_seconds"), 1);
    }

    #[test]
    fn test_schema_names_fields() {
        let schema = StructuredSchema::of::<EvaluationDecision>("evaluation_decision");
        assert!(schema.schema["properties"]["isSufficient"].is_object());
        assert!(schema.schema["properties"]["nextQuery"].is_object());
    }
}
