//! Query Consolidator - Folds conversation context into one search query
//!
//! A follow-up like "and clause Y?" is useless to a search index on its
//! own. The consolidator merges every prior user utterance with the current
//! one into a single self-contained query that reflects the user's latest
//! intent. Failures fall back to the current utterance.

use crate::events::{EventSink, LoopEvent};
use crate::llm::{GenerationRequest, LanguageModel};
use crate::metrics;
use std::sync::Arc;
use std::time::Instant;

const CONSOLIDATOR_PROMPT: &str = "You rewrite conversational questions into standalone search queries.\n\
Merge the earlier user messages and the latest one into ONE self-contained query.\n\
Later messages may narrow or change earlier ones: the query must reflect the user's \
current intent, not a literal union of everything said.\n\
Reply with the query only. No explanation, no quotes.";

/// Query consolidator
#[derive(Clone)]
pub struct QueryConsolidator {
    model: Arc<dyn LanguageModel>,
}

impl QueryConsolidator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Merge `prior_user_turns` and `current` into one query.
    ///
    /// With no prior turns this is the identity and makes no model call.
    /// A `query-rewritten` event is emitted only when a rewrite was produced.
    pub async fn consolidate(
        &self,
        prior_user_turns: &[String],
        current: &str,
        events: &EventSink,
    ) -> String {
        if prior_user_turns.is_empty() {
            return current.to_string();
        }

        let request = GenerationRequest::new(CONSOLIDATOR_PROMPT, build_prompt(prior_user_turns, current))
            .with_temperature(0.0);

        let start = Instant::now();
        let result = self.model.generate(&request).await;
        metrics::record_generation(start.elapsed().as_secs_f64(), "consolidate", result.is_ok());

        let rewritten = match result {
            Ok(step) => clean(&step.text),
            Err(e) => {
                tracing::warn!(error = %e, "Query consolidation failed, using current query");
                return current.to_string();
            }
        };

        if rewritten.is_empty() {
            tracing::warn!("Query consolidation returned nothing, using current query");
            return current.to_string();
        }

        tracing::info!(
            original = %current,
            rewritten = %rewritten,
            prior_turns = prior_user_turns.len(),
            "Query consolidated"
        );

        events
            .emit(LoopEvent::QueryRewritten {
                original: current.to_string(),
                rewritten: rewritten.clone(),
            })
            .await;

        rewritten
    }
}

fn build_prompt(prior_user_turns: &[String], current: &str) -> String {
    let mut prompt = String::from("Earlier user messages (oldest first):\n");
    for (i, turn) in prior_user_turns.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, turn.trim()));
    }
    prompt.push_str(&format!("\nLatest user message:\n{}\n\nStandalone query:", current.trim()));
    prompt
}

/// Strip the wrapping some models add around a one-line answer
fn clean(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("Query:").unwrap_or(trimmed).trim();
    trimmed.trim_matches(|c| c == '"' || c == '\'' || c == '`').trim().to_string()
}
