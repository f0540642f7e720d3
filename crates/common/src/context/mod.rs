//! Agentic retrieval core
//!
//! The context layer turns a user turn into an answer:
//! - Query consolidation across conversation turns
//! - Bounded tool-augmented knowledge extraction
//! - Structured sufficiency evaluation
//! - Iteration and stopping policy
//! - Streamed answer synthesis with deduplicated sources

mod agentic_loop;
mod consolidator;
mod evaluator;
mod extractor;
mod search_tool;
mod sources;
mod synthesizer;

pub use agentic_loop::{decide, AgenticLoop, LoopOutcome, LoopState, StopReason, Transition};
pub use consolidator::QueryConsolidator;
pub use evaluator::{EvaluationDecision, SufficiencyEvaluator};
pub use extractor::{ExtractionOutcome, KnowledgeExtractor};
pub use search_tool::{SearchArgs, SearchResult, SearchTool, SearchToolOutput, SEARCH_TOOL_NAME};
pub use sources::{FileReference, FileRegistry};
pub use synthesizer::{SynthesisOptions, SynthesisOutcome, SynthesisStatus, Synthesizer};

/// Render knowledge entries in chronological order
pub fn format_knowledge(entries: &[String]) -> String {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| format!("### Iteration {}\n{}\n", i + 1, entry.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_knowledge_keeps_order() {
        let text = format_knowledge(&["- first".to_string(), "- second\n".to_string()]);
        assert_eq!(text, "### Iteration 1\n- first\n\n### Iteration 2\n- second\n");
        assert!(format_knowledge(&[]).is_empty());
    }
}
