//! LLM Synthesizer - Streams the final answer from gathered knowledge
//!
//! Provides:
//! - Knowledge-grounded streaming answer generation
//! - Filename suppression (sources travel separately as a file list)
//! - A "nothing found" answer when no knowledge was gathered
//! - Partial-output preservation on stream failure or cancellation

use crate::errors::AppError;
use crate::events::{EventSink, LoopEvent};
use crate::llm::{GenerationRequest, LanguageModel, StreamEvent};
use crate::metrics;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

const SYNTHESIS_PROMPT: &str = "You are a helpful assistant answering questions from research notes.\n\
Answer the user's question comprehensively using only the knowledge provided.\n\
Never mention file names, document names or sources; they are shown to the user separately.\n\
If the knowledge does not cover part of the question, say so plainly.";

const NO_KNOWLEDGE_PROMPT: &str = "You are a helpful assistant.\n\
A search of the user's documents found no information relevant to their question.\n\
Tell the user briefly that no information was found in the selected documents, \
and suggest rephrasing the question or checking the document selection.\n\
Do not answer from general knowledge.";

/// Synthesis options
#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    /// Maximum output tokens
    pub max_tokens: Option<u32>,

    /// Temperature (0.0 - 1.0)
    pub temperature: f32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            max_tokens: Some(1500),
            temperature: 0.3,
        }
    }
}

/// How the answer stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisStatus {
    Completed,
    /// The stream failed to open or broke mid-way
    Failed(String),
    /// The event consumer went away
    Cancelled,
}

/// Synthesized answer
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOutcome {
    /// Everything received, including partial output
    pub text: String,
    pub status: SynthesisStatus,
}

/// LLM Synthesizer
#[derive(Clone)]
pub struct Synthesizer {
    model: Arc<dyn LanguageModel>,
    options: SynthesisOptions,
}

impl Synthesizer {
    /// Create a new synthesizer
    pub fn new(model: Arc<dyn LanguageModel>, options: SynthesisOptions) -> Self {
        Self { model, options }
    }

    /// Stream an answer to `original_query`, forwarding fragments as
    /// `text-fragment` events in arrival order.
    pub async fn synthesize(&self, original_query: &str, knowledge: &[String], events: &EventSink) -> SynthesisOutcome {
        let request = self.build_request(original_query, knowledge);
        let start = Instant::now();

        let mut stream = match self.model.generate_stream(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                metrics::record_generation(start.elapsed().as_secs_f64(), "synthesize", false);
                metrics::record_stream_error();
                tracing::error!(error = %e, "Failed to start answer stream");
                let message = AppError::Stream { message: e.to_string() }.to_string();
                events.emit(LoopEvent::Error { message: message.clone() }).await;
                return SynthesisOutcome {
                    text: String::new(),
                    status: SynthesisStatus::Failed(message),
                };
            }
        };

        let mut text = String::new();
        let mut status = SynthesisStatus::Completed;
        let mut fragments = 0usize;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    text.push_str(&delta);
                    fragments += 1;
                    if !events.emit(LoopEvent::TextFragment { text: delta }).await {
                        tracing::info!(fragments, "Event consumer gone, stopping answer stream");
                        status = SynthesisStatus::Cancelled;
                        break;
                    }
                }
                StreamEvent::ToolCall(call) => {
                    tracing::debug!(tool = %call.name, "Ignoring tool call during synthesis");
                }
                StreamEvent::ToolResult { id, .. } => {
                    tracing::debug!(call_id = %id, "Ignoring tool result during synthesis");
                }
                StreamEvent::ToolError { id, message } => {
                    tracing::warn!(call_id = %id, error = %message, "Tool error during synthesis");
                }
                StreamEvent::Error(message) => {
                    metrics::record_stream_error();
                    tracing::error!(error = %message, partial_chars = text.len(), "Answer stream failed");
                    events.emit(LoopEvent::Error { message: message.clone() }).await;
                    status = SynthesisStatus::Failed(message);
                    break;
                }
                StreamEvent::Done => break,
            }
        }

        metrics::record_generation(
            start.elapsed().as_secs_f64(),
            "synthesize",
            status == SynthesisStatus::Completed,
        );
        tracing::info!(
            fragments,
            chars = text.len(),
            status = ?status,
            latency_ms = start.elapsed().as_millis() as u64,
            "Synthesis finished"
        );

        SynthesisOutcome { text, status }
    }

    fn build_request(&self, original_query: &str, knowledge: &[String]) -> GenerationRequest {
        let (system, user) = if knowledge.is_empty() {
            (NO_KNOWLEDGE_PROMPT, format!("Question: {}", original_query))
        } else {
            (
                SYNTHESIS_PROMPT,
                format!(
                    "Question: {}\n\nKnowledge:\n{}",
                    original_query,
                    super::format_knowledge(knowledge)
                ),
            )
        };

        let mut request = GenerationRequest::new(system, user).with_temperature(self.options.temperature);
        request.max_tokens = self.options.max_tokens;
        request
    }
}
