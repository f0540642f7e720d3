//! Knowledge Extractor - Bounded tool-augmented generation
//!
//! Runs one search-and-summarise session per loop iteration:
//! - The model may call `searchDocuments` a limited number of times
//! - Tool results and tool failures are fed back as tool messages
//! - The session ends when the model answers without tool calls, or when
//!   the step budget runs out (tools are withheld on the last step)
//!
//! The tool sub-loop is an explicit state machine over [`Phase`].

use super::search_tool::{SearchArgs, SearchTool, SearchToolOutput, SEARCH_TOOL_NAME};
use super::sources::FileRegistry;
use crate::errors::Result;
use crate::events::{EventSink, LoopEvent};
use crate::llm::{ChatMessage, GenerationRequest, LanguageModel, ToolCall, ToolChoice};
use crate::metrics;
use std::sync::Arc;
use std::time::Instant;

/// Result of one extraction session
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    /// Trimmed knowledge text; `None` means no new knowledge
    pub knowledge: Option<String>,

    /// Generation steps taken
    pub steps: usize,

    /// Searches actually executed
    pub searches: usize,
}

impl ExtractionOutcome {
    fn empty(steps: usize, searches: usize) -> Self {
        Self { knowledge: None, steps, searches }
    }
}

/// Where the tool sub-loop is
#[derive(Debug)]
enum Phase {
    /// Ask the model for the next step
    Generate,
    /// Execute the tool calls of the last step, in order
    RunTools(Vec<ToolCall>),
    /// The model answered
    Finish(String),
}

/// Knowledge extractor
#[derive(Clone)]
pub struct KnowledgeExtractor {
    model: Arc<dyn LanguageModel>,
    tool: SearchTool,
    max_steps: usize,
    max_searches: usize,
}

impl KnowledgeExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, tool: SearchTool, max_steps: usize, max_searches: usize) -> Self {
        Self {
            model,
            tool,
            max_steps: max_steps.max(1),
            max_searches,
        }
    }

    /// Extract knowledge for `search_query`.
    ///
    /// Only configuration errors propagate; search and generation failures
    /// are contained.
    pub async fn extract(
        &self,
        original_query: &str,
        search_query: &str,
        prior_knowledge: &[String],
        files: &mut FileRegistry,
        events: &EventSink,
    ) -> Result<ExtractionOutcome> {
        let mut transcript = vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(build_prompt(original_query, search_query, prior_knowledge)),
        ];
        let tools = vec![self.tool.definition()];

        let mut step = 0;
        let mut searches = 0;
        let mut phase = Phase::Generate;

        let text = loop {
            phase = match phase {
                Phase::Generate => {
                    step += 1;
                    let last_step = step >= self.max_steps;
                    let request = GenerationRequest {
                        messages: transcript.clone(),
                        tools: tools.clone(),
                        tool_choice: if last_step { ToolChoice::None } else { ToolChoice::Auto },
                        temperature: Some(0.2),
                        max_tokens: None,
                    };

                    let start = Instant::now();
                    let result = self.model.generate(&request).await;
                    metrics::record_generation(start.elapsed().as_secs_f64(), "extract", result.is_ok());

                    match result {
                        Ok(generated) if generated.tool_calls.is_empty() || last_step => {
                            if !generated.tool_calls.is_empty() {
                                tracing::debug!(step, "Ignoring tool calls on final extraction step");
                            }
                            Phase::Finish(generated.text)
                        }
                        Ok(generated) => {
                            transcript.push(ChatMessage::assistant(
                                generated.text,
                                generated.tool_calls.clone(),
                            ));
                            Phase::RunTools(generated.tool_calls)
                        }
                        Err(e) => {
                            tracing::warn!(step, error = %e, "Extraction step failed, no new knowledge");
                            return Ok(ExtractionOutcome::empty(step, searches));
                        }
                    }
                }
                Phase::RunTools(calls) => {
                    for call in calls {
                        let payload = self.run_tool(&call, &mut searches, files, events).await?;
                        transcript.push(ChatMessage::tool(call.id.clone(), payload.to_string()));
                    }
                    Phase::Generate
                }
                Phase::Finish(text) => break text,
            };
        };

        let knowledge = text.trim();
        tracing::info!(
            search_query = %search_query,
            steps = step,
            searches,
            knowledge_chars = knowledge.len(),
            "Extraction finished"
        );

        if knowledge.is_empty() {
            return Ok(ExtractionOutcome::empty(step, searches));
        }

        Ok(ExtractionOutcome {
            knowledge: Some(knowledge.to_string()),
            steps: step,
            searches,
        })
    }

    /// Execute one tool call and return the payload for the model
    async fn run_tool(
        &self,
        call: &ToolCall,
        searches: &mut usize,
        files: &mut FileRegistry,
        events: &EventSink,
    ) -> Result<serde_json::Value> {
        events
            .emit(LoopEvent::ToolInvoked {
                name: call.name.clone(),
                args: call.arguments.clone(),
            })
            .await;

        let output = if call.name != SEARCH_TOOL_NAME {
            tracing::warn!(tool = %call.name, "Model called an unknown tool");
            SearchToolOutput::failure(format!("unknown tool: {}", call.name))
        } else {
            match serde_json::from_value::<SearchArgs>(call.arguments.clone()) {
                Err(e) => SearchToolOutput::failure(format!("invalid arguments: {}", e)),
                Ok(args) if args.query.trim().is_empty() => {
                    SearchToolOutput::failure("invalid arguments: query must not be empty")
                }
                Ok(_) if *searches >= self.max_searches => {
                    metrics::record_search_limited();
                    tracing::debug!(limit = self.max_searches, "Search limit reached");
                    SearchToolOutput::failure(format!(
                        "search limit reached ({} searches); answer with what you have",
                        self.max_searches
                    ))
                }
                Ok(args) => {
                    self.tool.ensure_collection()?;
                    *searches += 1;
                    events
                        .emit(LoopEvent::SearchStarted { query: args.query.clone() })
                        .await;
                    self.tool.call(&args.query, files).await?
                }
            }
        };

        let result = output.to_json();
        events
            .emit(LoopEvent::ToolCompleted {
                name: call.name.clone(),
                result: result.clone(),
            })
            .await;
        Ok(result)
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a research assistant that extracts knowledge from a document collection.\n\
             Use the {tool} tool to find passages relevant to the search query. \
             Make at most {max} searches.\n\
             Then reply with 3-5 concise bullet points of facts that help answer the user's \
             question. Each bullet must name the filename of its supporting document.\n\
             Do not repeat facts that are already known.\n\
             If the documents contain nothing relevant, reply with an empty message.",
            tool = SEARCH_TOOL_NAME,
            max = self.max_searches,
        )
    }
}

fn build_prompt(original_query: &str, search_query: &str, prior_knowledge: &[String]) -> String {
    let mut prompt = format!("User question: {}\n\nSearch query: {}\n", original_query, search_query);
    if !prior_knowledge.is_empty() {
        prompt.push_str("\nAlready known:\n");
        prompt.push_str(&super::format_knowledge(prior_knowledge));
    }
    prompt
}
