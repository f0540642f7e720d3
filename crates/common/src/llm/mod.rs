//! Text generation abstraction
//!
//! Provides a unified interface over chat-completion providers:
//! - Single-step generation with optional tool calling
//! - Structured (schema-constrained) generation
//! - Streaming generation
//!
//! A "step" is one model call. Multi-step tool sessions are driven by the
//! caller, which executes tool calls and feeds the results back.

mod mock;
mod openai;

pub use mock::{MockLanguageModel, RecordedCall, OP_GENERATE, OP_STREAM, OP_STRUCTURED};
pub use openai::{OpenAIChatModel, SseDecoder};

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message of a generation transcript
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Tool calls requested by an assistant message
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool messages: the call this message answers
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// A tool result answering `call_id`
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool the model may call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

/// Whether the model may call tools on this step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
}

/// Input for any generation call
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    /// System prompt plus one user message
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Output of one generation step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStep {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl GenerationStep {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), tool_calls: Vec::new() }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self { text: String::new(), tool_calls: calls }
    }
}

/// Named JSON schema for structured generation
#[derive(Debug, Clone)]
pub struct StructuredSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl StructuredSchema {
    /// Derive the schema of `T`
    pub fn of<T: schemars::JsonSchema>(name: &str) -> Self {
        let root = schemars::schema_for!(T);
        Self {
            name: name.to_string(),
            schema: serde_json::to_value(root.schema).unwrap_or_default(),
        }
    }
}

/// Events of a streaming generation
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    ToolResult { id: String, result: serde_json::Value },
    ToolError { id: String, message: String },
    Error(String),
    Done,
}

/// Ordered, finite event sequence of one streaming call
pub type EventStream = BoxStream<'static, StreamEvent>;

/// Trait for text generation providers
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One generation step; may return tool calls instead of (or with) text
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationStep>;

    /// Generate a JSON value constrained by `schema`.
    ///
    /// Fails with `SchemaValidation` when the output is not valid JSON.
    async fn generate_structured(
        &self,
        request: &GenerationRequest,
        schema: &StructuredSchema,
    ) -> Result<serde_json::Value>;

    /// Start a streaming generation
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<EventStream>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Parse model output that should be JSON, tolerating Markdown fences
pub fn parse_json_output(raw: &str) -> Result<serde_json::Value> {
    let fence = regex_lite::Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$")
        .map_err(|e| AppError::Internal { message: e.to_string() })?;
    let body = fence
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();

    serde_json::from_str(body).map_err(|e| AppError::SchemaValidation {
        message: format!("output is not valid JSON: {}", e),
    })
}

/// Create a language model based on configuration
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "llm.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIChatModel::new(config, key)?))
        }
        "mock" => Ok(Arc::new(MockLanguageModel::new())),
        other => {
            tracing::warn!(provider = other, "Unknown LLM provider, using mock");
            Ok(Arc::new(MockLanguageModel::new()))
        }
    }
}
