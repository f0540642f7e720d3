//! OpenAI-compatible chat completions client

use super::{
    parse_json_output, ChatMessage, ChatRole, EventStream, GenerationRequest, GenerationStep,
    LanguageModel, StreamEvent, StructuredSchema, ToolCall, ToolChoice,
};
use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI chat completions client
pub struct OpenAIChatModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct WireMessage {
    role: ChatRole,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

fn function_type() -> String {
    "function".to_string()
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: function_type(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

/// Decode tool-call arguments; malformed JSON is kept as a string so the
/// tool can report it back to the model.
fn decode_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

impl OpenAIChatModel {
    /// Create a new client
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e)
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    fn build_request<'a>(&'a self, request: &GenerationRequest, stream: bool) -> ChatRequest<'a> {
        let tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|tool| WireTool {
                kind: "function",
                function: WireFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect();

        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some(match request.tool_choice {
                ToolChoice::Auto => "auto",
                ToolChoice::None => "none",
            })
        };

        ChatRequest {
            model: &self.model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools,
            tool_choice,
            temperature: request.temperature.unwrap_or(self.temperature),
            max_tokens: request.max_tokens,
            stream,
            response_format: None,
        }
    }

    /// POST to chat/completions, retrying transient failures
    async fn post(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let attempts = AtomicU32::new(0);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        let (client, api_key, max_retries) = (&self.client, &self.api_key, self.max_retries);
        let (url, attempts) = (&url, &attempts);

        backoff::future::retry(policy, || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let exhausted = attempt >= max_retries;

            let outcome = client
                .post(url)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(body)
                .send()
                .await;

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    let err = AppError::upstream("llm", format!("request failed: {}", e));
                    if exhausted || !(e.is_connect() || e.is_timeout()) {
                        return Err(backoff::Error::permanent(err));
                    }
                    tracing::warn!(attempt = attempt + 1, error = %e, "LLM request failed, retrying");
                    return Err(backoff::Error::transient(err));
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let text = response.text().await.unwrap_or_default();
            let err = AppError::upstream("llm", format!("API error {}: {}", status, text));
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if exhausted || !retryable {
                Err(backoff::Error::permanent(err))
            } else {
                tracing::warn!(attempt = attempt + 1, status = status.as_u16(), "LLM API error, retrying");
                Err(backoff::Error::transient(err))
            }
        })
        .await
    }

    async fn complete(&self, body: &ChatRequest<'_>) -> Result<ChatMessageResponse> {
        let response = self.post(body).await?;
        let parsed: ChatResponse = response.json().await.map_err(|e| {
            AppError::upstream("llm", format!("Failed to parse response: {}", e))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| AppError::upstream("llm", "Empty response from LLM"))
    }
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationStep> {
        let body = self.build_request(request, false);
        let message = self.complete(&body).await?;
        Ok(GenerationStep {
            text: message.content.unwrap_or_default(),
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: decode_arguments(&call.function.arguments),
                })
                .collect(),
        })
    }

    async fn generate_structured(
        &self,
        request: &GenerationRequest,
        schema: &StructuredSchema,
    ) -> Result<serde_json::Value> {
        let mut body = self.build_request(request, false);
        body.tools.clear();
        body.tool_choice = None;
        body.response_format = Some(serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "schema": schema.schema,
                "strict": false,
            }
        }));

        let content = self.complete(&body).await?.content.unwrap_or_default();
        parse_json_output(&content)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<EventStream> {
        let body = self.build_request(request, true);
        let response = self.post(&body).await?;

        let events = Box::pin(response.bytes_stream().eventsource());
        let stream = futures::stream::unfold(
            (events, SseDecoder::default(), false),
            |(mut events, mut decoder, finished)| async move {
                if finished {
                    return None;
                }
                match events.next().await {
                    Some(Ok(sse)) => {
                        let out = decoder.decode(&sse.data);
                        let finished = out
                            .iter()
                            .any(|e| matches!(e, StreamEvent::Done | StreamEvent::Error(_)));
                        Some((out, (events, decoder, finished)))
                    }
                    Some(Err(e)) => Some((
                        vec![StreamEvent::Error(format!("SSE stream error: {}", e))],
                        (events, decoder, true),
                    )),
                    None => Some((decoder.finish(), (events, decoder, true))),
                }
            },
        )
        .flat_map(futures::stream::iter)
        .boxed();

        Ok(stream)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Incremental decoder for chat-completion SSE payloads.
///
/// Text deltas are emitted as they arrive; tool-call fragments are
/// assembled by index and emitted when the choice finishes.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending_calls: BTreeMap<u64, PendingCall>,
    done: bool,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCallDelta>,
}

#[derive(Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u64,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

impl SseDecoder {
    /// Decode one SSE `data:` payload
    pub fn decode(&mut self, data: &str) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        if data.trim() == "[DONE]" {
            self.done = true;
            let mut out = self.flush_calls();
            out.push(StreamEvent::Done);
            return out;
        }

        let json: serde_json::Value = match serde_json::from_str(data) {
            Ok(json) => json,
            Err(e) => {
                self.done = true;
                return vec![StreamEvent::Error(format!("SSE parsing error: {}", e))];
            }
        };

        if let Some(error) = json.get("error") {
            self.done = true;
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .unwrap_or("An error occurred during streaming");
            return vec![StreamEvent::Error(message.to_string())];
        }

        let chunk: StreamChunk = match serde_json::from_value(json) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.done = true;
                return vec![StreamEvent::Error(format!("SSE data schema error: {}", e))];
            }
        };

        let mut out = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    out.push(StreamEvent::TextDelta(text));
                }
            }
            for delta in choice.delta.tool_calls {
                let pending = self.pending_calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    pending.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        pending.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        pending.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                out.extend(self.flush_calls());
            }
        }
        out
    }

    /// Called when the byte stream ends
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out = self.flush_calls();
        out.push(StreamEvent::Error(
            "SSE stream closed before response completed".to_string(),
        ));
        out
    }

    fn flush_calls(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.pending_calls)
            .into_values()
            .map(|call| {
                StreamEvent::ToolCall(ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments: decode_arguments(&call.arguments),
                })
            })
            .collect()
    }
}
