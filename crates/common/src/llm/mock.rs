//! Scripted language model for development and tests
//!
//! Each operation pops the next scripted response from its own queue; when a
//! queue is empty a canned default is returned, which keeps the `mock`
//! provider usable without an API key.

use super::{
    ChatRole, EventStream, GenerationRequest, GenerationStep, LanguageModel, StreamEvent,
    StructuredSchema,
};
use crate::errors::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Operation names used when recording calls
pub const OP_GENERATE: &str = "generate";
pub const OP_STRUCTURED: &str = "structured";
pub const OP_STREAM: &str = "stream";

/// A request seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub operation: &'static str,
    pub request: GenerationRequest,
}

/// Mock language model
#[derive(Default)]
pub struct MockLanguageModel {
    steps: Mutex<VecDeque<Result<GenerationStep>>>,
    structured: Mutex<VecDeque<Result<serde_json::Value>>>,
    streams: Mutex<VecDeque<Result<Vec<StreamEvent>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `generate` call
    pub fn push_step(&self, step: Result<GenerationStep>) -> &Self {
        lock(&self.steps).push_back(step);
        self
    }

    /// Queue the result of the next `generate_structured` call
    pub fn push_structured(&self, value: Result<serde_json::Value>) -> &Self {
        lock(&self.structured).push_back(value);
        self
    }

    /// Queue the events of the next `generate_stream` call
    pub fn push_stream(&self, events: Result<Vec<StreamEvent>>) -> &Self {
        lock(&self.streams).push_back(events);
        self
    }

    /// All recorded calls, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls made for one operation
    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn record(&self, operation: &'static str, request: &GenerationRequest) {
        lock(&self.calls).push(RecordedCall {
            operation,
            request: request.clone(),
        });
    }
}

fn last_user_message(request: &GenerationRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationStep> {
        self.record(OP_GENERATE, request);
        if let Some(step) = lock(&self.steps).pop_front() {
            return step;
        }
        let question: String = last_user_message(request).chars().take(120).collect();
        Ok(GenerationStep::text(format!(
            "- No documents consulted for: {} [Mock response - LLM API key not configured]",
            question
        )))
    }

    async fn generate_structured(
        &self,
        request: &GenerationRequest,
        _schema: &StructuredSchema,
    ) -> Result<serde_json::Value> {
        self.record(OP_STRUCTURED, request);
        if let Some(value) = lock(&self.structured).pop_front() {
            return value;
        }
        Ok(serde_json::json!({ "isSufficient": true }))
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<EventStream> {
        self.record(OP_STREAM, request);
        let events = match lock(&self.streams).pop_front() {
            Some(scripted) => scripted?,
            None => vec![
                StreamEvent::TextDelta("Based on the gathered knowledge, ".to_string()),
                StreamEvent::TextDelta("here is a mock answer. ".to_string()),
                StreamEvent::TextDelta("[Mock response - LLM API key not configured]".to_string()),
                StreamEvent::Done,
            ],
        };
        Ok(futures::stream::iter(events).boxed())
    }

    fn model_name(&self) -> &str {
        "mock-llm"
    }
}
