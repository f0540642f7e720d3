//! Progress events emitted while a turn is processed
//!
//! The loop reports everything it does through one closed set of event
//! kinds. Transports serialise them as `{"type": "<kind>", ...}` and may
//! parse them back with [`LoopEvent::from_json`], which rejects unknown kinds.

use crate::context::FileReference;
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default buffer between the loop and its consumer
pub const EVENT_BUFFER: usize = 64;

/// A progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LoopEvent {
    /// A search is about to be executed
    SearchStarted { query: String },

    /// The consolidator rewrote the user's query
    QueryRewritten { original: String, rewritten: String },

    /// A fragment of the synthesized answer
    TextFragment { text: String },

    /// The model asked for a tool
    ToolInvoked { name: String, args: serde_json::Value },

    /// A tool finished; `result` is the payload handed back to the model
    ToolCompleted { name: String, result: serde_json::Value },

    /// Deduplicated documents consulted during the turn
    Sources { files: Vec<FileReference> },

    /// Something went wrong; fatal errors end the turn
    Error { message: String },

    /// The turn is complete
    Done {},
}

impl LoopEvent {
    /// Kind name, as used in the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            LoopEvent::SearchStarted { .. } => "search-started",
            LoopEvent::QueryRewritten { .. } => "query-rewritten",
            LoopEvent::TextFragment { .. } => "text-fragment",
            LoopEvent::ToolInvoked { .. } => "tool-invoked",
            LoopEvent::ToolCompleted { .. } => "tool-completed",
            LoopEvent::Sources { .. } => "sources",
            LoopEvent::Error { .. } => "error",
            LoopEvent::Done {} => "done",
        }
    }

    /// Parse and validate an event received from another layer
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| AppError::InvalidFormat {
            message: format!("invalid loop event: {}", e),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopEvent::Done {} | LoopEvent::Error { .. })
    }
}

/// Sending half of the event channel.
///
/// A sink whose receiver is gone reports `false` from [`EventSink::emit`];
/// the loop uses that to stop consuming the answer stream.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<LoopEvent>>,
}

impl EventSink {
    /// Create a connected sink and its receiver
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<LoopEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Deliver an event; returns false if the consumer has gone away
    pub async fn emit(&self, event: LoopEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => true,
        }
    }

    /// True once the receiving side has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(false, |tx| tx.is_closed())
    }
}
