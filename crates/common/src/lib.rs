//! Quarry Common Library
//!
//! Shared code for the Quarry services including:
//! - The agentic retrieval loop (consolidate, extract, evaluate, synthesize)
//! - Language model and semantic search client abstractions
//! - Conversation sessions with single-flight turns
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod search;
pub mod session;

// Re-export commonly used types
pub use config::AppConfig;
pub use context::{AgenticLoop, FileReference, LoopOutcome};
pub use errors::{AppError, Result};
pub use events::{EventSink, LoopEvent};
pub use llm::LanguageModel;
pub use search::SemanticSearch;
pub use session::{SessionManager, SessionState, SessionStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upper bound on loop iterations per turn
pub const DEFAULT_MAX_ITERATIONS: usize = 5;
