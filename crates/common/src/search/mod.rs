//! Semantic search abstraction
//!
//! The loop only needs one operation from the search index: a ranked list of
//! document passages for a query within a collection. Ranking itself is the
//! provider's business.

mod mock;
mod vector_store;

pub use mock::MockSearch;
pub use vector_store::VectorStoreSearch;

use crate::config::SearchConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A ranked passage returned by the search provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub file_id: String,
    pub filename: String,
    /// Relevance score (0.0 - 1.0)
    pub score: f32,
    pub content: String,
}

/// Per-call search parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    pub max_results: usize,
    pub score_threshold: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 10,
            score_threshold: 0.3,
        }
    }
}

impl From<&SearchConfig> for SearchOptions {
    fn from(config: &SearchConfig) -> Self {
        Self {
            max_results: config.max_results,
            score_threshold: config.score_threshold,
        }
    }
}

/// Trait for semantic search providers
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    /// Search `collection` for passages relevant to `query`
    async fn search(
        &self,
        query: &str,
        collection: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>>;

    /// Get the provider name
    fn provider_name(&self) -> &str;
}

/// Create a search provider based on configuration
pub fn create_search(config: &SearchConfig, api_key: Option<&str>) -> Result<Arc<dyn SemanticSearch>> {
    match config.provider.as_str() {
        "openai" => {
            let key = api_key.ok_or_else(|| AppError::Configuration {
                message: "search.api_key (or llm.api_key) is required for the openai provider"
                    .to_string(),
            })?;
            Ok(Arc::new(VectorStoreSearch::new(config, key.to_string())?))
        }
        "mock" => Ok(Arc::new(MockSearch::new())),
        other => {
            tracing::warn!(provider = other, "Unknown search provider, using mock");
            Ok(Arc::new(MockSearch::new()))
        }
    }
}
