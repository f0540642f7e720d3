//! The `searchDocuments` tool offered to the knowledge extractor
//!
//! Wraps a semantic search call, formats and truncates results for the
//! model, and registers every returned file with the loop's registry.
//! Search failures are reported to the model as data, never raised; the
//! only error this tool raises is a missing collection.

use super::sources::FileRegistry;
use crate::errors::{AppError, Result};
use crate::llm::ToolDefinition;
use crate::metrics;
use crate::search::{SearchHit, SearchOptions, SemanticSearch};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Tool name as exposed to the model
pub const SEARCH_TOOL_NAME: &str = "searchDocuments";

/// Arguments of `searchDocuments`
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// Natural-language search query
    pub query: String,
}

/// One formatted search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// 1-based rank
    pub rank: usize,
    pub filename: String,
    /// Rounded to two decimals
    pub score: f64,
    pub content_snippet: String,
    pub file_id: String,
}

/// Payload returned to the model
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SearchToolOutput {
    Failure {
        success: bool,
        message: String,
    },
    Results {
        found: bool,
        count: usize,
        results: Vec<SearchResult>,
    },
}

impl SearchToolOutput {
    pub fn failure(message: impl Into<String>) -> Self {
        SearchToolOutput::Failure {
            success: false,
            message: message.into(),
        }
    }

    fn results(results: Vec<SearchResult>) -> Self {
        SearchToolOutput::Results {
            found: !results.is_empty(),
            count: results.len(),
            results,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "success": false }))
    }
}

/// Search gateway adapter
#[derive(Clone)]
pub struct SearchTool {
    search: Arc<dyn SemanticSearch>,
    collection: Option<String>,
    options: SearchOptions,
    snippet_chars: usize,
}

impl SearchTool {
    pub fn new(
        search: Arc<dyn SemanticSearch>,
        collection: Option<String>,
        options: SearchOptions,
        snippet_chars: usize,
    ) -> Self {
        Self {
            search,
            collection: collection.filter(|c| !c.trim().is_empty()),
            options,
            snippet_chars,
        }
    }

    /// Tool definition handed to the model
    pub fn definition(&self) -> ToolDefinition {
        let schema = schemars::schema_for!(SearchArgs);
        ToolDefinition {
            name: SEARCH_TOOL_NAME.to_string(),
            description: "Search the selected document collection and return the most \
                relevant passages with their filenames and relevance scores."
                .to_string(),
            parameters: serde_json::to_value(schema.schema)
                .unwrap_or_else(|_| serde_json::json!({ "type": "object" })),
        }
    }

    /// The selected collection; fails when none is configured
    pub fn ensure_collection(&self) -> Result<&str> {
        self.collection.as_deref().ok_or_else(|| AppError::Configuration {
            message: "no search collection selected".to_string(),
        })
    }

    /// Run one search
    pub async fn call(&self, query: &str, files: &mut FileRegistry) -> Result<SearchToolOutput> {
        let collection = self.ensure_collection()?;

        let start = Instant::now();
        let hits = match self.search.search(query, collection, &self.options).await {
            Ok(hits) => hits,
            Err(e) => {
                metrics::record_search(start.elapsed().as_secs_f64(), "failure");
                tracing::warn!(query = %query, error = %e, "Search failed, reporting to model");
                return Ok(SearchToolOutput::failure(format!("Search failed: {}", e)));
            }
        };

        let elapsed = start.elapsed();
        if hits.is_empty() {
            metrics::record_search(elapsed.as_secs_f64(), "empty");
            tracing::debug!(query = %query, "Search returned no results");
            return Ok(SearchToolOutput::results(Vec::new()));
        }

        metrics::record_search(elapsed.as_secs_f64(), "success");
        let results: Vec<SearchResult> = hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| {
                files.register(&hit.filename, &hit.file_id);
                self.format_hit(i + 1, hit)
            })
            .collect();

        tracing::debug!(
            query = %query,
            results = results.len(),
            latency_ms = elapsed.as_millis() as u64,
            "Search completed"
        );
        Ok(SearchToolOutput::results(results))
    }

    fn format_hit(&self, rank: usize, hit: SearchHit) -> SearchResult {
        SearchResult {
            rank,
            score: round_score(hit.score),
            content_snippet: hit.content.chars().take(self.snippet_chars).collect(),
            filename: hit.filename,
            file_id: hit.file_id,
        }
    }
}

fn round_score(score: f32) -> f64 {
    (f64::from(score) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MockSearch;

    fn tool(search: Arc<MockSearch>, collection: Option<&str>) -> SearchTool {
        SearchTool::new(search, collection.map(String::from), SearchOptions::default(), 400)
    }

    #[tokio::test]
    async fn test_missing_collection_is_configuration_error() {
        let search = Arc::new(MockSearch::new());
        let mut files = FileRegistry::new();

        let err = tool(search.clone(), None).call("policy X", &mut files).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
        assert!(err.is_fatal_for_turn());
        assert_eq!(search.call_count(), 0);

        let blank = tool(search, Some("  ")).call("policy X", &mut files).await;
        assert!(blank.is_err());
    }

    #[tokio::test]
    async fn test_search_failure_is_payload() {
        let search = Arc::new(MockSearch::new());
        search.push_result(Err(AppError::upstream("search", "503")));
        let mut files = FileRegistry::new();

        let output = tool(search, Some("vs_1")).call("policy X", &mut files).await.unwrap();
        let json = output.to_json();
        assert_eq!(json["success"], false);
        assert!(json["message"].as_str().unwrap().contains("503"));
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_zero_results_shape() {
        let search = Arc::new(MockSearch::new());
        let mut files = FileRegistry::new();

        let output = tool(search, Some("vs_1")).call("nothing", &mut files).await.unwrap();
        assert_eq!(output.to_json(), serde_json::json!({"found": false, "count": 0, "results": []}));
    }

    #[tokio::test]
    async fn test_results_are_formatted_and_registered() {
        let long = "x".repeat(1000);
        let search = Arc::new(MockSearch::with_hits(vec![
            MockSearch::hit("policy-x.pdf", 0.8765, &long),
            MockSearch::hit("clauses.md", 0.5, "Clause Y"),
            MockSearch::hit("policy-x.pdf", 0.45, "second chunk of the same file"),
        ]));
        let mut files = FileRegistry::new();

        let output = tool(search, Some("vs_1")).call("policy X", &mut files).await.unwrap();
        let json = output.to_json();

        assert_eq!(json["found"], true);
        assert_eq!(json["count"], 3);
        assert_eq!(json["results"][0]["rank"], 1);
        assert_eq!(json["results"][0]["score"], 0.88);
        assert_eq!(json["results"][0]["contentSnippet"].as_str().unwrap().chars().count(), 400);
        assert_eq!(json["results"][2]["fileId"], "file-policy-x.pdf");
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_definition_schema() {
        let tool = tool(Arc::new(MockSearch::new()), Some("vs_1"));
        let definition = tool.definition();
        assert_eq!(definition.name, "searchDocuments");
        assert_eq!(definition.parameters["properties"]["query"]["type"], "string");
    }
}
