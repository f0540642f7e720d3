//! OpenAI vector store search client

use super::{SearchHit, SearchOptions, SemanticSearch};
use crate::config::SearchConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Searches an OpenAI vector store (`collection` = vector store id)
pub struct VectorStoreSearch {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_num_results: usize,
    ranking_options: RankingOptions,
}

#[derive(Serialize)]
struct RankingOptions {
    score_threshold: f32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<SearchResultItem>,
}

#[derive(Deserialize)]
struct SearchResultItem {
    file_id: String,
    filename: String,
    score: f32,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl VectorStoreSearch {
    /// Create a new client
    pub fn new(config: &SearchConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        })
    }
}

fn into_hits(response: SearchResponse, options: &SearchOptions) -> Vec<SearchHit> {
    response
        .data
        .into_iter()
        .filter(|item| item.score >= options.score_threshold)
        .take(options.max_results)
        .map(|item| SearchHit {
            file_id: item.file_id,
            filename: item.filename,
            score: item.score,
            content: item
                .content
                .into_iter()
                .filter(|part| part.kind == "text")
                .map(|part| part.text)
                .collect::<Vec<_>>()
                .join("\n"),
        })
        .collect()
}

#[async_trait]
impl SemanticSearch for VectorStoreSearch {
    async fn search(
        &self,
        query: &str,
        collection: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let url = format!("{}/vector_stores/{}/search", self.base_url, collection);
        let request = SearchRequest {
            query,
            max_num_results: options.max_results,
            ranking_options: RankingOptions {
                score_threshold: options.score_threshold,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::upstream("search", format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(
                "search",
                format!("API error {}: {}", status, body),
            ));
        }

        let parsed: SearchResponse = response.json().await.map_err(|e| {
            AppError::upstream("search", format!("Failed to parse response: {}", e))
        })?;

        Ok(into_hits(parsed, options))
    }

    fn provider_name(&self) -> &str {
        "openai-vector-store"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_mapping() {
        let raw = serde_json::json!({
            "object": "vector_store.search_results.page",
            "data": [
                {
                    "file_id": "file-1",
                    "filename": "policy-x.pdf",
                    "score": 0.82,
                    "content": [
                        {"type": "text", "text": "Policy X covers travel."},
                        {"type": "text", "text": "Clause Y limits hotels."}
                    ]
                },
                {
                    "file_id": "file-2",
                    "filename": "noise.txt",
                    "score": 0.1,
                    "content": [{"type": "text", "text": "unrelated"}]
                }
            ]
        });
        let response: SearchResponse = serde_json::from_value(raw).unwrap();
        let hits = into_hits(response, &SearchOptions::default());

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename, "policy-x.pdf");
        assert_eq!(hits[0].content, "Policy X covers travel.\nClause Y limits hotels.");
    }

    #[test]
    fn test_request_body() {
        let request = SearchRequest {
            query: "policy X",
            max_num_results: 10,
            ranking_options: RankingOptions { score_threshold: 0.3 },
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["max_num_results"], 10);
        assert!((body["ranking_options"]["score_threshold"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }
}
