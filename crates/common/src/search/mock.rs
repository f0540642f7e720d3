//! Mock search provider for development and tests

use super::{SearchHit, SearchOptions, SemanticSearch};
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Returns scripted results in order, then a fixed default list
#[derive(Default)]
pub struct MockSearch {
    scripted: Mutex<VecDeque<Result<Vec<SearchHit>>>>,
    default_hits: Vec<SearchHit>,
    queries: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockSearch {
    /// A provider that finds nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that returns `hits` for every query
    pub fn with_hits(hits: Vec<SearchHit>) -> Self {
        Self {
            default_hits: hits,
            ..Default::default()
        }
    }

    /// Queue the result of the next call
    pub fn push_result(&self, result: Result<Vec<SearchHit>>) -> &Self {
        lock(&self.scripted).push_back(result);
        self
    }

    /// Queries received so far
    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.queries).len()
    }

    /// Build a hit whose file id is derived from the filename
    pub fn hit(filename: &str, score: f32, content: &str) -> SearchHit {
        SearchHit {
            file_id: format!("file-{}", filename),
            filename: filename.to_string(),
            score,
            content: content.to_string(),
        }
    }
}

#[async_trait]
impl SemanticSearch for MockSearch {
    async fn search(
        &self,
        query: &str,
        _collection: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        lock(&self.queries).push(query.to_string());
        let hits = match lock(&self.scripted).pop_front() {
            Some(result) => result?,
            None => self.default_hits.clone(),
        };
        Ok(hits
            .into_iter()
            .filter(|h| h.score >= options.score_threshold)
            .take(options.max_results)
            .collect())
    }

    fn provider_name(&self) -> &str {
        "mock-search"
    }
}
