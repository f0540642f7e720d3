//! Configuration management for Quarry services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Text generation provider
    #[serde(default)]
    pub llm: LlmConfig,

    /// Semantic search provider
    #[serde(default)]
    pub search: SearchConfig,

    /// Agentic loop policy
    #[serde(default)]
    pub agent: AgentConfig,

    /// Session persistence
    #[serde(default)]
    pub session: SessionConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (non-streaming endpoints)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Provider: openai, mock
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// API base URL (for OpenAI-compatible endpoints)
    pub api_base: Option<String>,

    /// API key
    pub api_key: Option<String>,

    /// Model to use
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries on transient failures
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Provider: openai, mock
    #[serde(default = "default_search_provider")]
    pub provider: String,

    /// API base URL
    pub api_base: Option<String>,

    /// API key (falls back to the LLM key)
    pub api_key: Option<String>,

    /// Search target (vector store id). Unset means no collection selected.
    pub collection: Option<String>,

    /// Maximum results per search call
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Minimum relevance score
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,

    /// Request timeout in seconds
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

/// Bounds for the retrieval loop
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Maximum retrieve-evaluate iterations per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Maximum generation steps inside one extraction
    #[serde(default = "default_extractor_steps")]
    pub extractor_max_steps: usize,

    /// Maximum search tool calls inside one extraction
    #[serde(default = "default_extractor_searches")]
    pub extractor_max_searches: usize,

    /// Snippet length for formatted search results
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,

    /// Evaluator attempts before giving up (2 = retry once)
    #[serde(default = "default_evaluator_attempts")]
    pub evaluator_attempts: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Store backend: memory, redis
    #[serde(default = "default_session_store")]
    pub store: String,

    /// Redis URL (for the redis store)
    pub redis_url: Option<String>,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Session TTL in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Retries when a history append races another writer
    #[serde(default = "default_append_retries")]
    pub max_append_retries: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Expose /metrics (false to disable)
    #[serde(default = "default_enabled")]
    pub metrics_enabled: bool,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_llm_provider() -> String { "openai".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 60 }
fn default_llm_retries() -> u32 { 2 }
fn default_temperature() -> f32 { 0.2 }
fn default_search_provider() -> String { "openai".to_string() }
fn default_max_results() -> usize { 10 }
fn default_score_threshold() -> f32 { 0.3 }
fn default_search_timeout() -> u64 { 30 }
fn default_max_iterations() -> usize { crate::DEFAULT_MAX_ITERATIONS }
fn default_extractor_steps() -> usize { 5 }
fn default_extractor_searches() -> usize { 3 }
fn default_snippet_chars() -> usize { 400 }
fn default_evaluator_attempts() -> usize { 2 }
fn default_session_store() -> String { "memory".to_string() }
fn default_key_prefix() -> String { "quarry".to_string() }
fn default_session_ttl() -> u64 { 86_400 }
fn default_append_retries() -> usize { 3 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_service_name() -> String { "quarry".to_string() }
fn default_rate_limit() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_base: None,
            api_key: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            temperature: default_temperature(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            api_base: None,
            api_key: None,
            collection: None,
            max_results: default_max_results(),
            score_threshold: default_score_threshold(),
            timeout_secs: default_search_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            extractor_max_steps: default_extractor_steps(),
            extractor_max_searches: default_extractor_searches(),
            snippet_chars: default_snippet_chars(),
            evaluator_attempts: default_evaluator_attempts(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: default_session_store(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl_secs: default_session_ttl(),
            max_append_retries: default_append_retries(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_enabled: default_enabled(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // e.g., APP__SEARCH__COLLECTION=vs_abc123
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject bounds that would make the loop unable to run
    pub fn validate(&self) -> Result<(), ConfigError> {
        let agent = &self.agent;
        if agent.max_iterations == 0 || agent.max_iterations > crate::DEFAULT_MAX_ITERATIONS {
            return Err(ConfigError::Message(format!(
                "agent.max_iterations must be within 1..={}",
                crate::DEFAULT_MAX_ITERATIONS
            )));
        }
        if agent.extractor_max_steps == 0 {
            return Err(ConfigError::Message("agent.extractor_max_steps must be at least 1".into()));
        }
        if agent.evaluator_attempts == 0 {
            return Err(ConfigError::Message("agent.evaluator_attempts must be at least 1".into()));
        }
        if self.search.max_results == 0 {
            return Err(ConfigError::Message("search.max_results must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.search.score_threshold) {
            return Err(ConfigError::Message("search.score_threshold must be within 0..=1".into()));
        }
        Ok(())
    }

    /// Timeout for non-streaming endpoints
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// How long in-flight requests may drain after a shutdown signal
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Search API key, falling back to the LLM key
    pub fn search_api_key(&self) -> Option<&str> {
        self.search.api_key.as_deref().or(self.llm.api_key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert!(config.search.collection.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_agent_policy_defaults() {
        let agent = AgentConfig::default();
        assert_eq!(agent.max_iterations, 5);
        assert_eq!(agent.extractor_max_steps, 5);
        assert_eq!(agent.extractor_max_searches, 3);
        assert_eq!(agent.snippet_chars, 400);
        assert_eq!(agent.evaluator_attempts, 2);
    }

    #[test]
    fn test_iteration_bounds_enforced() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 0;
        assert!(config.validate().is_err());

        config.agent.max_iterations = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_search_key_fallback() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some("sk-llm".into());
        assert_eq!(config.search_api_key(), Some("sk-llm"));

        config.search.api_key = Some("sk-search".into());
        assert_eq!(config.search_api_key(), Some("sk-search"));
    }
}
