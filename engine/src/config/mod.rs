//! Configuration management
//!
//! This module handles loading, validation, and management of the Switchboard
//! configuration. Configuration is stored in TOML format at
//! ~/.switchboard/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level
//! - **routing**: Score threshold, retry budget, fan-out width, timeouts, worker pool
//! - **retrieval**: Fusion weight, result depth, backend endpoints and pool size
//! - **llm**: Chat model used by the built-in handlers
//! - **handlers**: Built-in handler definitions
//!
//! Validation happens once at load time. Any invalid threshold, weight, or
//! handler definition is a configuration error and the process refuses to
//! start.
//!
//! # Examples
//!
//! ```no_run
//! use switchboard_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Threshold: {}", config.routing.min_score_threshold);
//! println!("Fallback: {}", config.routing.fallback_handler);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Routing policy
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Hybrid retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Chat model used by built-in handlers
    #[serde(default)]
    pub llm: LlmConfig,

    /// Built-in handler definitions, in registration order
    #[serde(default = "default_handlers")]
    pub handlers: Vec<HandlerConfig>,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Routing policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Top score below which the fallback handler is used (0.0-1.0)
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,

    /// Maximum execution attempts in single mode (>= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Number of handlers dispatched in fan-out mode (>= 1)
    #[serde(default = "default_fan_out_n")]
    pub fan_out_n: usize,

    /// Timeout for each scoring or execution call, in milliseconds
    #[serde(default = "default_per_call_timeout_ms")]
    pub per_call_timeout_ms: u64,

    /// Default task deadline in milliseconds (tasks may carry their own)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_deadline_ms: Option<u64>,

    /// Id of the generalist fallback handler
    #[serde(default = "default_fallback_handler")]
    pub fallback_handler: String,

    /// Size of the bounded worker pool shared by scoring and execution calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl RoutingConfig {
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_ms.map(Duration::from_millis)
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            min_score_threshold: default_min_score_threshold(),
            max_attempts: default_max_attempts(),
            fan_out_n: default_fan_out_n(),
            per_call_timeout_ms: default_per_call_timeout_ms(),
            task_deadline_ms: None,
            fallback_handler: default_fallback_handler(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    /// Weight of the vector component in the fused score (0.0-1.0)
    #[serde(default = "default_fusion_alpha")]
    pub fusion_alpha: f64,

    /// Default number of fused results returned
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Each backend is asked for `top_k * candidate_multiplier` candidates
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    /// Timeout for each backend search, in milliseconds
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Maximum concurrent connections per backend
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Vector backend endpoint
    #[serde(default = "default_vector_backend")]
    pub vector: BackendConfig,

    /// Keyword backend endpoint
    #[serde(default = "default_keyword_backend")]
    pub keyword: BackendConfig,

    /// Local JSON corpus; when set, both backends are in-memory indexes over
    /// it instead of HTTP services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_path: Option<PathBuf>,
}

impl RetrievalConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            fusion_alpha: default_fusion_alpha(),
            top_k: default_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            backend_timeout_ms: default_backend_timeout_ms(),
            pool_size: default_pool_size(),
            vector: default_vector_backend(),
            keyword: default_keyword_backend(),
            corpus_path: None,
        }
    }
}

/// Retrieval backend endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Base URL of the backend's search API
    pub base_url: String,
}

/// Chat model configuration for built-in handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the Ollama API
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// HTTP timeout for one generation, in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// Definition of a built-in handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerConfig {
    /// Unique handler id
    pub id: String,

    /// Display name
    pub name: String,

    /// Capability tags
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Keywords that suggest this handler (matched case-insensitively)
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Task types this handler claims explicitly
    #[serde(default)]
    pub task_types: Vec<String>,

    /// Score for an explicit task type match
    #[serde(default = "default_explicit_score")]
    pub explicit_score: f64,

    /// Score for a keyword match
    #[serde(default = "default_keyword_score")]
    pub keyword_score: f64,

    /// Score for queries ending in '?', if the handler favours questions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_score: Option<f64>,

    /// Score when nothing matches
    #[serde(default = "default_base_score")]
    pub base_score: f64,

    /// Confidence reported with answers
    #[serde(default = "default_confidence")]
    pub confidence: f64,

    /// Ground answers with hybrid retrieval
    #[serde(default)]
    pub uses_retrieval: bool,

    /// System prompt for the chat model
    #[serde(default)]
    pub system_prompt: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_min_score_threshold() -> f64 {
    0.5
}

fn default_max_attempts() -> usize {
    2
}

fn default_fan_out_n() -> usize {
    2
}

fn default_per_call_timeout_ms() -> u64 {
    10_000
}

fn default_fallback_handler() -> String {
    "generalist".to_string()
}

fn default_max_concurrency() -> usize {
    8
}

fn default_fusion_alpha() -> f64 {
    0.5
}

fn default_top_k() -> usize {
    5
}

fn default_candidate_multiplier() -> usize {
    2
}

fn default_backend_timeout_ms() -> u64 {
    5_000
}

fn default_pool_size() -> usize {
    4
}

fn default_vector_backend() -> BackendConfig {
    BackendConfig {
        base_url: "http://localhost:6333".to_string(),
    }
}

fn default_keyword_backend() -> BackendConfig {
    BackendConfig {
        base_url: "http://localhost:9200".to_string(),
    }
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_explicit_score() -> f64 {
    0.95
}

fn default_keyword_score() -> f64 {
    0.8
}

fn default_base_score() -> f64 {
    0.3
}

fn default_confidence() -> f64 {
    0.8
}

fn keywords(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

/// The four handlers shipped by default: three specialists and the generalist
fn default_handlers() -> Vec<HandlerConfig> {
    vec![
        HandlerConfig {
            id: "research".to_string(),
            name: "Research".to_string(),
            capabilities: keywords(&["research", "rag", "retrieval"]),
            keywords: keywords(&[
                "find",
                "search",
                "lookup",
                "research",
                "information",
                "data",
                "tìm",
                "tra cứu",
                "nghiên cứu",
                "thông tin",
                "dữ liệu",
            ]),
            task_types: keywords(&["research", "rag", "web_search"]),
            explicit_score: 0.95,
            keyword_score: 0.8,
            question_score: None,
            base_score: 0.3,
            confidence: 0.85,
            uses_retrieval: true,
            system_prompt: "You are a research assistant. Answer using the provided context \
                            and say so when the context is insufficient."
                .to_string(),
        },
        HandlerConfig {
            id: "reasoning".to_string(),
            name: "Reasoning".to_string(),
            capabilities: keywords(&["reasoning", "analysis"]),
            keywords: keywords(&[
                "why",
                "how",
                "explain",
                "solve",
                "analyze",
                "reason",
                "think",
                "logic",
                "step by step",
                "compare",
                "contrast",
                "evaluate",
                "tại sao",
                "giải thích",
                "phân tích",
                "so sánh",
                "đánh giá",
            ]),
            task_types: keywords(&["reasoning", "logic", "problem_solving"]),
            explicit_score: 0.95,
            keyword_score: 0.8,
            question_score: Some(0.6),
            base_score: 0.4,
            confidence: 0.8,
            uses_retrieval: false,
            system_prompt: "You are a careful analyst. Think step by step, then answer."
                .to_string(),
        },
        HandlerConfig {
            id: "creative".to_string(),
            name: "Creative".to_string(),
            capabilities: keywords(&["creative", "content_generation"]),
            keywords: keywords(&[
                "create",
                "write",
                "design",
                "generate",
                "story",
                "poem",
                "content",
                "creative",
                "viết",
                "thiết kế",
                "truyện",
                "thơ",
                "sáng tạo",
            ]),
            task_types: keywords(&["creative", "content_generation"]),
            explicit_score: 0.95,
            keyword_score: 0.85,
            question_score: None,
            base_score: 0.3,
            confidence: 0.75,
            uses_retrieval: false,
            system_prompt: "You are a creative writer.".to_string(),
        },
        HandlerConfig {
            id: "generalist".to_string(),
            name: "Generalist".to_string(),
            capabilities: keywords(&["general"]),
            keywords: Vec::new(),
            task_types: Vec::new(),
            explicit_score: 0.95,
            keyword_score: 0.8,
            question_score: None,
            base_score: 0.2,
            confidence: 0.6,
            uses_retrieval: false,
            system_prompt: "You are a helpful assistant. Provide clear, accurate answers."
                .to_string(),
        },
    ]
}

impl Config {
    /// Load configuration from the default location (~/.switchboard/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or written
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    pub fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default();
        config.validate()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.switchboard/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".switchboard").join("config.toml"))
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if:
    /// - The log level is unknown
    /// - A threshold, weight, or handler score lies outside [0, 1]
    /// - A count or timeout is zero
    /// - Handler ids are empty or duplicated
    /// - The fallback handler is not one of the configured handlers
    pub fn validate(&self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.routing.validate()?;
        self.retrieval.validate()?;

        let mut seen = HashSet::new();
        for handler in &self.handlers {
            handler.validate()?;
            if !seen.insert(handler.id.to_lowercase()) {
                return Err(EngineError::Config(format!(
                    "Duplicate handler id '{}'",
                    handler.id
                )));
            }
        }

        if !self.handlers.is_empty()
            && !seen.contains(&self.routing.fallback_handler.to_lowercase())
        {
            return Err(EngineError::Config(format!(
                "fallback_handler '{}' is not a configured handler",
                self.routing.fallback_handler
            )));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            routing: RoutingConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
            handlers: default_handlers(),
        }
    }
}

impl RoutingConfig {
    /// Validate routing thresholds and limits
    pub fn validate(&self) -> Result<(), EngineError> {
        check_unit("routing.min_score_threshold", self.min_score_threshold)?;

        if self.max_attempts == 0 {
            return Err(EngineError::Config(
                "routing.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.fan_out_n == 0 {
            return Err(EngineError::Config(
                "routing.fan_out_n must be at least 1".to_string(),
            ));
        }
        if self.per_call_timeout_ms == 0 {
            return Err(EngineError::Config(
                "routing.per_call_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.task_deadline_ms == Some(0) {
            return Err(EngineError::Config(
                "routing.task_deadline_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(EngineError::Config(
                "routing.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.fallback_handler.trim().is_empty() {
            return Err(EngineError::Config(
                "routing.fallback_handler must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl RetrievalConfig {
    /// Validate fusion weight, depth, and pool limits
    pub fn validate(&self) -> Result<(), EngineError> {
        check_unit("retrieval.fusion_alpha", self.fusion_alpha)?;

        if self.top_k == 0 {
            return Err(EngineError::Config(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if self.candidate_multiplier == 0 {
            return Err(EngineError::Config(
                "retrieval.candidate_multiplier must be at least 1".to_string(),
            ));
        }
        if self.backend_timeout_ms == 0 {
            return Err(EngineError::Config(
                "retrieval.backend_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(EngineError::Config(
                "retrieval.pool_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl HandlerConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Config(
                "handler id must not be empty".to_string(),
            ));
        }

        let prefix = format!("handlers.{}", self.id);
        check_unit(&format!("{}.explicit_score", prefix), self.explicit_score)?;
        check_unit(&format!("{}.keyword_score", prefix), self.keyword_score)?;
        check_unit(&format!("{}.base_score", prefix), self.base_score)?;
        check_unit(&format!("{}.confidence", prefix), self.confidence)?;
        if let Some(score) = self.question_score {
            check_unit(&format!("{}.question_score", prefix), score)?;
        }

        Ok(())
    }
}

/// Reject values outside [0, 1] (NaN included)
fn check_unit(name: &str, value: f64) -> Result<(), EngineError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Config(format!(
            "{} must be between 0.0 and 1.0 (got {})",
            name, value
        )));
    }
    Ok(())
}
