//! Hybrid retrieval
//!
//! Knowledge lookup over two independently ranked backends: a vector
//! (semantic) backend and a keyword (lexical) backend. [`HybridRetriever`]
//! queries both concurrently and fuses their lists with [`fusion::fuse`].
//!
//! Backends are opaque services behind [`SearchBackend`]. Two families ship
//! with the engine: HTTP clients with bounded connection pools ([`http`]) and
//! in-memory indexes over a local corpus ([`memory`]).

pub mod fusion;
pub mod http;
pub mod hybrid;
pub mod memory;

pub use hybrid::HybridRetriever;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Metadata filters passed through to both backends
pub type Filters = HashMap<String, serde_json::Value>;

/// Which backend a hit or failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Vector,
    Keyword,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Vector => write!(f, "vector"),
            BackendKind::Keyword => write!(f, "keyword"),
        }
    }
}

/// Errors from retrieval backends
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetrievalError {
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: BackendKind, reason: String },

    #[error("{backend} backend timed out")]
    Timeout { backend: BackendKind },

    #[error("{backend} backend returned an invalid response: {reason}")]
    InvalidResponse { backend: BackendKind, reason: String },

    #[error("All retrieval backends unavailable (vector: {vector}; keyword: {keyword})")]
    AllBackendsUnavailable { vector: String, keyword: String },
}

impl RetrievalError {
    /// Backend the error originated from, if it is a single-backend error
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            Self::BackendUnavailable { backend, .. }
            | Self::Timeout { backend }
            | Self::InvalidResponse { backend, .. } => Some(*backend),
            Self::AllBackendsUnavailable { .. } => None,
        }
    }
}

/// A request to the hybrid retriever
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub text: String,

    #[serde(default)]
    pub filters: Filters,

    pub top_k: usize,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            filters: Filters::new(),
            top_k,
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.filters.insert(key.into(), value);
        self
    }
}

/// One entry of a backend's ranked list, with its backend-native score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHit {
    pub content_id: String,
    pub snippet: String,

    /// Where the content came from (file, URL, collection)
    #[serde(default)]
    pub origin: String,

    pub score: f64,
}

impl BackendHit {
    pub fn new(content_id: impl Into<String>, score: f64) -> Self {
        Self {
            content_id: content_id.into(),
            snippet: String::new(),
            origin: String::new(),
            score,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }
}

/// One fused knowledge result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub content_id: String,
    pub snippet: String,
    pub origin: String,

    /// Normalised vector score, if the vector backend returned the item
    pub vector_score: Option<f64>,

    /// Normalised keyword score, if the keyword backend returned the item
    pub keyword_score: Option<f64>,

    pub fused_score: f64,

    /// Position in the vector list (0-based)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_rank: Option<usize>,

    /// Position in the keyword list (0-based)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_rank: Option<usize>,
}

impl RetrievedItem {
    pub fn to_source(&self) -> sdk::types::Source {
        sdk::types::Source {
            content_id: self.content_id.clone(),
            snippet: self.snippet.clone(),
            origin: self.origin.clone(),
            score: self.fused_score,
        }
    }
}

/// Fused, ordered result of one retrieval query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub items: Vec<RetrievedItem>,

    /// True when one backend failed and only the other was used
    pub degraded: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_backend: Option<BackendKind>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.content_id.as_str()).collect()
    }
}

/// A ranked search backend
///
/// The vector backend receives the query text and is responsible for turning
/// it into its own query representation.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Return up to `top_k` hits, best first, with backend-native scores
    async fn search(
        &self,
        text: &str,
        top_k: usize,
        filters: &Filters,
    ) -> Result<Vec<BackendHit>, RetrievalError>;
}
