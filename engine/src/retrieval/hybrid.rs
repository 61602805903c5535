//! Hybrid Retriever
//!
//! Queries the vector and keyword backends concurrently, each bounded by the
//! backend timeout and asked for `top_k × candidate_multiplier` candidates,
//! then fuses and truncates to `top_k`.
//!
//! One failing backend degrades the result instead of failing the query. Only
//! when both fail does the query return an error.

use crate::config::RetrievalConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::fusion;
use super::{
    BackendHit, BackendKind, RetrievalError, RetrievalQuery, RetrievalResult, SearchBackend,
};

pub struct HybridRetriever {
    vector: Arc<dyn SearchBackend>,
    keyword: Arc<dyn SearchBackend>,
    alpha: f64,
    default_top_k: usize,
    candidate_multiplier: usize,
    backend_timeout: Duration,
}

impl HybridRetriever {
    pub fn new(
        vector: Arc<dyn SearchBackend>,
        keyword: Arc<dyn SearchBackend>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            vector,
            keyword,
            alpha: config.fusion_alpha,
            default_top_k: config.top_k,
            candidate_multiplier: config.candidate_multiplier.max(1),
            backend_timeout: config.backend_timeout(),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Query with the configured default `top_k` and no filters
    pub async fn search(&self, text: &str) -> Result<RetrievalResult, RetrievalError> {
        self.query(&RetrievalQuery::new(text, self.default_top_k))
            .await
    }

    /// Run a hybrid query
    ///
    /// # Errors
    ///
    /// Returns `RetrievalError::AllBackendsUnavailable` only if both backends
    /// fail or time out.
    pub async fn query(&self, query: &RetrievalQuery) -> Result<RetrievalResult, RetrievalError> {
        if query.top_k == 0 {
            return Ok(RetrievalResult {
                items: Vec::new(),
                degraded: false,
                failed_backend: None,
            });
        }

        let candidates = query.top_k.saturating_mul(self.candidate_multiplier);
        let started = Instant::now();

        let (vector, keyword) = tokio::join!(
            self.search_one(self.vector.as_ref(), BackendKind::Vector, query, candidates),
            self.search_one(self.keyword.as_ref(), BackendKind::Keyword, query, candidates),
        );

        let (vector_hits, keyword_hits, failed_backend) = match (vector, keyword) {
            (Ok(v), Ok(k)) => (Some(v), Some(k), None),
            (Err(e), Ok(k)) => {
                tracing::warn!(error = %e, "Vector backend failed, using keyword results only");
                (None, Some(k), Some(BackendKind::Vector))
            }
            (Ok(v), Err(e)) => {
                tracing::warn!(error = %e, "Keyword backend failed, using vector results only");
                (Some(v), None, Some(BackendKind::Keyword))
            }
            (Err(ve), Err(ke)) => {
                tracing::error!(vector = %ve, keyword = %ke, "All retrieval backends failed");
                return Err(RetrievalError::AllBackendsUnavailable {
                    vector: ve.to_string(),
                    keyword: ke.to_string(),
                });
            }
        };

        let mut items = fusion::fuse(vector_hits.as_deref(), keyword_hits.as_deref(), self.alpha);
        items.truncate(query.top_k);

        tracing::debug!(
            query = %query.text,
            results = items.len(),
            degraded = failed_backend.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Hybrid retrieval complete"
        );

        Ok(RetrievalResult {
            items,
            degraded: failed_backend.is_some(),
            failed_backend,
        })
    }

    async fn search_one(
        &self,
        backend: &dyn SearchBackend,
        kind: BackendKind,
        query: &RetrievalQuery,
        top_k: usize,
    ) -> Result<Vec<BackendHit>, RetrievalError> {
        match tokio::time::timeout(
            self.backend_timeout,
            backend.search(&query.text, top_k, &query.filters),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RetrievalError::Timeout { backend: kind }),
        }
    }
}
