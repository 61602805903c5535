//! HTTP retrieval backends
//!
//! Both backends speak the same JSON search contract:
//!
//! ```text
//! POST {base_url}/search
//! {"query": "...", "top_k": 10, "filters": {...}}
//!
//! 200 OK
//! {"hits": [{"id": "doc1", "snippet": "...", "source": "...", "score": 0.91}]}
//! ```
//!
//! Concurrent requests to one backend are capped by a semaphore of
//! `pool_size` permits, and the client keeps at most that many idle
//! connections per host.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{BackendHit, BackendKind, Filters, RetrievalError, SearchBackend};
use crate::config::RetrievalConfig;

/// Search backend reached over HTTP
#[derive(Debug)]
pub struct HttpBackend {
    kind: BackendKind,
    base_url: String,
    client: Client,
    permits: Semaphore,
}

impl HttpBackend {
    /// Create a backend client
    ///
    /// # Errors
    ///
    /// Returns `RetrievalError::BackendUnavailable` if the HTTP client cannot
    /// be built.
    pub fn new(
        kind: BackendKind,
        base_url: impl Into<String>,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Self, RetrievalError> {
        let pool_size = pool_size.max(1);
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_size)
            .build()
            .map_err(|e| RetrievalError::BackendUnavailable {
                backend: kind,
                reason: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            kind,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            permits: Semaphore::new(pool_size),
        })
    }

    /// Build the vector and keyword backends described by `config`
    pub fn pair(config: &RetrievalConfig) -> Result<(Self, Self), RetrievalError> {
        let vector = Self::new(
            BackendKind::Vector,
            &config.vector.base_url,
            config.pool_size,
            config.backend_timeout(),
        )?;
        let keyword = Self::new(
            BackendKind::Keyword,
            &config.keyword.base_url,
            config.pool_size,
            config.backend_timeout(),
        )?;
        Ok((vector, keyword))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unavailable(&self, reason: impl Into<String>) -> RetrievalError {
        RetrievalError::BackendUnavailable {
            backend: self.kind,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SearchBackend for HttpBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn search(
        &self,
        text: &str,
        top_k: usize,
        filters: &Filters,
    ) -> Result<Vec<BackendHit>, RetrievalError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| self.unavailable("connection pool closed"))?;

        let url = format!("{}/search", self.base_url);
        let request = SearchRequest {
            query: text,
            top_k,
            filters,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RetrievalError::Timeout { backend: self.kind }
                } else if e.is_connect() {
                    self.unavailable(format!("Cannot connect to {}", self.base_url))
                } else {
                    self.unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.unavailable(format!("HTTP {}: {}", status, error_text)));
        }

        let body: SearchResponse =
            response
                .json()
                .await
                .map_err(|e| RetrievalError::InvalidResponse {
                    backend: self.kind,
                    reason: e.to_string(),
                })?;

        tracing::debug!(
            backend = %self.kind,
            hits = body.hits.len(),
            "Backend search complete"
        );

        Ok(body
            .hits
            .into_iter()
            .take(top_k)
            .map(|hit| BackendHit {
                content_id: hit.id,
                snippet: hit.snippet,
                origin: hit.source,
                score: hit.score,
            })
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
    filters: &'a Filters,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<WireHit>,
}

#[derive(Debug, Deserialize)]
struct WireHit {
    id: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    source: String,
    score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(uri: &str) -> HttpBackend {
        HttpBackend::new(BackendKind::Keyword, uri, 2, Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn test_search_parses_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({ "query": "rust", "top_k": 4 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": [
                    { "id": "doc1", "snippet": "Rust is", "source": "kb/rust.md", "score": 7.5 },
                    { "id": "doc2", "score": 2.0 }
                ]
            })))
            .mount(&server)
            .await;

        let hits = backend(&server.uri())
            .search("rust", 4, &Filters::new())
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content_id, "doc1");
        assert_eq!(hits[0].origin, "kb/rust.md");
        assert_eq!(hits[1].snippet, "");
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = backend(&server.uri())
            .search("q", 3, &Filters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("overloaded"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = backend(&server.uri())
            .search("q", 3, &Filters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "hits": [] }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let err = backend(&server.uri())
            .search("q", 3, &Filters::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RetrievalError::Timeout {
                backend: BackendKind::Keyword
            }
        );
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let backend = backend("http://localhost:9200/");
        assert_eq!(backend.base_url(), "http://localhost:9200");
    }
}
