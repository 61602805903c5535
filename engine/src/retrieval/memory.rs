//! In-memory retrieval backends
//!
//! Offline stand-ins for the vector and keyword services, built over a local
//! corpus. The keyword backend scores the fraction of query terms a document
//! contains. The vector backend embeds text as a hashed term-frequency vector
//! and scores cosine similarity; it is deterministic and needs no model, but
//! it is lexical underneath.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use super::{BackendHit, BackendKind, Filters, RetrievalError, SearchBackend};
use sdk::errors::EngineError;

const EMBEDDING_DIMENSIONS: usize = 256;
const SNIPPET_CHARS: usize = 200;

/// A document in the local corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub metadata: Filters,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            source: String::new(),
            metadata: Filters::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn matches(&self, filters: &Filters) -> bool {
        filters
            .iter()
            .all(|(key, value)| self.metadata.get(key) == Some(value))
    }

    fn snippet(&self) -> String {
        self.text.chars().take(SNIPPET_CHARS).collect()
    }

    fn hit(&self, score: f64) -> BackendHit {
        BackendHit::new(&self.id, score)
            .with_snippet(self.snippet())
            .with_origin(&self.source)
    }
}

/// Load a corpus from a JSON array of documents
pub fn load_corpus(path: &Path) -> Result<Vec<Document>, EngineError> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|e| {
        EngineError::Config(format!(
            "Failed to parse corpus {}: {}",
            path.display(),
            e
        ))
    })
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\p{L}\p{N}_]+").expect("static regex is valid"))
}

/// Lowercased word tokens of `text`
pub fn tokenize(text: &str) -> Vec<String> {
    token_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn rank(mut scored: Vec<(usize, f64)>, documents: &[Document], top_k: usize) -> Vec<BackendHit> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    scored
        .into_iter()
        .take(top_k)
        .map(|(index, score)| documents[index].hit(score))
        .collect()
}

/// Keyword backend: fraction of distinct query terms found in the document
pub struct MemoryKeywordBackend {
    documents: Arc<Vec<Document>>,
    terms: Vec<HashSet<String>>,
}

impl MemoryKeywordBackend {
    pub fn new(documents: Arc<Vec<Document>>) -> Self {
        let terms = documents
            .iter()
            .map(|d| tokenize(&d.text).into_iter().collect())
            .collect();
        Self { documents, terms }
    }
}

#[async_trait]
impl SearchBackend for MemoryKeywordBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Keyword
    }

    async fn search(
        &self,
        text: &str,
        top_k: usize,
        filters: &Filters,
    ) -> Result<Vec<BackendHit>, RetrievalError> {
        let query: HashSet<String> = tokenize(text).into_iter().collect();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let scored = self
            .documents
            .iter()
            .zip(&self.terms)
            .enumerate()
            .filter(|(_, (doc, _))| doc.matches(filters))
            .filter_map(|(index, (_, terms))| {
                let found = query.iter().filter(|t| terms.contains(*t)).count();
                (found > 0).then(|| (index, found as f64 / query.len() as f64))
            })
            .collect();

        Ok(rank(scored, &self.documents, top_k))
    }
}

/// Vector backend: cosine similarity of hashed term-frequency embeddings
pub struct MemoryVectorBackend {
    documents: Arc<Vec<Document>>,
    embeddings: Vec<Vec<f64>>,
}

impl MemoryVectorBackend {
    pub fn new(documents: Arc<Vec<Document>>) -> Self {
        let embeddings = documents.iter().map(|d| embed(&d.text)).collect();
        Self {
            documents,
            embeddings,
        }
    }
}

#[async_trait]
impl SearchBackend for MemoryVectorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vector
    }

    async fn search(
        &self,
        text: &str,
        top_k: usize,
        filters: &Filters,
    ) -> Result<Vec<BackendHit>, RetrievalError> {
        let query = embed(text);

        let scored = self
            .documents
            .iter()
            .zip(&self.embeddings)
            .enumerate()
            .filter(|(_, (doc, _))| doc.matches(filters))
            .map(|(index, (_, embedding))| (index, dot(&query, embedding)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        Ok(rank(scored, &self.documents, top_k))
    }
}

/// Hash a term into a bucket using FNV-1a
fn bucket(term: &str) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in term.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % EMBEDDING_DIMENSIONS as u64) as usize
}

/// L2-normalised term-frequency vector
fn embed(text: &str) -> Vec<f64> {
    let mut counts: HashMap<String, f64> = HashMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_default() += 1.0;
    }

    let mut vector = vec![0.0; EMBEDDING_DIMENSIONS];
    for (term, count) in counts {
        vector[bucket(&term)] += count;
    }

    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Both in-memory backends over one shared corpus
pub fn pair(documents: Vec<Document>) -> (MemoryVectorBackend, MemoryKeywordBackend) {
    let documents = Arc::new(documents);
    (
        MemoryVectorBackend::new(Arc::clone(&documents)),
        MemoryKeywordBackend::new(documents),
    )
}
