//! Aggregator
//!
//! Merges fan-out results into one [`ResponseEnvelope`]. Overall confidence
//! is the maximum contributing confidence. Contributions are deduplicated by
//! handler id, so combining an envelope's contributions again gives back the
//! same envelope.

use sdk::types::Source;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::CoordinationResult;

/// Combined response of several handlers, with per-handler attribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub task_id: String,

    /// Payload of the most confident contribution
    pub payload: serde_json::Value,

    /// Maximum confidence among contributions
    pub confidence: f64,

    /// Contributing handlers in input order
    pub handler_ids: Vec<String>,

    /// Sources of all contributions, deduplicated by content id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,

    /// The successful results this envelope was built from
    pub contributions: Vec<CoordinationResult>,
}

impl ResponseEnvelope {
    /// Rebuild the envelope from its own contributions
    pub fn recombine(&self) -> ResponseEnvelope {
        combine(&self.contributions)
    }

    pub fn contribution(&self, handler_id: &str) -> Option<&CoordinationResult> {
        self.contributions
            .iter()
            .find(|c| c.handler_ids.iter().any(|h| h == handler_id))
    }
}

/// Combine results into one envelope
///
/// Only successful results contribute. A result whose attribution was already
/// seen is skipped (first wins). The primary payload is taken from the most
/// confident contribution; on equal confidence the earlier one wins.
pub fn combine(results: &[CoordinationResult]) -> ResponseEnvelope {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut contributions: Vec<CoordinationResult> = Vec::new();

    for result in results.iter().filter(|r| r.is_success()) {
        if result.handler_ids.iter().any(|id| seen.contains(id.as_str())) {
            continue;
        }
        seen.extend(result.handler_ids.iter().map(String::as_str));
        contributions.push(result.clone());
    }

    let primary = contributions.iter().fold(None::<&CoordinationResult>, |best, c| match best {
        Some(b) if b.confidence >= c.confidence => Some(b),
        _ => Some(c),
    });

    let task_id = contributions
        .first()
        .or_else(|| results.first())
        .map(|r| r.task_id.clone())
        .unwrap_or_default();

    let mut source_ids: HashSet<&str> = HashSet::new();
    let sources = contributions
        .iter()
        .flat_map(|c| c.sources.iter())
        .filter(|s| source_ids.insert(s.content_id.as_str()))
        .cloned()
        .collect();

    ResponseEnvelope {
        task_id,
        payload: primary
            .map(|p| p.payload.clone())
            .unwrap_or(serde_json::Value::Null),
        confidence: primary.map(|p| p.confidence).unwrap_or(0.0),
        handler_ids: contributions
            .iter()
            .flat_map(|c| c.handler_ids.iter().cloned())
            .collect(),
        sources,
        contributions,
    }
}
