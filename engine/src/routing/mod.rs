//! Task routing
//!
//! The routing core decides which handler answers a task:
//!
//! - [`evaluator`]: asks every registered handler for a suitability score,
//!   concurrently, and ranks the results deterministically.
//! - [`coordinator`]: drives the per-task state machine, applies the
//!   threshold/fallback policy, retries down the ranking, and runs fan-out.
//! - [`aggregator`]: merges fan-out results into one response envelope.

pub mod aggregator;
pub mod coordinator;
pub mod evaluator;

pub use aggregator::{combine, ResponseEnvelope};
pub use coordinator::Coordinator;
pub use evaluator::{Evaluator, Ranking};

use sdk::errors::{AttemptRecord, RoutingMode};
use sdk::types::Source;
use serde::{Deserialize, Serialize};

/// One handler's fitness for one task in one evaluation round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuitabilityScore {
    pub handler_id: String,
    pub task_id: String,

    /// Score in [0, 1]; 0 when the handler was unavailable
    pub score: f64,

    /// Why the handler got this score
    pub rationale: String,

    /// False if scoring failed or timed out in this round
    pub available: bool,

    /// Registration order of the handler, the tie-break for equal scores
    pub registration_order: u64,
}

/// Terminal outcome of a routed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Result of routing and executing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationResult {
    pub task_id: String,

    /// Handler(s) the payload is attributed to
    pub handler_ids: Vec<String>,

    pub payload: serde_json::Value,
    pub confidence: f64,

    /// Number of failed attempts before this result
    pub retry_count: u32,

    pub outcome: Outcome,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,

    /// Execution latency of the attributed handler
    pub latency_ms: u64,

    /// Time from submission to result
    pub elapsed_ms: u64,

    pub mode: RoutingMode,

    /// Failed attempts that preceded this result
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl CoordinationResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// The `answer` text of the payload, if any
    pub fn answer(&self) -> Option<&str> {
        self.payload.get("answer").and_then(|v| v.as_str())
    }
}

/// What `route` returns: a single result or an aggregated fan-out envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Single(CoordinationResult),
    Aggregated(ResponseEnvelope),
}

impl Response {
    pub fn task_id(&self) -> &str {
        match self {
            Response::Single(result) => &result.task_id,
            Response::Aggregated(envelope) => &envelope.task_id,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Response::Single(result) => result.confidence,
            Response::Aggregated(envelope) => envelope.confidence,
        }
    }

    pub fn handler_ids(&self) -> &[String] {
        match self {
            Response::Single(result) => &result.handler_ids,
            Response::Aggregated(envelope) => &envelope.handler_ids,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            Response::Single(result) => &result.payload,
            Response::Aggregated(envelope) => &envelope.payload,
        }
    }

    pub fn answer(&self) -> Option<&str> {
        self.payload().get("answer").and_then(|v| v.as_str())
    }

    pub fn sources(&self) -> &[Source] {
        match self {
            Response::Single(result) => &result.sources,
            Response::Aggregated(envelope) => &envelope.sources,
        }
    }

    /// Unwrap a single-mode result
    pub fn into_single(self) -> Option<CoordinationResult> {
        match self {
            Response::Single(result) => Some(result),
            Response::Aggregated(_) => None,
        }
    }

    /// Unwrap a fan-out envelope
    pub fn into_aggregated(self) -> Option<ResponseEnvelope> {
        match self {
            Response::Aggregated(envelope) => Some(envelope),
            Response::Single(_) => None,
        }
    }
}
