//! Task and handler output types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Input modality of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    #[default]
    Text,
    Image,
    Audio,
    Document,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Text => write!(f, "text"),
            Modality::Image => write!(f, "image"),
            Modality::Audio => write!(f, "audio"),
            Modality::Document => write!(f, "document"),
        }
    }
}

/// A unit of work submitted for handling.
///
/// Built once at ingress with the `with_*` builder methods, then shared
/// read-only (usually behind an `Arc`) with every handler that scores or
/// processes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id
    pub id: String,

    /// Query text
    pub query: String,

    /// Input modality
    #[serde(default)]
    pub modality: Modality,

    /// Free-form context metadata (filters, conversation ids, ...)
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,

    /// Time budget for the whole task, measured from submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,

    /// Optional task type hint (e.g. "research", "creative")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,

    /// Handler the caller would like to be tried first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_handler: Option<String>,

    /// Dispatch to several handlers concurrently and aggregate
    #[serde(default)]
    pub multi_domain: bool,
}

impl Task {
    /// Create a text task with a fresh id
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            modality: Modality::Text,
            context: HashMap::new(),
            deadline: None,
            task_type: None,
            preferred_handler: None,
            multi_domain: false,
        }
    }

    /// Override the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_preferred_handler(mut self, handler_id: impl Into<String>) -> Self {
        self.preferred_handler = Some(handler_id.into());
        self
    }

    /// Mark the task as spanning several domains (fan-out mode)
    pub fn multi_domain(mut self) -> Self {
        self.multi_domain = true;
        self
    }

    /// Get a string context entry
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }
}

/// A knowledge source cited by a handler output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub content_id: String,
    pub snippet: String,
    pub origin: String,
    pub score: f64,
}

/// Output of a successful `process` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    /// Answer payload
    pub payload: serde_json::Value,

    /// Handler's confidence in the answer (0.0-1.0)
    pub confidence: f64,

    /// Knowledge sources backing the answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
}

impl HandlerOutput {
    /// Create a text answer. Confidence is clamped to [0, 1].
    pub fn text(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            payload: serde_json::json!({ "answer": text.into() }),
            confidence: clamp_unit(confidence),
            sources: Vec::new(),
        }
    }

    /// Create an output with JSON payload. Confidence is clamped to [0, 1].
    pub fn json(payload: serde_json::Value, confidence: f64) -> Self {
        Self {
            payload,
            confidence: clamp_unit(confidence),
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    /// The `answer` field of the payload, if it is a text answer
    pub fn answer(&self) -> Option<&str> {
        self.payload.get("answer").and_then(|v| v.as_str())
    }
}

/// Clamp a score into [0, 1]; NaN becomes 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
