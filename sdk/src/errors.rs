//! Error types and handling
//!
//! This module provides the error types shared by the engine and by handler
//! implementations. Two layers exist:
//!
//! - [`HandlerError`]: what a handler's `score` or `process` call may fail with.
//!   These are always absorbed locally by the engine (score forced to 0, or
//!   retry with the next-ranked handler).
//! - [`EngineError`]: terminal errors surfaced to the caller. All of them
//!   implement [`EngineErrorExt`], which provides a user-friendly hint and
//!   indicates whether the error is recoverable.
//!
//! Every terminal routing failure carries a [`FailureReport`] so the caller can
//! show which handlers were attempted, how they scored, and why they failed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Trait for engine error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait EngineErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried (possibly with a different task or
    /// configuration). Non-recoverable errors require operator intervention.
    fn is_recoverable(&self) -> bool;
}

/// Classification of a sub-call failure, recorded in attempt reports and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handler scoring failed or timed out
    Evaluation,
    /// Handler execution failed or timed out
    Processing,
    /// A retrieval backend failed or timed out
    BackendUnavailable,
    /// The call was abandoned because the parent task was cancelled
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Evaluation => write!(f, "evaluation_error"),
            ErrorKind::Processing => write!(f, "processing_error"),
            ErrorKind::BackendUnavailable => write!(f, "backend_unavailable"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors a handler may report from `score` or `process`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Handler call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handler call cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Classify this error for the phase it happened in.
    ///
    /// A timeout during scoring counts as an evaluation error, a timeout
    /// during execution as a processing error.
    pub fn kind(&self, during_scoring: bool) -> ErrorKind {
        match self {
            HandlerError::Evaluation(_) => ErrorKind::Evaluation,
            HandlerError::Processing(_) => ErrorKind::Processing,
            HandlerError::Cancelled => ErrorKind::Cancelled,
            HandlerError::Timeout(_) if during_scoring => ErrorKind::Evaluation,
            HandlerError::Timeout(_) => ErrorKind::Processing,
        }
    }
}

/// Routing mode a task was handled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// One handler at a time, falling back down the ranking
    Single,
    /// Several top-ranked handlers concurrently, results aggregated
    FanOut,
    /// A single named handler, no ranking
    Direct,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Single => write!(f, "single"),
            RoutingMode::FanOut => write!(f, "fan_out"),
            RoutingMode::Direct => write!(f, "direct"),
        }
    }
}

/// One failed execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Handler that was attempted
    pub handler_id: String,

    /// Suitability score the handler had in this round
    pub score: f64,

    /// Failure classification
    pub error_kind: ErrorKind,

    /// Human-readable failure message
    pub message: String,
}

/// Structured cause of a terminal routing failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Task that could not be completed
    pub task_id: String,

    /// Mode the task was routed in
    pub mode: RoutingMode,

    /// Attempts in the order they were made
    pub attempts: Vec<AttemptRecord>,

    /// All (handler id, score) pairs of the evaluation round, best first
    pub scores: Vec<(String, f64)>,
}

impl FailureReport {
    /// Ids of every handler that was attempted and failed
    pub fn exhausted_handlers(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.handler_id.as_str()).collect()
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} ({} mode) failed after {} attempt(s)",
            self.task_id,
            self.mode,
            self.attempts.len()
        )?;
        for attempt in &self.attempts {
            write!(
                f,
                "; {} [score {:.2}] {}: {}",
                attempt.handler_id, attempt.score, attempt.error_kind, attempt.message
            )?;
        }
        Ok(())
    }
}

/// Main engine error type
///
/// These are the only errors that propagate to the caller. Sub-call failures
/// are absorbed, retried, or degraded inside the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Registry errors
    #[error("Handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("No handlers registered")]
    NoHandlers,

    // Routing errors
    #[error("All handler attempts exhausted: {0}")]
    ExhaustedFallback(Box<FailureReport>),

    #[error("Task {task_id} was cancelled")]
    Cancelled { task_id: String },

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The failure report, if this is a terminal routing failure
    pub fn failure_report(&self) -> Option<&FailureReport> {
        match self {
            Self::ExhaustedFallback(report) => Some(report),
            _ => None,
        }
    }
}

impl EngineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::DuplicateHandler(_) => "Each handler id may only be registered once",
            Self::HandlerNotFound(_) => "The requested handler is not registered",
            Self::NoHandlers => "Register at least one handler before routing tasks",
            Self::ExhaustedFallback(_) => {
                "No handler could complete the task. See the attempt list for causes"
            }
            Self::Cancelled { .. } => "The task was abandoned before it completed",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::NoHandlers => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> FailureReport {
        FailureReport {
            task_id: "task-1".to_string(),
            mode: RoutingMode::Single,
            attempts: vec![
                AttemptRecord {
                    handler_id: "a".to_string(),
                    score: 0.9,
                    error_kind: ErrorKind::Processing,
                    message: "boom".to_string(),
                },
                AttemptRecord {
                    handler_id: "b".to_string(),
                    score: 0.6,
                    error_kind: ErrorKind::Processing,
                    message: "timed out".to_string(),
                },
            ],
            scores: vec![("a".to_string(), 0.9), ("b".to_string(), 0.6)],
        }
    }

    #[test]
    fn test_timeout_kind_depends_on_phase() {
        let err = HandlerError::Timeout(Duration::from_millis(10));
        assert_eq!(err.kind(true), ErrorKind::Evaluation);
        assert_eq!(err.kind(false), ErrorKind::Processing);
        assert_eq!(
            HandlerError::Processing("x".into()).kind(true),
            ErrorKind::Processing
        );
    }

    #[test]
    fn test_failure_report_lists_exhausted_handlers() {
        let report = report();
        assert_eq!(report.exhausted_handlers(), vec!["a", "b"]);

        let rendered = report.to_string();
        assert!(rendered.contains("2 attempt(s)"));
        assert!(rendered.contains("processing_error: boom"));
    }

    #[test]
    fn test_exhausted_error_carries_report() {
        let err = EngineError::ExhaustedFallback(Box::new(report()));
        assert!(err.is_recoverable());
        assert_eq!(err.failure_report().map(|r| r.attempts.len()), Some(2));
        assert!(!EngineError::Config("bad".into()).is_recoverable());
        assert!(EngineError::HandlerNotFound("x".into())
            .user_hint()
            .contains("not registered"));
    }
}
