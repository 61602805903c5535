//! Routing event stream
//!
//! Every state transition of a task (`PENDING → SCORING → SELECTED →
//! EXECUTING → SUCCESS | FAILURE → DONE`) is pushed to subscribers as a
//! [`RoutingEvent`]. Subscribers receive events over bounded channels; a
//! subscriber that falls behind loses events instead of stalling routing.
//!
//! Each event is also logged through `tracing` so the stream is visible even
//! when nobody subscribes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Phase of the per-task state machine
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pending,
    Scoring,
    Selected,
    Executing,
    Success,
    Failure,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "PENDING",
            Phase::Scoring => "SCORING",
            Phase::Selected => "SELECTED",
            Phase::Executing => "EXECUTING",
            Phase::Success => "SUCCESS",
            Phase::Failure => "FAILURE",
            Phase::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// Which events a subscriber wants
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventFilter {
    /// Only events of one phase
    Phase(Phase),
    /// Every event
    All,
}

/// One state transition of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub task_id: String,
    pub phase: Phase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    /// Latency of the call that led to this transition, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,

    pub at: DateTime<Utc>,
}

impl RoutingEvent {
    pub fn new(task_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            task_id: task_id.into(),
            phase,
            handler_id: None,
            score: None,
            latency_ms: None,
            outcome: None,
            at: Utc::now(),
        }
    }

    pub fn handler(mut self, handler_id: impl Into<String>) -> Self {
        self.handler_id = Some(handler_id.into());
        self
    }

    pub fn score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }
}

/// Event bus for pushing routing events to external sinks
///
/// Cloning the bus is cheap; clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<(EventFilter, mpsc::Sender<RoutingEvent>)>>>,
}

impl EventBus {
    /// Create a new EventBus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to routing events
    ///
    /// The returned channel is bounded with `CHANNEL_BUFFER_SIZE` capacity.
    pub fn subscribe(&self, filter: EventFilter) -> mpsc::Receiver<RoutingEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut subscribers = self.subscribers.lock().expect("EventBus lock poisoned");
        subscribers.push((filter, tx));
        rx
    }

    /// Publish an event to all matching subscribers
    ///
    /// Never blocks: a full channel drops the event for that subscriber and a
    /// closed channel is unsubscribed.
    pub fn publish(&self, event: RoutingEvent) {
        tracing::debug!(
            task_id = %event.task_id,
            phase = %event.phase,
            handler_id = event.handler_id.as_deref().unwrap_or("-"),
            score = event.score,
            latency_ms = event.latency_ms,
            outcome = event.outcome.as_deref().unwrap_or("-"),
            "routing event"
        );

        let mut subscribers = self.subscribers.lock().expect("EventBus lock poisoned");
        subscribers.retain(|(filter, tx)| {
            let wanted = match filter {
                EventFilter::All => true,
                EventFilter::Phase(phase) => *phase == event.phase,
            };
            if !wanted {
                return !tx.is_closed();
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(task_id = %event.task_id, "event subscriber lagging, event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("EventBus lock poisoned")
            .len()
    }
}
