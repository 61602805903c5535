//! Handler trait and descriptor types
//!
//! This module defines the [`Handler`] trait that every specialized handler
//! must implement to take part in routing. A handler exposes exactly two
//! capabilities: `score` (how suitable am I for this task?) and `process`
//! (answer the task). Handlers are selected through the engine's registry,
//! never by inspecting their concrete type.

use crate::errors::HandlerError;
use crate::types::{HandlerOutput, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Trait that all handlers must implement
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable handler id (unique within a registry)
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    /// Capability tags advertised by this handler
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Report how suitable this handler is for the task, in [0, 1].
    ///
    /// Values outside the range are clamped by the engine. Failing with
    /// [`HandlerError::Evaluation`] marks the handler unavailable for the
    /// current round.
    async fn score(&self, task: &Task) -> Result<f64, HandlerError>;

    /// Process the task.
    ///
    /// Failing with [`HandlerError::Processing`] lets the engine retry with the
    /// next-ranked handler.
    async fn process(&self, task: &Task) -> Result<HandlerOutput, HandlerError>;
}

/// Registry metadata for one handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,

    /// Position in registration order; assigned by the registry and used as
    /// the tie-break when scores are equal.
    #[serde(default)]
    pub registration_order: u64,
}

impl HandlerDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: Vec::new(),
            registration_order: 0,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Build a descriptor from what a handler advertises about itself
    pub fn from_handler(handler: &dyn Handler) -> Self {
        Self::new(handler.id(), handler.name()).with_capabilities(handler.capabilities())
    }

    /// True if the handler advertises the given capability tag
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }
}
