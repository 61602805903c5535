//! Capability Registry
//!
//! In-memory directory of the handlers that take part in routing. Entries are
//! added and removed explicitly and never expire. The registry hands out
//! snapshots in registration order; that order is the tie-break basis for
//! ranking.
//!
//! Reads take a shared lock and clone `Arc`s out, so scoring and execution
//! never hold the lock across an await point. Writes are mutually exclusive.

use sdk::errors::EngineError;
use sdk::handler::{Handler, HandlerDescriptor};
use std::sync::{Arc, RwLock};

/// A registered handler together with its descriptor
#[derive(Clone)]
pub struct RegisteredHandler {
    pub descriptor: HandlerDescriptor,
    pub handler: Arc<dyn Handler>,
}

impl RegisteredHandler {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn order(&self) -> u64 {
        self.descriptor.registration_order
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<RegisteredHandler>,
    next_order: u64,
}

/// Registry of handlers, shared by reference between coordinator and callers
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the given descriptor
    ///
    /// The registration order is assigned here and overrides whatever the
    /// descriptor carried.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateHandler` if the id is already registered.
    pub fn register(
        &self,
        mut descriptor: HandlerDescriptor,
        handler: Arc<dyn Handler>,
    ) -> Result<HandlerDescriptor, EngineError> {
        let mut state = self.state.write().expect("Registry lock poisoned");

        if state.entries.iter().any(|e| e.descriptor.id == descriptor.id) {
            return Err(EngineError::DuplicateHandler(descriptor.id));
        }

        descriptor.registration_order = state.next_order;
        state.next_order += 1;

        tracing::info!(
            handler_id = %descriptor.id,
            order = descriptor.registration_order,
            "Registered handler {}",
            descriptor.name
        );

        state.entries.push(RegisteredHandler {
            descriptor: descriptor.clone(),
            handler,
        });

        Ok(descriptor)
    }

    /// Register a handler using the metadata it advertises about itself
    pub fn register_handler(
        &self,
        handler: Arc<dyn Handler>,
    ) -> Result<HandlerDescriptor, EngineError> {
        let descriptor = HandlerDescriptor::from_handler(handler.as_ref());
        self.register(descriptor, handler)
    }

    /// Remove a handler
    ///
    /// # Errors
    ///
    /// Returns `EngineError::HandlerNotFound` if the id is not registered.
    pub fn unregister(&self, id: &str) -> Result<HandlerDescriptor, EngineError> {
        let mut state = self.state.write().expect("Registry lock poisoned");

        let position = state
            .entries
            .iter()
            .position(|e| e.descriptor.id == id)
            .ok_or_else(|| EngineError::HandlerNotFound(id.to_string()))?;

        let removed = state.entries.remove(position);
        tracing::info!(handler_id = %id, "Unregistered handler");

        Ok(removed.descriptor)
    }

    /// Descriptors in registration order
    pub fn list(&self) -> Vec<HandlerDescriptor> {
        let state = self.state.read().expect("Registry lock poisoned");
        state.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Snapshot of all registered handlers in registration order
    pub fn snapshot(&self) -> Vec<RegisteredHandler> {
        let state = self.state.read().expect("Registry lock poisoned");
        state.entries.clone()
    }

    /// Look up a handler by exact id
    pub fn get(&self, id: &str) -> Option<RegisteredHandler> {
        let state = self.state.read().expect("Registry lock poisoned");
        state.entries.iter().find(|e| e.descriptor.id == id).cloned()
    }

    /// Look up a handler by id or display name, ignoring case
    pub fn find_by_name(&self, name: &str) -> Option<RegisteredHandler> {
        let state = self.state.read().expect("Registry lock poisoned");
        state
            .entries
            .iter()
            .find(|e| {
                e.descriptor.id.eq_ignore_ascii_case(name)
                    || e.descriptor.name.eq_ignore_ascii_case(name)
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("Registry lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
