//! Switchboard SDK
//!
//! Shared library providing the handler contract, task types, and error types.
//! This crate is used by the engine and by anything that implements a handler.

/// Handler trait and descriptor
pub mod handler;

/// Error types and handling
pub mod errors;

/// Task and handler output types
pub mod types;

// Re-export commonly used types
pub use errors::{
    AttemptRecord, EngineError, EngineErrorExt, ErrorKind, FailureReport, HandlerError,
    RoutingMode,
};
pub use handler::{Handler, HandlerDescriptor};
pub use types::{clamp_unit, HandlerOutput, Modality, Source, Task};
