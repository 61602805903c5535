//! Switchboard Engine Library
//!
//! This library provides the core functionality of the Switchboard router.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Routing event stream
pub mod events;

/// Capability registry
pub mod registry;

/// Suitability evaluation, coordination, and aggregation
pub mod routing;

/// Hybrid vector + keyword retrieval
pub mod retrieval;

/// Chat model abstraction used by built-in handlers
pub mod llm;

/// Built-in handlers
pub mod handlers;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod commands;
