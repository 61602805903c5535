//! CLI interface for Switchboard
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Switchboard task router
///
/// Scores every registered handler against a query, dispatches it to the
/// best one with fallback and retry, and grounds answers with hybrid
/// retrieval.
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Route a query to the most suitable handler
    Route {
        /// The query to answer
        query: String,

        /// Explicit task type hint (e.g. "rag", "math", "story")
        #[arg(long, value_name = "TYPE")]
        task_type: Option<String>,

        /// Handler to try first, if it is available
        #[arg(long, value_name = "ID")]
        prefer: Option<String>,

        /// Dispatch to several top handlers and aggregate their answers
        #[arg(long)]
        fan_out: bool,

        /// Deadline for the whole task, in milliseconds
        #[arg(long, value_name = "MS")]
        deadline_ms: Option<u64>,

        /// Print routing events as they happen
        #[arg(long)]
        events: bool,

        /// Skip scoring and send the query to this handler
        #[arg(long = "handler", value_name = "ID", conflicts_with_all = ["prefer", "fan_out"])]
        handler: Option<String>,
    },

    /// Run a hybrid retrieval query
    Retrieve {
        /// The query text
        query: String,

        /// Number of results to return (default: from config)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Metadata filter, repeatable (KEY=VALUE)
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },

    /// List registered handlers
    Handlers,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Validate a configuration file
    Validate {
        /// File to validate (default: the active configuration)
        file: Option<PathBuf>,
    },
}
