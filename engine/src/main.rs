// Switchboard task router
// Main entry point for the switchboard binary

use anyhow::Context;
use clap::Parser;
use switchboard_engine::cli::{Cli, Command};
use switchboard_engine::commands::{
    handle_config, handle_handlers, handle_retrieve, handle_route, resolve_config_path,
    OutputFormat, RouteOptions,
};
use switchboard_engine::config::Config;
use switchboard_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config_path = resolve_config_path(cli.config.as_deref())?;
    let config = if cli.config.is_some() {
        Config::load_from_path(&config_path)
    } else {
        Config::load_or_create()
    }
    .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    // --log wins over the config file; RUST_LOG wins over both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    tracing::debug!(
        "Switchboard v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    match cli.command {
        Command::Route {
            query,
            task_type,
            prefer,
            fan_out,
            deadline_ms,
            events,
            handler,
        } => {
            tracing::info!("Routing query: {}", query);
            let options = RouteOptions {
                task_type,
                prefer,
                fan_out,
                deadline_ms,
                events,
                handler,
            };
            handle_route(query, options, &config, format).await
        }

        Command::Retrieve {
            query,
            top_k,
            filters,
        } => {
            tracing::info!("Retrieving: {}", query);
            handle_retrieve(query, top_k, filters, &config, format).await
        }

        Command::Handlers => handle_handlers(&config, format),

        Command::Config { action } => {
            tracing::debug!("Config management: {:?}", action);
            handle_config(action, &config, &config_path, format)
        }
    }
}
