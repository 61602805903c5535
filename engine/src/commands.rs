//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - route: score handlers and answer a query
//! - retrieve: run a hybrid retrieval query
//! - handlers: list the configured handlers
//! - config: show, locate, or validate the configuration

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::ConfigAction;
use crate::config::{Config, RetrievalConfig};
use crate::events::{EventBus, EventFilter, RoutingEvent};
use crate::handlers::build_registry;
use crate::llm::ollama::OllamaChat;
use crate::llm::ChatModel;
use crate::retrieval::http::HttpBackend;
use crate::retrieval::memory::{self, load_corpus};
use crate::retrieval::{Filters, HybridRetriever, RetrievalQuery, RetrievalResult};
use crate::routing::{Coordinator, Response};
use sdk::errors::{EngineError, EngineErrorExt, FailureReport};
use sdk::types::{Source, Task};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Options of the `route` command
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub task_type: Option<String>,
    pub prefer: Option<String>,
    pub fan_out: bool,
    pub deadline_ms: Option<u64>,
    pub events: bool,
    pub handler: Option<String>,
}

/// Build the hybrid retriever described by the retrieval config
///
/// With a `corpus_path`, both backends run in memory over that corpus.
/// Otherwise they are HTTP clients of the configured services.
pub fn build_retriever(config: &RetrievalConfig) -> Result<HybridRetriever> {
    if let Some(path) = &config.corpus_path {
        let documents = load_corpus(path)
            .with_context(|| format!("Failed to load corpus {}", path.display()))?;
        tracing::info!(documents = documents.len(), "Using in-memory retrieval backends");
        let (vector, keyword) = memory::pair(documents);
        return Ok(HybridRetriever::new(
            Arc::new(vector),
            Arc::new(keyword),
            config,
        ));
    }

    let (vector, keyword) =
        HttpBackend::pair(config).context("Failed to create retrieval backends")?;
    tracing::debug!(
        vector = %vector.base_url(),
        keyword = %keyword.base_url(),
        "Using HTTP retrieval backends"
    );
    Ok(HybridRetriever::new(
        Arc::new(vector),
        Arc::new(keyword),
        config,
    ))
}

/// Build a coordinator over the configured built-in handlers
pub fn build_coordinator(config: &Config, events: EventBus) -> Result<Coordinator> {
    let chat: Arc<dyn ChatModel> =
        Arc::new(OllamaChat::from_config(&config.llm).context("Failed to create chat model")?);
    let retriever = Arc::new(build_retriever(&config.retrieval)?);

    let registry = build_registry(config, chat, Some(retriever))
        .context("Failed to register built-in handlers")?;

    Ok(Coordinator::new(
        Arc::new(registry),
        config.routing.clone(),
        events,
    ))
}

/// Route a query and print the response
pub async fn handle_route(
    query: String,
    options: RouteOptions,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let events = EventBus::new();
    let printer = options.events.then(|| {
        let mut rx = events.subscribe(EventFilter::All);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event, format);
            }
        })
    });

    let coordinator = build_coordinator(config, events.clone())?;
    let task = build_task(query, &options);
    let task_id = task.id.clone();

    let result = match &options.handler {
        Some(handler_id) => coordinator
            .route_to(handler_id, task)
            .await
            .map(Response::Single),
        None => coordinator.route(task).await,
    };

    // Closing every sender ends the printer once it has drained the stream
    drop(coordinator);
    drop(events);
    if let Some(printer) = printer {
        printer.await.ok();
    }

    match result {
        Ok(response) => {
            print_response(&response, format)?;
            Ok(())
        }
        Err(err) => {
            print_failure(&err, format)?;
            Err(anyhow::Error::new(err).context(format!("Task {} failed", task_id)))
        }
    }
}

fn build_task(query: String, options: &RouteOptions) -> Task {
    let mut task = Task::new(query);
    if let Some(task_type) = &options.task_type {
        task = task.with_task_type(task_type);
    }
    if let Some(prefer) = &options.prefer {
        task = task.with_preferred_handler(prefer);
    }
    if let Some(ms) = options.deadline_ms {
        task = task.with_deadline(Duration::from_millis(ms));
    }
    if options.fan_out {
        task = task.multi_domain();
    }
    task
}

fn print_event(event: &RoutingEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            if let Ok(line) = serde_json::to_string(event) {
                eprintln!("{}", line);
            }
        }
        OutputFormat::Text => {
            let mut line = format!("[{}] {}", event.phase, event.task_id);
            if let Some(handler_id) = &event.handler_id {
                line.push_str(&format!(" handler={}", handler_id));
            }
            if let Some(score) = event.score {
                line.push_str(&format!(" score={:.2}", score));
            }
            if let Some(latency) = event.latency_ms {
                line.push_str(&format!(" latency={}ms", latency));
            }
            if let Some(outcome) = &event.outcome {
                line.push_str(&format!(" outcome={}", outcome));
            }
            eprintln!("{}", line);
        }
    }
}

fn print_response(response: &Response, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
        OutputFormat::Text => {
            match response.answer() {
                Some(answer) => println!("{}", answer),
                None => println!("{}", response.payload()),
            }
            println!();

            match response {
                Response::Single(result) => {
                    println!("Handler:    {}", result.handler_ids.join(", "));
                    println!("Mode:       {}", result.mode);
                    println!("Confidence: {:.2}", result.confidence);
                    println!("Retries:    {}", result.retry_count);
                    println!(
                        "Latency:    {}ms (total {}ms)",
                        result.latency_ms, result.elapsed_ms
                    );
                }
                Response::Aggregated(envelope) => {
                    println!("Handlers:   {}", envelope.handler_ids.join(", "));
                    println!("Mode:       fan_out");
                    println!("Confidence: {:.2}", envelope.confidence);
                    for contribution in &envelope.contributions {
                        println!(
                            "  - {} (confidence {:.2}, {}ms)",
                            contribution.handler_ids.join(", "),
                            contribution.confidence,
                            contribution.latency_ms
                        );
                    }
                }
            }

            print_sources(response.sources());
        }
    }
    Ok(())
}

fn print_sources(sources: &[Source]) {
    if sources.is_empty() {
        return;
    }
    println!("Sources:");
    for (i, source) in sources.iter().enumerate() {
        let origin = if source.origin.is_empty() {
            source.content_id.as_str()
        } else {
            source.origin.as_str()
        };
        println!("  {}. {} ({:.3})", i + 1, origin, source.score);
    }
}

fn print_failure(err: &EngineError, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let output = json!({
                "error": err.to_string(),
                "hint": err.user_hint(),
                "recoverable": err.is_recoverable(),
                "report": err.failure_report(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            eprintln!("Hint: {}", err.user_hint());
            if let Some(report) = err.failure_report() {
                print_report(report);
            }
        }
    }
    Ok(())
}

fn print_report(report: &FailureReport) {
    eprintln!("Attempts ({} mode):", report.mode);
    for attempt in &report.attempts {
        eprintln!(
            "  - {} (score {:.2}): {} {}",
            attempt.handler_id, attempt.score, attempt.error_kind, attempt.message
        );
    }
    if !report.scores.is_empty() {
        eprintln!("Scores:");
        for (handler_id, score) in &report.scores {
            eprintln!("  {:<12} {:.2}", handler_id, score);
        }
    }
}

/// Run a hybrid retrieval query and print the fused results
pub async fn handle_retrieve(
    query: String,
    top_k: Option<usize>,
    filters: Vec<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let retriever = build_retriever(&config.retrieval)?;

    let mut request = RetrievalQuery::new(query, top_k.unwrap_or(retriever.default_top_k()));
    request.filters = parse_filters(&filters)?;

    let result = retriever
        .query(&request)
        .await
        .context("Hybrid retrieval failed")?;

    print_retrieval(&result, format)
}

fn print_retrieval(result: &RetrievalResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        OutputFormat::Text => {
            if let Some(backend) = result.failed_backend {
                println!("Warning: {} backend unavailable, results are degraded", backend);
                println!();
            }
            if result.is_empty() {
                println!("No results");
                return Ok(());
            }
            for (i, item) in result.items.iter().enumerate() {
                println!("{}. {} ({:.3})", i + 1, item.content_id, item.fused_score);
                let vector = item
                    .vector_score
                    .map_or("-".to_string(), |s| format!("{:.3}", s));
                let keyword = item
                    .keyword_score
                    .map_or("-".to_string(), |s| format!("{:.3}", s));
                println!("   vector: {}  keyword: {}", vector, keyword);
                if !item.origin.is_empty() {
                    println!("   source: {}", item.origin);
                }
                if !item.snippet.is_empty() {
                    println!("   {}", item.snippet);
                }
            }
        }
    }
    Ok(())
}

/// Parse `KEY=VALUE` filters; values that parse as JSON keep their type
pub fn parse_filters(raw: &[String]) -> Result<Filters> {
    let mut filters = Filters::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("Invalid filter '{}', expected KEY=VALUE", entry))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("Invalid filter '{}', key is empty", entry);
        }
        let value = serde_json::from_str::<Value>(value.trim())
            .unwrap_or_else(|_| Value::String(value.trim().to_string()));
        filters.insert(key.to_string(), value);
    }
    Ok(filters)
}

/// List the configured handlers
pub fn handle_handlers(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let handlers: Vec<_> = config
                .handlers
                .iter()
                .enumerate()
                .map(|(order, h)| {
                    json!({
                        "id": h.id,
                        "name": h.name,
                        "capabilities": h.capabilities,
                        "task_types": h.task_types,
                        "uses_retrieval": h.uses_retrieval,
                        "fallback": h.id.eq_ignore_ascii_case(&config.routing.fallback_handler),
                        "registration_order": order,
                    })
                })
                .collect();
            let output = json!({ "handlers": handlers, "count": handlers.len() });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            if config.handlers.is_empty() {
                println!("No handlers configured");
                return Ok(());
            }
            println!("Handlers ({}):", config.handlers.len());
            println!();
            for handler in &config.handlers {
                let mut flags = Vec::new();
                if handler.uses_retrieval {
                    flags.push("retrieval");
                }
                if handler
                    .id
                    .eq_ignore_ascii_case(&config.routing.fallback_handler)
                {
                    flags.push("fallback");
                }
                println!("{} ({})", handler.id, handler.name);
                println!("  Capabilities: {}", handler.capabilities.join(", "));
                if !flags.is_empty() {
                    println!("  Flags: {}", flags.join(", "));
                }
            }
        }
    }
    Ok(())
}

/// Show, locate, or validate the configuration
pub fn handle_config(
    action: ConfigAction,
    config: &Config,
    config_path: &Path,
    format: OutputFormat,
) -> Result<()> {
    match action {
        ConfigAction::Show => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
            OutputFormat::Text => {
                print!(
                    "{}",
                    toml::to_string_pretty(config).context("Failed to serialize config")?
                );
            }
        },
        ConfigAction::Path => match format {
            OutputFormat::Json => {
                println!("{}", json!({ "path": config_path.display().to_string() }));
            }
            OutputFormat::Text => println!("{}", config_path.display()),
        },
        ConfigAction::Validate { file } => {
            let path = file.unwrap_or_else(|| config_path.to_path_buf());
            let outcome = Config::load_from_path(&path);
            match format {
                OutputFormat::Json => {
                    let output = json!({
                        "path": path.display().to_string(),
                        "valid": outcome.is_ok(),
                        "error": outcome.as_ref().err().map(|e| e.to_string()),
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Text => {
                    if outcome.is_ok() {
                        println!("{} is valid", path.display());
                    }
                }
            }
            outcome.with_context(|| format!("Invalid configuration {}", path.display()))?;
        }
    }
    Ok(())
}

/// The configuration file in effect: `--config` or the default location
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Config::default_config_path().context("Failed to locate config file"),
    }
}
