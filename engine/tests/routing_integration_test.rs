//! Integration tests for routing with the built-in handlers
//!
//! The chat model is an Ollama mock served by wiremock and retrieval runs
//! over an in-memory corpus, so the full route → score → execute → answer
//! path is exercised without external services.

use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use sdk::errors::{EngineError, ErrorKind, RoutingMode};
use sdk::types::Task;
use switchboard_engine::config::Config;
use switchboard_engine::events::{EventBus, EventFilter, Phase};
use switchboard_engine::handlers::build_registry;
use switchboard_engine::llm::ollama::OllamaChat;
use switchboard_engine::llm::ChatModel;
use switchboard_engine::retrieval::memory::{pair, Document};
use switchboard_engine::retrieval::HybridRetriever;
use switchboard_engine::routing::{Coordinator, Response};

async fn ollama(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({
            "model": "llama3.1:8b",
            "message": { "role": "assistant", "content": "Mocked answer." },
            "done": true
        })))
        .mount(&server)
        .await;
    server
}

fn corpus() -> Vec<Document> {
    vec![
        Document::new("own", "Ownership rules decide when Rust frees memory")
            .with_source("kb/ownership.md"),
        Document::new("borrow", "Borrowing lets code read values without taking ownership"),
        Document::new("soil", "Compost improves garden soil"),
    ]
}

fn coordinator(server: &MockServer, events: EventBus) -> Coordinator {
    let config = Config::default();
    let mut llm = config.llm.clone();
    llm.base_url = server.uri();
    let chat: Arc<dyn ChatModel> = Arc::new(OllamaChat::from_config(&llm).unwrap());

    let (vector, keyword) = pair(corpus());
    let retriever = Arc::new(HybridRetriever::new(
        Arc::new(vector),
        Arc::new(keyword),
        &config.retrieval,
    ));

    let registry = build_registry(&config, chat, Some(retriever)).unwrap();
    Coordinator::new(Arc::new(registry), config.routing, events)
}

#[tokio::test]
async fn test_keyword_query_routes_to_research_with_sources() {
    let server = ollama(200).await;
    let coordinator = coordinator(&server, EventBus::new());

    let response = coordinator
        .route(Task::new("Find notes on ownership and memory"))
        .await
        .unwrap();

    let result = response.into_single().unwrap();
    assert_eq!(result.handler_ids, vec!["research"]);
    assert_eq!(result.retry_count, 0);
    assert_eq!(result.mode, RoutingMode::Single);
    assert_eq!(result.answer(), Some("Mocked answer."));
    assert_eq!(result.confidence, 0.85);
    assert_eq!(result.sources[0].content_id, "own");
    assert_eq!(result.sources[0].origin, "kb/ownership.md");
}

#[tokio::test]
async fn test_low_scores_route_to_generalist() {
    let server = ollama(200).await;
    let coordinator = coordinator(&server, EventBus::new());

    let response = coordinator.route(Task::new("hello there")).await.unwrap();
    assert_eq!(response.handler_ids(), ["generalist".to_string()]);
    assert!(response.sources().is_empty());
}

#[tokio::test]
async fn test_task_type_hint_wins_over_keywords() {
    let server = ollama(200).await;
    let coordinator = coordinator(&server, EventBus::new());

    let task = Task::new("write a poem").with_task_type("reasoning");
    let response = coordinator.route(task).await.unwrap();
    assert_eq!(response.handler_ids(), ["reasoning".to_string()]);
}

#[tokio::test]
async fn test_preferred_handler_by_name() {
    let server = ollama(200).await;
    let coordinator = coordinator(&server, EventBus::new());

    let task = Task::new("hello there").with_preferred_handler("Creative");
    let response = coordinator.route(task).await.unwrap();
    assert_eq!(response.handler_ids(), ["creative".to_string()]);
}

#[tokio::test]
async fn test_model_outage_exhausts_attempts() {
    let server = ollama(500).await;
    let coordinator = coordinator(&server, EventBus::new());

    let err = coordinator
        .route(Task::new("Find notes on ownership"))
        .await
        .unwrap_err();

    let report = err.failure_report().expect("failure report");
    assert_eq!(report.mode, RoutingMode::Single);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].handler_id, "research");
    assert!(report
        .attempts
        .iter()
        .all(|a| a.error_kind == ErrorKind::Processing));
    assert_eq!(report.scores.len(), 4);
}

#[tokio::test]
async fn test_fan_out_aggregates_specialists() {
    let server = ollama(200).await;
    let coordinator = coordinator(&server, EventBus::new());

    let task = Task::new("write a story and explain the ending").multi_domain();
    let response = coordinator.route(task).await.unwrap();

    let envelope = match response {
        Response::Aggregated(envelope) => envelope,
        Response::Single(_) => panic!("Expected an aggregated response"),
    };
    assert_eq!(envelope.handler_ids.len(), 2);
    assert!(envelope.handler_ids.contains(&"creative".to_string()));
    assert!(envelope.handler_ids.contains(&"reasoning".to_string()));
    assert_eq!(envelope.confidence, 0.8);
    assert_eq!(envelope.payload["handler"], "Reasoning");
    assert_eq!(envelope.recombine(), envelope);
}

#[tokio::test]
async fn test_route_to_named_handler() {
    let server = ollama(200).await;
    let coordinator = coordinator(&server, EventBus::new());

    let result = coordinator
        .route_to("creative", Task::new("Find notes on ownership"))
        .await
        .unwrap();
    assert_eq!(result.handler_ids, vec!["creative"]);
    assert_eq!(result.mode, RoutingMode::Direct);

    let err = coordinator
        .route_to("oracle", Task::new("anything"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::HandlerNotFound(id) if id == "oracle"));
}

#[tokio::test]
async fn test_events_cover_every_transition() {
    let server = ollama(200).await;
    let events = EventBus::new();
    let mut rx = events.subscribe(EventFilter::All);
    let coordinator = coordinator(&server, events);

    let task = Task::new("hello there").with_id("task-42");
    coordinator.route(task).await.unwrap();

    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.task_id, "task-42");
        phases.push(event.phase);
    }

    assert_eq!(phases.first(), Some(&Phase::Pending));
    assert_eq!(phases.last(), Some(&Phase::Done));
    for phase in [
        Phase::Scoring,
        Phase::Selected,
        Phase::Executing,
        Phase::Success,
    ] {
        assert!(phases.contains(&phase), "missing {}", phase);
    }
    assert!(!phases.contains(&Phase::Failure));
}
