//! Built-in handlers
//!
//! Every built-in handler is a [`KeywordHandler`] configured from a
//! `[[handlers]]` entry. Scoring is rule-based, checked in order:
//!
//! 1. the task's `task_type` is one of the handler's task types → `explicit_score`
//! 2. the query contains one of the handler's keywords → `keyword_score`
//! 3. the query is a question and `question_score` is set → `question_score`
//! 4. otherwise → `base_score`
//!
//! Processing prompts the chat model with the handler's system prompt. A
//! handler with `uses_retrieval` first grounds the prompt with the hybrid
//! retriever and returns the top results as sources.

use crate::config::{Config, HandlerConfig};
use crate::llm::{ChatModel, Message};
use crate::registry::Registry;
use crate::retrieval::memory::tokenize;
use crate::retrieval::{Filters, HybridRetriever, RetrievalQuery};
use async_trait::async_trait;
use sdk::errors::{EngineError, HandlerError};
use sdk::handler::Handler;
use sdk::types::{HandlerOutput, Source, Task};
use serde_json::json;
use std::sync::Arc;

/// Number of retrieved items cited as sources
const MAX_SOURCES: usize = 3;

/// Task context key holding retrieval filters
const FILTERS_KEY: &str = "filters";

/// Config-driven handler backed by a chat model
pub struct KeywordHandler {
    config: HandlerConfig,
    phrases: Vec<String>,
    chat: Arc<dyn ChatModel>,
    retriever: Option<Arc<HybridRetriever>>,
}

impl KeywordHandler {
    pub fn new(
        config: HandlerConfig,
        chat: Arc<dyn ChatModel>,
        retriever: Option<Arc<HybridRetriever>>,
    ) -> Self {
        let phrases = config
            .keywords
            .iter()
            .map(|k| normalized(k))
            .filter(|k| !k.trim().is_empty())
            .collect();
        Self {
            config,
            phrases,
            chat,
            retriever,
        }
    }

    fn explicit_match(&self, task: &Task) -> bool {
        task.task_type.as_deref().is_some_and(|task_type| {
            self.config
                .task_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(task_type))
        })
    }

    fn keyword_match(&self, query: &str) -> bool {
        let query = normalized(query);
        self.phrases.iter().any(|phrase| query.contains(phrase))
    }

    async fn ground(&self, task: &Task) -> Result<(String, Vec<Source>), HandlerError> {
        let Some(retriever) = self.retriever.as_ref().filter(|_| self.config.uses_retrieval)
        else {
            return Ok((String::new(), Vec::new()));
        };

        let mut query = RetrievalQuery::new(&task.query, retriever.default_top_k());
        if let Some(filters) = task.context.get(FILTERS_KEY).and_then(|v| v.as_object()) {
            query.filters = filters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Filters>();
        }

        let result = retriever
            .query(&query)
            .await
            .map_err(|e| HandlerError::Processing(format!("Retrieval failed: {}", e)))?;

        if result.degraded {
            tracing::warn!(
                handler_id = %self.config.id,
                failed_backend = ?result.failed_backend,
                "Answering from degraded retrieval"
            );
        }

        let context = result
            .items
            .iter()
            .map(|item| item.snippet.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let sources = result
            .items
            .iter()
            .take(MAX_SOURCES)
            .map(|item| item.to_source())
            .collect();

        Ok((context, sources))
    }
}

/// Lowercased tokens joined by single spaces, padded so phrase matches
/// respect word boundaries
fn normalized(text: &str) -> String {
    format!(" {} ", tokenize(text).join(" "))
}

#[async_trait]
impl Handler for KeywordHandler {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> Vec<String> {
        self.config.capabilities.clone()
    }

    async fn score(&self, task: &Task) -> Result<f64, HandlerError> {
        let score = if self.explicit_match(task) {
            self.config.explicit_score
        } else if self.keyword_match(&task.query) {
            self.config.keyword_score
        } else {
            match self.config.question_score {
                Some(score) if task.query.trim_end().ends_with('?') => score,
                _ => self.config.base_score,
            }
        };
        Ok(score)
    }

    async fn process(&self, task: &Task) -> Result<HandlerOutput, HandlerError> {
        let (context, sources) = self.ground(task).await?;

        let mut prompt = format!("Query: {}", task.query);
        if !context.is_empty() {
            prompt.push_str("\n\nContext:\n");
            prompt.push_str(&context);
        }
        prompt.push_str("\n\nRespond in the language of the query.");

        let messages = [
            Message::system(&self.config.system_prompt),
            Message::user(prompt),
        ];

        let answer = self
            .chat
            .complete(&messages)
            .await
            .map_err(|e| HandlerError::Processing(e.to_string()))?;

        tracing::debug!(
            handler_id = %self.config.id,
            model = %self.chat.name(),
            sources = sources.len(),
            "Generated answer"
        );

        Ok(HandlerOutput::json(
            json!({ "answer": answer, "handler": self.config.name }),
            self.config.confidence,
        )
        .with_sources(sources))
    }
}

/// Build a registry holding the configured built-in handlers, in config order
pub fn build_registry(
    config: &Config,
    chat: Arc<dyn ChatModel>,
    retriever: Option<Arc<HybridRetriever>>,
) -> Result<Registry, EngineError> {
    let registry = Registry::new();
    for handler_config in &config.handlers {
        let retriever = if handler_config.uses_retrieval {
            retriever.clone()
        } else {
            None
        };
        let handler = KeywordHandler::new(handler_config.clone(), Arc::clone(&chat), retriever);
        registry.register_handler(Arc::new(handler))?;
    }
    Ok(registry)
}
