//! Coordinator
//!
//! Drives one task through `PENDING → SCORING → SELECTED → EXECUTING →
//! SUCCESS | FAILURE → DONE`, publishing an event at every transition.
//!
//! **Single mode** tries handlers one at a time in candidate order:
//! the preferred handler (if the task names a registered one), then the
//! fallback handler when the top score is below `min_score_threshold`, then
//! the ranking. At most `max_attempts` handlers are executed; exhausting them
//! yields `EngineError::ExhaustedFallback` with the full attempt list.
//!
//! **Fan-out mode** (multi-domain tasks) runs the top `fan_out_n` handlers
//! that clear the threshold concurrently under one shared deadline, drops the
//! ones that fail, and aggregates the rest. It only fails when every
//! dispatched handler fails.
//!
//! Every scoring and execution call runs on a bounded worker pool with a
//! timeout no longer than what is left of the task deadline. Cancelling the
//! task (or dropping the `route` future) aborts all in-flight calls.

use crate::config::RoutingConfig;
use crate::events::{EventBus, Phase, RoutingEvent};
use crate::registry::{RegisteredHandler, Registry};
use sdk::errors::{AttemptRecord, EngineError, FailureReport, HandlerError, RoutingMode};
use sdk::handler::Handler;
use sdk::types::{clamp_unit, HandlerOutput, Task};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::aggregator;
use super::evaluator::{call_timeout, Evaluator, Ranking};
use super::{CoordinationResult, Outcome, Response};

/// Per-task routing state shared by the single and fan-out paths
struct TaskRun {
    task: Arc<Task>,
    started: Instant,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl TaskRun {
    fn id(&self) -> &str {
        &self.task.id
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Routes tasks to registered handlers
pub struct Coordinator {
    registry: Arc<Registry>,
    config: RoutingConfig,
    evaluator: Evaluator,
    pool: Arc<Semaphore>,
    events: EventBus,
}

impl Coordinator {
    /// Create a coordinator over `registry`
    ///
    /// The worker pool (`max_concurrency` permits) is shared by scoring and
    /// execution calls of all tasks routed through this coordinator.
    pub fn new(registry: Arc<Registry>, config: RoutingConfig, events: EventBus) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let evaluator = Evaluator::new(config.per_call_timeout(), Arc::clone(&pool));
        Self {
            registry,
            config,
            evaluator,
            pool,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Route a task and return its response
    ///
    /// # Errors
    ///
    /// - `EngineError::NoHandlers` if the registry is empty
    /// - `EngineError::ExhaustedFallback` if no attempted handler succeeded
    pub async fn route(&self, task: Task) -> Result<Response, EngineError> {
        self.route_with_cancel(task, CancellationToken::new()).await
    }

    /// Route a task, abandoning it when `cancel` fires
    ///
    /// # Errors
    ///
    /// As [`Coordinator::route`], plus `EngineError::Cancelled` when the
    /// token is cancelled before the task completes.
    pub async fn route_with_cancel(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> Result<Response, EngineError> {
        let run = self.start(task, cancel);
        self.publish(RoutingEvent::new(run.id(), Phase::Pending));

        let handlers = self.registry.snapshot();
        if handlers.is_empty() {
            tracing::error!(task_id = %run.id(), "No handlers registered");
            self.finish(&run, "no_handlers");
            return Err(EngineError::NoHandlers);
        }

        self.publish(RoutingEvent::new(run.id(), Phase::Scoring));
        let ranking = self
            .evaluator
            .evaluate(&run.task, &handlers, run.deadline, &run.cancel)
            .await;
        self.check_cancelled(&run)?;

        for score in ranking.scores() {
            let mut event = RoutingEvent::new(run.id(), Phase::Scoring)
                .handler(&score.handler_id)
                .score(score.score);
            if !score.available {
                event = event.outcome("unavailable");
            }
            self.publish(event);
        }

        let result = if run.task.multi_domain {
            self.fan_out(&run, &handlers, &ranking).await
        } else {
            self.single(&run, &handlers, &ranking).await
        };

        match &result {
            Ok(_) => self.finish(&run, "success"),
            Err(EngineError::Cancelled { .. }) => self.finish(&run, "cancelled"),
            Err(_) => self.finish(&run, "failure"),
        }
        result
    }

    /// Execute one named handler directly, without scoring
    ///
    /// The handler is looked up by id, then by id or name ignoring case.
    ///
    /// # Errors
    ///
    /// - `EngineError::HandlerNotFound` if no such handler is registered
    /// - `EngineError::ExhaustedFallback` if the handler fails
    pub async fn route_to(
        &self,
        handler_id: &str,
        task: Task,
    ) -> Result<CoordinationResult, EngineError> {
        let entry = self
            .registry
            .get(handler_id)
            .or_else(|| self.registry.find_by_name(handler_id))
            .ok_or_else(|| EngineError::HandlerNotFound(handler_id.to_string()))?;

        let run = self.start(task, CancellationToken::new());
        self.publish(RoutingEvent::new(run.id(), Phase::Pending));
        self.publish(RoutingEvent::new(run.id(), Phase::Selected).handler(entry.id()));

        let result = match self.attempt(&run, &entry, 0.0).await {
            Ok((output, latency)) => Ok(self.success(
                &run,
                &entry,
                output,
                latency,
                0,
                RoutingMode::Direct,
                Vec::new(),
            )),
            Err(record) => {
                tracing::error!(
                    task_id = %run.id(),
                    handler_id = %entry.id(),
                    "Direct dispatch failed"
                );
                Err(EngineError::ExhaustedFallback(Box::new(FailureReport {
                    task_id: run.id().to_string(),
                    mode: RoutingMode::Direct,
                    attempts: vec![record],
                    scores: Vec::new(),
                })))
            }
        };

        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.finish(&run, outcome);
        result
    }

    fn start(&self, task: Task, cancel: CancellationToken) -> TaskRun {
        let started = Instant::now();
        let deadline = task
            .deadline
            .or_else(|| self.config.task_deadline())
            .map(|d| started + d);

        tracing::info!(
            task_id = %task.id,
            multi_domain = task.multi_domain,
            task_type = task.task_type.as_deref().unwrap_or("-"),
            "Routing task"
        );

        TaskRun {
            task: Arc::new(task),
            started,
            deadline,
            cancel,
        }
    }

    async fn single(
        &self,
        run: &TaskRun,
        handlers: &[RegisteredHandler],
        ranking: &Ranking,
    ) -> Result<Response, EngineError> {
        let candidates = self.candidates(run, handlers, ranking);
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for (entry, score) in candidates.iter().take(self.config.max_attempts) {
            self.check_cancelled(run)?;
            if run.deadline_passed() {
                tracing::warn!(task_id = %run.id(), "Task deadline passed, no further attempts");
                break;
            }

            if !attempts.is_empty() {
                tracing::warn!(
                    task_id = %run.id(),
                    handler_id = %entry.id(),
                    retry = attempts.len(),
                    "Retrying with next-ranked handler"
                );
            }
            self.publish(
                RoutingEvent::new(run.id(), Phase::Selected)
                    .handler(entry.id())
                    .score(*score),
            );

            match self.attempt(run, entry, *score).await {
                Ok((output, latency)) => {
                    let retry_count = attempts.len() as u32;
                    return Ok(Response::Single(self.success(
                        run,
                        entry,
                        output,
                        latency,
                        retry_count,
                        RoutingMode::Single,
                        attempts,
                    )));
                }
                Err(record) => {
                    self.check_cancelled(run)?;
                    attempts.push(record);
                }
            }
        }

        tracing::error!(
            task_id = %run.id(),
            attempts = attempts.len(),
            "All handler attempts exhausted"
        );
        Err(EngineError::ExhaustedFallback(Box::new(FailureReport {
            task_id: run.id().to_string(),
            mode: RoutingMode::Single,
            attempts,
            scores: ranking.pairs(),
        })))
    }

    /// Execution order for single mode, without duplicates
    fn candidates(
        &self,
        run: &TaskRun,
        handlers: &[RegisteredHandler],
        ranking: &Ranking,
    ) -> Vec<(RegisteredHandler, f64)> {
        // Matched the same way config validation checks it.
        let fallback = handlers
            .iter()
            .find(|h| h.id().eq_ignore_ascii_case(&self.config.fallback_handler));
        let fallback_id = fallback.map(|h| h.id());
        let find = |id: &str| handlers.iter().find(|h| h.id() == id);
        let score_of = |id: &str| ranking.get(id).map(|s| s.score).unwrap_or(0.0);

        let mut ordered: Vec<(RegisteredHandler, f64)> = Vec::new();
        let mut push = |entry: &RegisteredHandler| {
            if !ordered.iter().any(|(e, _)| e.id() == entry.id()) {
                ordered.push((entry.clone(), score_of(entry.id())));
            }
        };

        if let Some(preferred) = run.task.preferred_handler.as_deref() {
            let matched = handlers.iter().find(|h| {
                h.id().eq_ignore_ascii_case(preferred)
                    || h.descriptor.name.eq_ignore_ascii_case(preferred)
            });
            match matched {
                Some(entry) if ranking.get(entry.id()).is_some_and(|s| s.available) => {
                    tracing::info!(task_id = %run.id(), handler_id = %entry.id(), "Using preferred handler");
                    push(entry);
                }
                Some(entry) => tracing::warn!(
                    task_id = %run.id(),
                    handler_id = %entry.id(),
                    "Preferred handler unavailable this round, ignoring"
                ),
                None => tracing::warn!(
                    task_id = %run.id(),
                    preferred = %preferred,
                    "Preferred handler not registered, ignoring"
                ),
            }
        }

        let top = ranking.top().map(|s| s.score).unwrap_or(0.0);
        if top < self.config.min_score_threshold {
            match fallback {
                Some(entry) => {
                    tracing::info!(
                        task_id = %run.id(),
                        top_score = top,
                        threshold = self.config.min_score_threshold,
                        "Top score below threshold, using fallback handler"
                    );
                    push(entry);
                }
                None => tracing::warn!(
                    task_id = %run.id(),
                    fallback = %self.config.fallback_handler,
                    "Fallback handler not registered"
                ),
            }
        }

        for score in ranking
            .scores()
            .iter()
            .filter(|s| s.available || Some(s.handler_id.as_str()) == fallback_id)
        {
            if let Some(entry) = find(&score.handler_id) {
                push(entry);
            }
        }

        ordered
    }

    async fn fan_out(
        &self,
        run: &TaskRun,
        handlers: &[RegisteredHandler],
        ranking: &Ranking,
    ) -> Result<Response, EngineError> {
        let chosen: Vec<(RegisteredHandler, f64)> = ranking
            .available()
            .filter(|s| s.score >= self.config.min_score_threshold)
            .filter_map(|s| {
                handlers
                    .iter()
                    .find(|h| h.id() == s.handler_id)
                    .map(|h| (h.clone(), s.score))
            })
            .take(self.config.fan_out_n)
            .collect();

        if chosen.is_empty() {
            tracing::info!(
                task_id = %run.id(),
                "No handler clears the threshold, routing in single mode"
            );
            return self.single(run, handlers, ranking).await;
        }

        let timeout = call_timeout(self.config.per_call_timeout(), run.deadline);
        let mut set = JoinSet::new();

        for (index, (entry, score)) in chosen.iter().enumerate() {
            self.publish(
                RoutingEvent::new(run.id(), Phase::Selected)
                    .handler(entry.id())
                    .score(*score),
            );
            self.publish(RoutingEvent::new(run.id(), Phase::Executing).handler(entry.id()));

            let handler = Arc::clone(&entry.handler);
            let task = Arc::clone(&run.task);
            let pool = Arc::clone(&self.pool);
            let cancel = run.cancel.clone();
            set.spawn(async move {
                let started = Instant::now();
                let result = execute(handler, &task, timeout, &pool, &cancel).await;
                (index, result, started.elapsed())
            });
        }

        let mut slots: Vec<Option<(Result<HandlerOutput, HandlerError>, Duration)>> =
            (0..chosen.len()).map(|_| None).collect();

        loop {
            tokio::select! {
                _ = run.cancel.cancelled() => {
                    set.abort_all();
                    return Err(EngineError::Cancelled { task_id: run.id().to_string() });
                }
                joined = set.join_next() => match joined {
                    Some(Ok((index, result, latency))) => slots[index] = Some((result, latency)),
                    Some(Err(e)) => tracing::warn!(task_id = %run.id(), "Fan-out call aborted: {}", e),
                    None => break,
                },
            }
        }

        let mut results = Vec::new();
        let mut attempts = Vec::new();

        for ((entry, score), slot) in chosen.iter().zip(slots) {
            let (result, latency) = slot.unwrap_or((
                Err(HandlerError::Processing("handler task aborted".into())),
                Duration::ZERO,
            ));
            match result {
                Ok(output) => {
                    self.publish(
                        RoutingEvent::new(run.id(), Phase::Success)
                            .handler(entry.id())
                            .latency(latency)
                            .outcome("success"),
                    );
                    results.push(self.success_result(
                        run,
                        entry,
                        output,
                        latency,
                        0,
                        RoutingMode::FanOut,
                        Vec::new(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(task_id = %run.id(), handler_id = %entry.id(), "Fan-out handler failed: {}", e);
                    let record = attempt_record(entry, *score, &e);
                    self.publish(
                        RoutingEvent::new(run.id(), Phase::Failure)
                            .handler(entry.id())
                            .latency(latency)
                            .outcome(record.error_kind.to_string()),
                    );
                    attempts.push(record);
                }
            }
        }

        if results.is_empty() {
            tracing::error!(task_id = %run.id(), "Every fan-out handler failed");
            return Err(EngineError::ExhaustedFallback(Box::new(FailureReport {
                task_id: run.id().to_string(),
                mode: RoutingMode::FanOut,
                attempts,
                scores: ranking.pairs(),
            })));
        }

        let envelope = aggregator::combine(&results);
        tracing::info!(
            task_id = %run.id(),
            handlers = ?envelope.handler_ids,
            excluded = attempts.len(),
            confidence = envelope.confidence,
            "Fan-out complete"
        );
        Ok(Response::Aggregated(envelope))
    }

    /// Execute one handler, publishing EXECUTING and SUCCESS/FAILURE events
    async fn attempt(
        &self,
        run: &TaskRun,
        entry: &RegisteredHandler,
        score: f64,
    ) -> Result<(HandlerOutput, Duration), AttemptRecord> {
        self.publish(RoutingEvent::new(run.id(), Phase::Executing).handler(entry.id()));

        let timeout = call_timeout(self.config.per_call_timeout(), run.deadline);
        let started = Instant::now();
        let result = execute(
            Arc::clone(&entry.handler),
            &run.task,
            timeout,
            &self.pool,
            &run.cancel,
        )
        .await;
        let latency = started.elapsed();

        match result {
            Ok(output) => {
                self.publish(
                    RoutingEvent::new(run.id(), Phase::Success)
                        .handler(entry.id())
                        .score(score)
                        .latency(latency)
                        .outcome("success"),
                );
                Ok((output, latency))
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %run.id(),
                    handler_id = %entry.id(),
                    latency_ms = latency.as_millis() as u64,
                    "Handler failed: {}",
                    e
                );
                let record = attempt_record(entry, score, &e);
                self.publish(
                    RoutingEvent::new(run.id(), Phase::Failure)
                        .handler(entry.id())
                        .score(score)
                        .latency(latency)
                        .outcome(record.error_kind.to_string()),
                );
                Err(record)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn success(
        &self,
        run: &TaskRun,
        entry: &RegisteredHandler,
        output: HandlerOutput,
        latency: Duration,
        retry_count: u32,
        mode: RoutingMode,
        attempts: Vec<AttemptRecord>,
    ) -> CoordinationResult {
        let result = self.success_result(run, entry, output, latency, retry_count, mode, attempts);
        tracing::info!(
            task_id = %run.id(),
            handler_id = %entry.id(),
            retry_count,
            confidence = result.confidence,
            elapsed_ms = result.elapsed_ms,
            "Task handled"
        );
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn success_result(
        &self,
        run: &TaskRun,
        entry: &RegisteredHandler,
        output: HandlerOutput,
        latency: Duration,
        retry_count: u32,
        mode: RoutingMode,
        attempts: Vec<AttemptRecord>,
    ) -> CoordinationResult {
        CoordinationResult {
            task_id: run.id().to_string(),
            handler_ids: vec![entry.id().to_string()],
            payload: output.payload,
            confidence: clamp_unit(output.confidence),
            retry_count,
            outcome: Outcome::Success,
            sources: output.sources,
            latency_ms: latency.as_millis() as u64,
            elapsed_ms: run.elapsed_ms(),
            mode,
            attempts,
        }
    }

    fn check_cancelled(&self, run: &TaskRun) -> Result<(), EngineError> {
        if run.cancel.is_cancelled() {
            tracing::warn!(task_id = %run.id(), "Task cancelled");
            return Err(EngineError::Cancelled {
                task_id: run.id().to_string(),
            });
        }
        Ok(())
    }

    fn finish(&self, run: &TaskRun, outcome: &str) {
        self.publish(
            RoutingEvent::new(run.id(), Phase::Done)
                .latency(run.started.elapsed())
                .outcome(outcome),
        );
    }

    fn publish(&self, event: RoutingEvent) {
        self.events.publish(event);
    }
}

/// Run `process` on the worker pool, bounded by `timeout` and `cancel`
async fn execute(
    handler: Arc<dyn Handler>,
    task: &Task,
    timeout: Duration,
    pool: &Semaphore,
    cancel: &CancellationToken,
) -> Result<HandlerOutput, HandlerError> {
    // The permit wait counts against the call timeout.
    let call = async {
        let _permit = pool.acquire().await.map_err(|_| HandlerError::Cancelled)?;
        handler.process(task).await
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(HandlerError::Cancelled),
        processed = tokio::time::timeout(timeout, call) => match processed {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(timeout)),
        },
    }
}

fn attempt_record(entry: &RegisteredHandler, score: f64, error: &HandlerError) -> AttemptRecord {
    AttemptRecord {
        handler_id: entry.id().to_string(),
        score,
        error_kind: error.kind(false),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use async_trait::async_trait;
    use sdk::errors::ErrorKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Scripted {
        id: &'static str,
        score: f64,
        fail: bool,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn ok(id: &'static str, score: f64) -> Self {
            Self {
                id,
                score,
                fail: false,
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(id: &'static str, score: f64) -> Self {
            Self {
                fail: true,
                ..Self::ok(id, score)
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Handler for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        async fn score(&self, _task: &Task) -> Result<f64, HandlerError> {
            Ok(self.score)
        }

        async fn process(&self, _task: &Task) -> Result<HandlerOutput, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(HandlerError::Processing(format!("{} broke", self.id)))
            } else {
                Ok(HandlerOutput::text(format!("answer from {}", self.id), self.score))
            }
        }
    }

    fn config() -> RoutingConfig {
        RoutingConfig {
            per_call_timeout_ms: 1_000,
            fallback_handler: "generalist".to_string(),
            ..RoutingConfig::default()
        }
    }

    fn coordinator(handlers: Vec<Scripted>, config: RoutingConfig) -> Coordinator {
        let registry = Arc::new(Registry::new());
        for handler in handlers {
            registry.register_handler(Arc::new(handler)).unwrap();
        }
        Coordinator::new(registry, config, EventBus::new())
    }

    #[tokio::test]
    async fn test_retries_next_ranked_handler() {
        let coordinator = coordinator(
            vec![
                Scripted::failing("a", 0.9),
                Scripted::ok("b", 0.6),
                Scripted::ok("c", 0.2),
            ],
            config(),
        );

        let result = coordinator
            .route(Task::new("q"))
            .await
            .unwrap()
            .into_single()
            .unwrap();

        assert_eq!(result.handler_ids, vec!["b"]);
        assert_eq!(result.retry_count, 1);
        assert!(result.is_success());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.attempts[0].handler_id, "a");
        assert_eq!(result.attempts[0].error_kind, ErrorKind::Processing);
        assert_eq!(result.answer(), Some("answer from b"));
    }

    #[tokio::test]
    async fn test_below_threshold_uses_fallback() {
        let coordinator = coordinator(
            vec![
                Scripted::ok("x", 0.3),
                Scripted::ok("y", 0.4),
                Scripted::ok("generalist", 0.1),
            ],
            config(),
        );

        let response = coordinator.route(Task::new("q")).await.unwrap();
        assert_eq!(response.handler_ids(), ["generalist".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_id_matches_ignoring_case() {
        let mut cfg = config();
        cfg.fallback_handler = "Generalist".to_string();
        let coordinator = coordinator(
            vec![
                Scripted::ok("x", 0.3),
                Scripted::ok("y", 0.4),
                Scripted::ok("generalist", 0.1),
            ],
            cfg,
        );

        let response = coordinator.route(Task::new("q")).await.unwrap();
        assert_eq!(response.handler_ids(), ["generalist".to_string()]);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let coordinator = coordinator(
            vec![
                Scripted::failing("a", 0.9),
                Scripted::failing("b", 0.8),
                Scripted::ok("c", 0.7),
            ],
            config(),
        );

        let err = coordinator.route(Task::new("q").with_id("t-9")).await.unwrap_err();
        let report = err.failure_report().unwrap();

        assert_eq!(report.task_id, "t-9");
        assert_eq!(report.mode, RoutingMode::Single);
        assert_eq!(report.exhausted_handlers(), vec!["a", "b"]);
        assert_eq!(report.scores.len(), 3);
        assert_eq!(report.scores[0], ("a".to_string(), 0.9));
    }

    #[tokio::test]
    async fn test_processing_timeout_retries() {
        let mut cfg = config();
        cfg.per_call_timeout_ms = 50;
        let coordinator = coordinator(
            vec![
                Scripted::ok("slow", 0.9).delayed(Duration::from_secs(5)),
                Scripted::ok("fast", 0.7),
            ],
            cfg,
        );

        let result = coordinator
            .route(Task::new("q"))
            .await
            .unwrap()
            .into_single()
            .unwrap();

        assert_eq!(result.handler_ids, vec!["fast"]);
        assert_eq!(result.retry_count, 1);
    }

    #[tokio::test]
    async fn test_preferred_handler_goes_first() {
        let coordinator = coordinator(
            vec![Scripted::ok("a", 0.9), Scripted::ok("b", 0.6)],
            config(),
        );

        let response = coordinator
            .route(Task::new("q").with_preferred_handler("B"))
            .await
            .unwrap();
        assert_eq!(response.handler_ids(), ["b".to_string()]);

        let response = coordinator
            .route(Task::new("q").with_preferred_handler("missing"))
            .await
            .unwrap();
        assert_eq!(response.handler_ids(), ["a".to_string()]);
    }

    #[tokio::test]
    async fn test_no_handlers() {
        let coordinator = coordinator(Vec::new(), config());
        let err = coordinator.route(Task::new("q")).await.unwrap_err();
        assert!(matches!(err, EngineError::NoHandlers));
    }

    #[tokio::test]
    async fn test_route_to() {
        let coordinator = coordinator(
            vec![Scripted::ok("a", 0.9), Scripted::failing("b", 0.1)],
            config(),
        );

        let result = coordinator.route_to("a", Task::new("q")).await.unwrap();
        assert_eq!(result.mode, RoutingMode::Direct);
        assert_eq!(result.handler_ids, vec!["a"]);

        let err = coordinator.route_to("nope", Task::new("q")).await.unwrap_err();
        assert!(matches!(err, EngineError::HandlerNotFound(_)));

        let err = coordinator.route_to("b", Task::new("q")).await.unwrap_err();
        assert_eq!(
            err.failure_report().map(|r| r.mode),
            Some(RoutingMode::Direct)
        );
    }

    #[tokio::test]
    async fn test_fan_out_excludes_failures() {
        let mut cfg = config();
        cfg.fan_out_n = 3;
        let coordinator = coordinator(
            vec![
                Scripted::ok("a", 0.9).delayed(Duration::from_millis(30)),
                Scripted::failing("b", 0.8),
                Scripted::ok("c", 0.7),
                Scripted::ok("d", 0.6),
            ],
            cfg,
        );

        let envelope = coordinator
            .route(Task::new("q").multi_domain())
            .await
            .unwrap()
            .into_aggregated()
            .unwrap();

        assert_eq!(envelope.handler_ids, vec!["a", "c"]);
        assert_eq!(envelope.confidence, 0.9);
        assert_eq!(envelope.payload["answer"], "answer from a");
    }

    #[tokio::test]
    async fn test_fan_out_excludes_timed_out_handler() {
        let mut cfg = config();
        cfg.per_call_timeout_ms = 100;
        cfg.fan_out_n = 2;
        let coordinator = coordinator(
            vec![
                Scripted::ok("slow", 0.9).delayed(Duration::from_secs(2)),
                Scripted::ok("fast", 0.8),
            ],
            cfg,
        );

        let started = Instant::now();
        let envelope = coordinator
            .route(Task::new("q").multi_domain())
            .await
            .unwrap()
            .into_aggregated()
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(envelope.handler_ids, vec!["fast"]);
        assert_eq!(envelope.confidence, 0.8);
        assert_eq!(envelope.payload["answer"], "answer from fast");
    }

    #[tokio::test]
    async fn test_fan_out_fails_only_when_all_fail() {
        let coordinator = coordinator(
            vec![Scripted::failing("a", 0.9), Scripted::failing("b", 0.8)],
            config(),
        );

        let err = coordinator
            .route(Task::new("q").multi_domain())
            .await
            .unwrap_err();
        let report = err.failure_report().unwrap();
        assert_eq!(report.mode, RoutingMode::FanOut);
        assert_eq!(report.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_below_threshold_falls_back_to_single() {
        let coordinator = coordinator(
            vec![Scripted::ok("a", 0.2), Scripted::ok("generalist", 0.1)],
            config(),
        );

        let response = coordinator.route(Task::new("q").multi_domain()).await.unwrap();
        let result = response.into_single().unwrap();
        assert_eq!(result.handler_ids, vec!["generalist"]);
    }

    #[tokio::test]
    async fn test_events_follow_state_machine() {
        let coordinator = coordinator(vec![Scripted::ok("a", 0.9)], config());
        let mut rx = coordinator.events().subscribe(EventFilter::All);

        coordinator.route(Task::new("q")).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if phases.last() != Some(&event.phase) {
                phases.push(event.phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                Phase::Pending,
                Phase::Scoring,
                Phase::Selected,
                Phase::Executing,
                Phase::Success,
                Phase::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_in_flight_work() {
        let finished = Arc::new(AtomicBool::new(false));

        struct Sleeper(Arc<AtomicBool>);

        #[async_trait]
        impl Handler for Sleeper {
            fn id(&self) -> &str {
                "sleeper"
            }

            fn name(&self) -> &str {
                "Sleeper"
            }

            async fn score(&self, _task: &Task) -> Result<f64, HandlerError> {
                Ok(0.9)
            }

            async fn process(&self, _task: &Task) -> Result<HandlerOutput, HandlerError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                self.0.store(true, Ordering::SeqCst);
                Ok(HandlerOutput::text("late", 1.0))
            }
        }

        let registry = Arc::new(Registry::new());
        registry
            .register_handler(Arc::new(Sleeper(Arc::clone(&finished))))
            .unwrap();
        let mut cfg = config();
        cfg.per_call_timeout_ms = 10_000;
        let coordinator = Arc::new(Coordinator::new(registry, cfg, EventBus::new()));

        let cancel = CancellationToken::new();
        let handle = {
            let coordinator = Arc::clone(&coordinator);
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.route_with_cancel(Task::new("q"), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled { .. })));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deadline_bounds_wait_for_busy_pool() {
        let mut cfg = config();
        cfg.max_concurrency = 1;
        cfg.per_call_timeout_ms = 10_000;
        let coordinator = Arc::new(coordinator(
            vec![
                Scripted::ok("busy", 0.9).delayed(Duration::from_secs(2)),
                Scripted::ok("generalist", 0.1),
            ],
            cfg,
        ));

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.route(Task::new("long")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let result = coordinator
            .route(Task::new("short").with_deadline(Duration::from_millis(100)))
            .await;

        assert!(started.elapsed() < Duration::from_millis(800));
        assert!(result.is_err());
        first.abort();
    }

    #[tokio::test]
    async fn test_max_attempts_bounds_executions() {
        let a = Scripted::failing("a", 0.9);
        let b = Scripted::failing("b", 0.8);
        let c = Scripted::ok("c", 0.7);
        let c_calls = Arc::clone(&c.calls);

        let mut cfg = config();
        cfg.max_attempts = 2;
        let coordinator = coordinator(vec![a, b, c], cfg);

        assert!(coordinator.route(Task::new("q")).await.is_err());
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    }
}
