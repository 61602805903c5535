//! Suitability Evaluator
//!
//! Scores a task against every handler concurrently. Each scoring call runs on
//! the shared worker pool and is bounded by the per-call timeout (shortened to
//! the task deadline when that comes first). The evaluator waits for the whole
//! batch before ranking, so the ranking never depends on which call finished
//! first.

use crate::registry::RegisteredHandler;
use sdk::errors::HandlerError;
use sdk::types::{clamp_unit, Task};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::SuitabilityScore;

/// Scores of one evaluation round, best first
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    scores: Vec<SuitabilityScore>,
}

impl Ranking {
    /// Rank scores by score descending, then registration order
    pub fn new(mut scores: Vec<SuitabilityScore>) -> Self {
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.registration_order.cmp(&b.registration_order))
        });
        Self { scores }
    }

    pub fn scores(&self) -> &[SuitabilityScore] {
        &self.scores
    }

    /// Handlers that answered their scoring call, best first
    pub fn available(&self) -> impl Iterator<Item = &SuitabilityScore> {
        self.scores.iter().filter(|s| s.available)
    }

    /// Best available score
    pub fn top(&self) -> Option<&SuitabilityScore> {
        self.available().next()
    }

    pub fn get(&self, handler_id: &str) -> Option<&SuitabilityScore> {
        self.scores.iter().find(|s| s.handler_id == handler_id)
    }

    /// (handler id, score) pairs in rank order
    pub fn pairs(&self) -> Vec<(String, f64)> {
        self.scores
            .iter()
            .map(|s| (s.handler_id.clone(), s.score))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<&str> {
        self.scores.iter().map(|s| s.handler_id.as_str()).collect()
    }
}

/// Concurrent suitability evaluator
pub struct Evaluator {
    per_call_timeout: Duration,
    pool: Arc<Semaphore>,
}

impl Evaluator {
    /// Create an evaluator that runs scoring calls on the given worker pool
    pub fn new(per_call_timeout: Duration, pool: Arc<Semaphore>) -> Self {
        Self {
            per_call_timeout,
            pool,
        }
    }

    /// Score `task` against every handler in `handlers`
    ///
    /// Never fails: a handler whose call errors, times out, or is cancelled
    /// gets score 0 and is flagged unavailable.
    pub async fn evaluate(
        &self,
        task: &Arc<Task>,
        handlers: &[RegisteredHandler],
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Ranking {
        let timeout = call_timeout(self.per_call_timeout, deadline);
        let mut set = JoinSet::new();

        for (index, entry) in handlers.iter().enumerate() {
            let handler = Arc::clone(&entry.handler);
            let task = Arc::clone(task);
            let pool = Arc::clone(&self.pool);
            let cancel = cancel.clone();

            set.spawn(async move {
                // The permit wait counts against the call timeout.
                let call = async {
                    let _permit = pool
                        .acquire_owned()
                        .await
                        .map_err(|_| HandlerError::Cancelled)?;
                    handler.score(&task).await
                };

                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(HandlerError::Cancelled),
                    scored = tokio::time::timeout(timeout, call) => match scored {
                        Ok(result) => result,
                        Err(_) => Err(HandlerError::Timeout(timeout)),
                    },
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<f64, HandlerError>>> =
            (0..handlers.len()).map(|_| None).collect();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => tracing::warn!(task_id = %task.id, "Scoring task aborted: {}", e),
            }
        }

        let scores = handlers
            .iter()
            .zip(slots)
            .map(|(entry, slot)| score_entry(&task.id, entry, slot))
            .collect();

        let ranking = Ranking::new(scores);
        tracing::debug!(task_id = %task.id, ranking = ?ranking.pairs(), "Evaluation complete");
        ranking
    }
}

fn score_entry(
    task_id: &str,
    entry: &RegisteredHandler,
    slot: Option<Result<f64, HandlerError>>,
) -> SuitabilityScore {
    let (score, rationale, available) = match slot {
        Some(Ok(raw)) => {
            let score = clamp_unit(raw);
            let rationale = if score == raw {
                "self-reported".to_string()
            } else {
                format!("self-reported {} clamped to {}", raw, score)
            };
            (score, rationale, true)
        }
        Some(Err(e)) => {
            tracing::warn!(
                task_id = %task_id,
                handler_id = %entry.id(),
                error_kind = %e.kind(true),
                "Scoring failed: {}",
                e
            );
            (0.0, e.to_string(), false)
        }
        None => (0.0, "scoring task aborted".to_string(), false),
    };

    SuitabilityScore {
        handler_id: entry.id().to_string(),
        task_id: task_id.to_string(),
        score,
        rationale,
        available,
        registration_order: entry.order(),
    }
}

/// Per-call timeout, shortened so the call never outlives the task deadline
pub(crate) fn call_timeout(per_call: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => per_call.min(deadline.saturating_duration_since(Instant::now())),
        None => per_call,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use async_trait::async_trait;
    use sdk::handler::Handler;
    use sdk::types::HandlerOutput;

    struct Fixed {
        id: &'static str,
        score: Result<f64, HandlerError>,
        delay: Duration,
    }

    impl Fixed {
        fn new(id: &'static str, score: f64) -> Self {
            Self {
                id,
                score: Ok(score),
                delay: Duration::ZERO,
            }
        }

        fn failing(id: &'static str) -> Self {
            Self {
                id,
                score: Err(HandlerError::Evaluation("model offline".into())),
                delay: Duration::ZERO,
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Handler for Fixed {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        async fn score(&self, _task: &Task) -> Result<f64, HandlerError> {
            tokio::time::sleep(self.delay).await;
            self.score.clone()
        }

        async fn process(&self, _task: &Task) -> Result<HandlerOutput, HandlerError> {
            Ok(HandlerOutput::text(self.id, 1.0))
        }
    }

    fn registry(handlers: Vec<Fixed>) -> Registry {
        let registry = Registry::new();
        for handler in handlers {
            registry.register_handler(Arc::new(handler)).unwrap();
        }
        registry
    }

    fn evaluator(timeout: Duration) -> Evaluator {
        Evaluator::new(timeout, Arc::new(Semaphore::new(4)))
    }

    #[tokio::test]
    async fn test_ranks_by_score_descending() {
        let registry = registry(vec![
            Fixed::new("c", 0.2),
            Fixed::new("a", 0.9),
            Fixed::new("b", 0.6),
        ]);
        let task = Arc::new(Task::new("q"));

        let ranking = evaluator(Duration::from_secs(1))
            .evaluate(&task, &registry.snapshot(), None, &CancellationToken::new())
            .await;

        assert_eq!(ranking.ids(), vec!["a", "b", "c"]);
        assert_eq!(ranking.top().map(|s| s.score), Some(0.9));
        assert!(ranking.scores().iter().all(|s| s.task_id == task.id));
    }

    #[tokio::test]
    async fn test_ties_broken_by_registration_order() {
        let registry = registry(vec![
            Fixed::new("first", 0.5).delayed(Duration::from_millis(40)),
            Fixed::new("second", 0.5),
            Fixed::new("third", 0.5).delayed(Duration::from_millis(10)),
        ]);
        let task = Arc::new(Task::new("q"));

        let ranking = evaluator(Duration::from_secs(1))
            .evaluate(&task, &registry.snapshot(), None, &CancellationToken::new())
            .await;

        assert_eq!(ranking.ids(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_score_zero() {
        let registry = registry(vec![
            Fixed::failing("broken"),
            Fixed::new("slow", 0.9).delayed(Duration::from_secs(5)),
            Fixed::new("ok", 0.4),
        ]);
        let task = Arc::new(Task::new("q"));

        let ranking = evaluator(Duration::from_millis(50))
            .evaluate(&task, &registry.snapshot(), None, &CancellationToken::new())
            .await;

        assert_eq!(ranking.ids(), vec!["ok", "broken", "slow"]);
        let broken = ranking.get("broken").unwrap();
        assert_eq!(broken.score, 0.0);
        assert!(!broken.available);
        assert!(broken.rationale.contains("model offline"));

        let slow = ranking.get("slow").unwrap();
        assert_eq!(slow.score, 0.0);
        assert!(!slow.available);
        assert_eq!(ranking.top().map(|s| s.handler_id.as_str()), Some("ok"));
    }

    #[tokio::test]
    async fn test_out_of_range_scores_are_clamped() {
        let registry = registry(vec![Fixed::new("high", 1.4), Fixed::new("low", -0.3)]);
        let task = Arc::new(Task::new("q"));

        let ranking = evaluator(Duration::from_secs(1))
            .evaluate(&task, &registry.snapshot(), None, &CancellationToken::new())
            .await;

        assert_eq!(ranking.get("high").map(|s| s.score), Some(1.0));
        assert_eq!(ranking.get("low").map(|s| s.score), Some(0.0));
        assert!(ranking.get("high").unwrap().rationale.contains("clamped"));
    }

    #[tokio::test]
    async fn test_deadline_shortens_call_timeout() {
        let registry = registry(vec![Fixed::new("slow", 0.9).delayed(Duration::from_secs(5))]);
        let task = Arc::new(Task::new("q"));
        let deadline = Instant::now() + Duration::from_millis(30);

        let started = Instant::now();
        let ranking = evaluator(Duration::from_secs(10))
            .evaluate(&task, &registry.snapshot(), Some(deadline), &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!ranking.get("slow").unwrap().available);
    }

    #[tokio::test]
    async fn test_cancelled_evaluation_marks_all_unavailable() {
        let registry = registry(vec![
            Fixed::new("a", 0.9).delayed(Duration::from_secs(5)),
            Fixed::new("b", 0.8).delayed(Duration::from_secs(5)),
        ]);
        let task = Arc::new(Task::new("q"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ranking = evaluator(Duration::from_secs(10))
            .evaluate(&task, &registry.snapshot(), None, &cancel)
            .await;

        assert!(ranking.top().is_none());
        assert_eq!(ranking.scores().len(), 2);
    }

    #[tokio::test]
    async fn test_saturated_pool_respects_deadline() {
        let registry = registry(vec![Fixed::new("a", 0.9), Fixed::new("b", 0.8)]);
        let task = Arc::new(Task::new("q"));
        let pool = Arc::new(Semaphore::new(1));
        let held = Arc::clone(&pool).acquire_owned().await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);

        let started = Instant::now();
        let ranking = Evaluator::new(Duration::from_secs(10), Arc::clone(&pool))
            .evaluate(&task, &registry.snapshot(), Some(deadline), &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(ranking.top().is_none());
        assert!(ranking.get("a").unwrap().rationale.contains("timed out"));
        drop(held);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_permit_wait() {
        let registry = registry(vec![Fixed::new("a", 0.9)]);
        let task = Arc::new(Task::new("q"));
        let pool = Arc::new(Semaphore::new(1));
        let held = Arc::clone(&pool).acquire_owned().await.unwrap();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            })
        };

        let ranking = tokio::time::timeout(
            Duration::from_secs(1),
            Evaluator::new(Duration::from_secs(10), Arc::clone(&pool)).evaluate(
                &task,
                &registry.snapshot(),
                None,
                &cancel,
            ),
        )
        .await
        .unwrap();

        canceller.await.unwrap();
        assert!(!ranking.get("a").unwrap().available);
        drop(held);
    }

    #[test]
    fn test_call_timeout_without_deadline() {
        assert_eq!(
            call_timeout(Duration::from_millis(200), None),
            Duration::from_millis(200)
        );
        let past = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            call_timeout(Duration::from_millis(200), Some(past)),
            Duration::ZERO
        );
    }
}
