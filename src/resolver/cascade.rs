/// Ordered fallback dispatcher
///
/// Each strategy returns a tagged outcome. `Continue` hands over to the next
/// strategy, `Fatal` stops the run. The dispatcher checks the end-to-end
/// deadline before every stage and never starts a stage whose minimum budget
/// no longer fits.

use crate::error::{ResolveError, StrategyFailure};
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one strategy attempt
#[derive(Debug)]
pub enum StepOutcome<T> {
    /// Resolution finished
    Success(T),
    /// This strategy failed; the next one may still succeed
    Continue(ResolveError),
    /// No later strategy can help
    Fatal(ResolveError),
}

/// One way of resolving a request
#[async_trait]
pub trait Strategy<Req, T>: Send + Sync {
    /// Stable name for logs, metrics and composed errors
    fn name(&self) -> &'static str;

    /// Remaining time below which this strategy is not worth starting
    fn min_budget(&self) -> Duration {
        Duration::ZERO
    }

    async fn attempt(&self, request: &Req) -> StepOutcome<T>;
}

/// A successful run
#[derive(Debug)]
pub struct CascadeSuccess<T> {
    pub value: T,
    pub strategy: &'static str,
    /// Failures of the strategies tried before the winner
    pub failures: Vec<StrategyFailure>,
}

/// Strategies attempted strictly in order
pub struct Cascade<Req, T> {
    strategies: Vec<Arc<dyn Strategy<Req, T>>>,
}

impl<Req, T> Clone for Cascade<Req, T> {
    fn clone(&self) -> Self {
        Self {
            strategies: self.strategies.clone(),
        }
    }
}

impl<Req, T> Cascade<Req, T> {
    pub fn new(strategies: Vec<Arc<dyn Strategy<Req, T>>>) -> Self {
        Self { strategies }
    }

    /// Strategy names in execution order
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run strategies in order until one succeeds, one fails fatally, the
    /// list is exhausted or the deadline leaves no room for the next stage
    pub async fn run(
        &self,
        request: &Req,
        deadline: Instant,
    ) -> Result<CascadeSuccess<T>, ResolveError> {
        let mut failures: Vec<StrategyFailure> = Vec::new();

        for strategy in &self.strategies {
            let name = strategy.name();
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() || remaining < strategy.min_budget() {
                warn!(
                    "Skipping strategy {}: {:?} left, needs {:?}",
                    name,
                    remaining,
                    strategy.min_budget()
                );
                metrics::record_strategy(name, "skipped");
                failures.push(StrategyFailure {
                    strategy: name,
                    error: ResolveError::Timeout(format!(
                        "request deadline reached before {}",
                        name
                    )),
                });
                break;
            }

            debug!("Attempting strategy {}", name);

            let attempt = tokio::time::timeout(remaining, strategy.attempt(request));
            let outcome = match attempt.await {
                Ok(outcome) => outcome,
                Err(_) => StepOutcome::Fatal(ResolveError::Timeout(format!(
                    "request deadline reached during {}",
                    name
                ))),
            };

            match outcome {
                StepOutcome::Success(value) => {
                    metrics::record_strategy(name, "success");
                    info!("Strategy {} succeeded", name);
                    return Ok(CascadeSuccess {
                        value,
                        strategy: name,
                        failures,
                    });
                }
                StepOutcome::Continue(error) => {
                    metrics::record_strategy(name, "continue");
                    info!("Strategy {} failed, falling through: {}", name, error);
                    failures.push(StrategyFailure {
                        strategy: name,
                        error,
                    });
                }
                StepOutcome::Fatal(error) => {
                    metrics::record_strategy(name, "fatal");
                    warn!("Strategy {} failed terminally: {}", name, error);
                    failures.push(StrategyFailure {
                        strategy: name,
                        error,
                    });
                    break;
                }
            }
        }

        Err(terminal_error(failures))
    }
}

/// Compose the error surfaced after the cascade gave up.
///
/// A single failure is returned as is. Otherwise the most specific failure
/// (earliest on ties) is surfaced directly when it carries its own remediation
/// (private, not found, rate limited); anything vaguer is wrapped so the
/// caller sees every stage that was tried.
pub fn terminal_error(mut failures: Vec<StrategyFailure>) -> ResolveError {
    if failures.len() <= 1 {
        return failures
            .pop()
            .map(|f| f.error)
            .unwrap_or_else(|| ResolveError::Unavailable("resolution".to_string()));
    }

    let mut best = &failures[0].error;
    for failure in &failures[1..] {
        if failure.error.specificity() > best.specificity() {
            best = &failure.error;
        }
    }

    if best.is_actionable() {
        return best.clone();
    }

    ResolveError::AllStrategiesExhausted {
        cause: Box::new(best.clone()),
        attempts: failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        min_budget: Duration,
        delay: Duration,
        outcome: fn() -> StepOutcome<u32>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, outcome: fn() -> StepOutcome<u32>) -> Arc<Self> {
            Arc::new(Self {
                name,
                min_budget: Duration::ZERO,
                delay: Duration::ZERO,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Strategy<(), u32> for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn min_budget(&self) -> Duration {
            self.min_budget
        }

        async fn attempt(&self, _request: &()) -> StepOutcome<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.outcome)()
        }
    }

    fn cascade(strategies: &[Arc<Scripted>]) -> Cascade<(), u32> {
        Cascade::new(
            strategies
                .iter()
                .map(|s| s.clone() as Arc<dyn Strategy<(), u32>>)
                .collect(),
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn protocol(msg: &str) -> ResolveError {
        ResolveError::UpstreamProtocol(msg.to_string())
    }

    #[tokio::test]
    async fn test_first_success_stops_the_run() {
        let first = Scripted::new("first", || StepOutcome::Success(1));
        let second = Scripted::new("second", || StepOutcome::Success(2));

        let result = cascade(&[first.clone(), second.clone()])
            .run(&(), far_deadline())
            .await
            .unwrap();

        assert_eq!(result.value, 1);
        assert_eq!(result.strategy, "first");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_continue_falls_through_in_order() {
        let first = Scripted::new("first", || StepOutcome::Continue(protocol("html")));
        let second = Scripted::new("second", || StepOutcome::Success(2));

        let result = cascade(&[first.clone(), second.clone()])
            .run(&(), far_deadline())
            .await
            .unwrap();

        assert_eq!(result.value, 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].strategy, "first");
    }

    #[tokio::test]
    async fn test_fatal_stops_the_run() {
        let first = Scripted::new("first", || {
            StepOutcome::Fatal(ResolveError::Forbidden("private".to_string()))
        });
        let second = Scripted::new("second", || StepOutcome::Success(2));

        let err = cascade(&[first, second.clone()])
            .run(&(), far_deadline())
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Forbidden(_)));
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_most_specific_error_survives() {
        let first = Scripted::new("first", || {
            StepOutcome::Continue(ResolveError::NotFound("account".to_string()))
        });
        let second = Scripted::new("second", || StepOutcome::Continue(protocol("no names")));

        let err = cascade(&[first, second])
            .run(&(), far_deadline())
            .await
            .unwrap_err();

        assert_eq!(err, ResolveError::NotFound("account".to_string()));
    }

    #[tokio::test]
    async fn test_vague_failures_are_composed() {
        let first = Scripted::new("first", || StepOutcome::Continue(protocol("html")));
        let second = Scripted::new("second", || StepOutcome::Fatal(protocol("no root marker")));

        let err = cascade(&[first, second])
            .run(&(), far_deadline())
            .await
            .unwrap_err();

        match err {
            ResolveError::AllStrategiesExhausted { cause, attempts } => {
                assert_eq!(*cause, protocol("html"));
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].strategy, "first");
                assert_eq!(attempts[1].strategy, "second");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expensive_stage_skipped_near_deadline() {
        let first = Scripted::new("first", || StepOutcome::Continue(protocol("html")));
        let expensive = Arc::new(Scripted {
            name: "expensive",
            min_budget: Duration::from_secs(20),
            delay: Duration::ZERO,
            outcome: || StepOutcome::Success(4),
            calls: AtomicUsize::new(0),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = cascade(&[first, expensive.clone()])
            .run(&(), deadline)
            .await
            .unwrap_err();

        assert_eq!(expensive.calls(), 0);
        match err {
            ResolveError::AllStrategiesExhausted { attempts, .. } => {
                assert!(matches!(attempts[1].error, ResolveError::Timeout(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_a_running_stage() {
        let slow = Arc::new(Scripted {
            name: "slow",
            min_budget: Duration::ZERO,
            delay: Duration::from_secs(30),
            outcome: || StepOutcome::Success(1),
            calls: AtomicUsize::new(0),
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        let err = cascade(&[slow]).run(&(), deadline).await.unwrap_err();

        assert!(matches!(err, ResolveError::Timeout(_)));
    }

    #[test]
    fn test_terminal_error_tie_keeps_earliest() {
        let err = terminal_error(vec![
            StrategyFailure {
                strategy: "a",
                error: ResolveError::Forbidden("first".to_string()),
            },
            StrategyFailure {
                strategy: "b",
                error: ResolveError::NotFound("second".to_string()),
            },
        ]);
        assert_eq!(err, ResolveError::Forbidden("first".to_string()));
    }
}
