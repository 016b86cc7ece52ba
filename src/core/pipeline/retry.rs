use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::core::{
    domain::{KillHandler, RunConfig, RunResult, RunStatus},
    errors::EvaluatorError,
    pipeline::{RelayKillHandler, complete_detached},
    traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
};

/// Resubmits crashed runs up to a fixed number of times.
#[derive(Debug)]
pub struct RetryCrashedEvaluator {
    inner: Arc<dyn Evaluator>,
    retries: usize,
    warned: Arc<AtomicBool>,
}

impl RetryCrashedEvaluator {
    pub fn new(inner: Arc<dyn Evaluator>, retries: usize) -> Self {
        Self {
            inner,
            retries,
            warned: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct RetryBatch {
    inner: Arc<dyn Evaluator>,
    runs: Vec<RunConfig>,
    relays: Vec<Arc<RelayKillHandler>>,
    observer: Option<RunObserver>,
    warned: Arc<AtomicBool>,
    state: Mutex<RetryState>,
}

struct RetryState {
    snapshot: Vec<RunResult>,
    finals: Vec<Option<RunResult>>,
    remaining: usize,
    on_complete: Option<CompletionHandler>,
    discarded: usize,
    wasted_runtime: f64,
    wasted_wallclock: f64,
}

impl RetryBatch {
    /// Retry is pointless for a run the caller killed or with no budget left.
    fn retryable(&self, pos: usize, result: &RunResult, budget: usize) -> bool {
        result.status() == RunStatus::Crashed && budget > 0 && !self.relays[pos].is_killed()
    }

    fn submit(self: Arc<Self>, positions: Vec<usize>, budget: usize) {
        let runs = positions.iter().map(|&p| self.runs[p].clone()).collect();
        let positions = Arc::new(positions);

        let observer = self.observer.as_ref().map(|_| -> RunObserver {
            let batch = self.clone();
            let positions = positions.clone();
            Arc::new(move |results: &[RunResult]| batch.observe(&positions, results, budget))
        });

        let batch = self.clone();
        self.inner.evaluate_runs_async(
            runs,
            Box::new(move |result| match result {
                Ok(results) => batch.complete(&positions, results, budget),
                Err(e) => batch.fail(e),
            }),
            observer,
        );
    }

    fn observe(&self, positions: &[usize], results: &[RunResult], budget: usize) {
        let Some(observer) = &self.observer else {
            return;
        };
        let mut state = self.state.lock();
        if state.on_complete.is_none() {
            return;
        }
        for (&pos, result) in positions.iter().zip(results) {
            if state.finals[pos].is_some() {
                continue;
            }
            let relay = &self.relays[pos];
            state.snapshot[pos] = if result.is_running() {
                relay.relay_to(result);
                result.with_kill_handler(relay.clone())
            } else if self.retryable(pos, result, budget) {
                RunResult::running(self.runs[pos].clone(), 0.0, 0.0, relay.clone())
            } else {
                result.clone()
            };
        }
        observer(&state.snapshot);
    }

    fn complete(self: Arc<Self>, positions: &[usize], results: Vec<RunResult>, budget: usize) {
        let mut retry = Vec::new();
        let mut state = self.state.lock();
        if state.on_complete.is_none() {
            return;
        }

        for (&pos, result) in positions.iter().zip(results) {
            if self.retryable(pos, &result, budget) {
                state.discarded += 1;
                state.wasted_runtime += result.runtime();
                state.wasted_wallclock += result.wallclock_time();
                retry.push(pos);
            } else {
                state.snapshot[pos] = result.clone();
                state.finals[pos] = Some(result);
                state.remaining -= 1;
            }
        }

        if !retry.is_empty() {
            drop(state);
            if !self.warned.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    "Retrying {} crashed run(s), {} attempt(s) left; further retries are logged at debug level",
                    retry.len(),
                    budget
                );
            } else {
                tracing::debug!("Retrying {} crashed run(s), {} attempt(s) left", retry.len(), budget);
            }
            let batch = self.clone();
            tokio::spawn(async move { batch.submit(retry, budget - 1) });
            return;
        }

        if state.remaining > 0 {
            return;
        }
        if state.discarded > 0 {
            tracing::debug!(
                "Discarded {} crashed attempt(s), wasting {:.2}s of runtime and {:.2}s of wall time",
                state.discarded,
                state.wasted_runtime,
                state.wasted_wallclock
            );
        }
        if let Some(observer) = &self.observer {
            observer(&state.snapshot);
        }
        let on_complete = state.on_complete.take();
        let results = state
            .finals
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| EvaluatorError::Internal {
                msg: "retry batch finished without a result".to_string(),
            });
        drop(state);

        if let Some(on_complete) = on_complete {
            on_complete(results);
        }
    }

    fn fail(&self, error: EvaluatorError) {
        let on_complete = self.state.lock().on_complete.take();
        if let Some(on_complete) = on_complete {
            tracing::error!("Retry batch failed: {}", error);
            on_complete(Err(error));
        }
    }
}

#[async_trait::async_trait]
impl Evaluator for RetryCrashedEvaluator {
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    ) {
        if runs.is_empty() {
            complete_detached(on_complete, Ok(Vec::new()));
            return;
        }

        let relays: Vec<_> = runs.iter().map(|_| Arc::new(RelayKillHandler::new())).collect();
        let snapshot = runs
            .iter()
            .zip(&relays)
            .map(|(rc, relay)| RunResult::running(rc.clone(), 0.0, 0.0, relay.clone()))
            .collect();
        let batch = Arc::new(RetryBatch {
            inner: self.inner.clone(),
            relays,
            observer,
            warned: self.warned.clone(),
            state: Mutex::new(RetryState {
                snapshot,
                finals: vec![None; runs.len()],
                remaining: runs.len(),
                on_complete: Some(on_complete),
                discarded: 0,
                wasted_runtime: 0.0,
                wasted_wallclock: 0.0,
            }),
            runs,
        });

        let positions = (0..batch.runs.len()).collect();
        batch.submit(positions, self.retries);
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    async fn wait_for_outstanding(&self) {
        self.inner.wait_for_outstanding().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::{
        core::{
            domain::tests::run_config,
            traits::evaluator::{MockEvaluator, evaluate},
        },
        stubs::evaluator::EvaluatorStub,
    };

    fn crashed(runs: &[RunConfig]) -> Vec<RunResult> {
        runs.iter()
            .map(|rc| RunResult::crashed(rc.clone(), 0.5, 0.5, "segfault"))
            .collect()
    }

    #[tokio::test]
    async fn test_always_crashing_run_is_submitted_budget_plus_one_times() {
        let mut inner = MockEvaluator::new();
        inner
            .expect_evaluate_runs_async()
            .times(4)
            .returning(|runs, on_complete, _| complete_detached(on_complete, Ok(crashed(&runs))));
        let evaluator = RetryCrashedEvaluator::new(Arc::new(inner), 3);

        let results = evaluate(&evaluator, vec![run_config("a", 1, 5.0)], None)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), RunStatus::Crashed);
        assert_eq!(results[0].additional_data(), "segfault");
    }

    #[tokio::test]
    async fn test_observer_never_sees_retried_crash() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut inner = MockEvaluator::new();
        inner.expect_evaluate_runs_async().times(2).returning({
            let calls = calls.clone();
            move |runs, on_complete, observer| {
                let results = if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    crashed(&runs)
                } else {
                    runs.iter()
                        .map(|rc| {
                            RunResult::new(rc.clone(), RunStatus::Sat, 1.0, 0.0, 0.0, 1, 1.0, "")
                                .unwrap()
                        })
                        .collect()
                };
                if let Some(observer) = observer {
                    observer(&results);
                }
                complete_detached(on_complete, Ok(results));
            }
        });
        let evaluator = RetryCrashedEvaluator::new(Arc::new(inner), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: RunObserver = {
            let seen = seen.clone();
            Arc::new(move |runs: &[RunResult]| seen.lock().push(runs[0].status()))
        };
        let results = evaluate(&evaluator, vec![run_config("a", 1, 5.0)], Some(observer))
            .await
            .unwrap();

        assert_eq!(results[0].status(), RunStatus::Sat);
        let seen = seen.lock();
        assert!(!seen.contains(&RunStatus::Crashed));
        assert_eq!(seen.last(), Some(&RunStatus::Sat));
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let runs = vec![
            run_config("a", 1, 5.0),
            run_config("b", 2, 5.0),
            run_config("c", 3, 5.0),
        ];
        let stub = EvaluatorStub::new(RunStatus::Sat, Duration::from_millis(10))
            .with_delay_for(runs[0].clone(), Duration::from_millis(80));
        let evaluator = RetryCrashedEvaluator::new(Arc::new(stub), 2);

        let results = evaluate(&evaluator, runs.clone(), None).await.unwrap();

        for (result, rc) in results.iter().zip(&runs) {
            assert_eq!(result.run_config(), rc);
            assert_eq!(result.status(), RunStatus::Sat);
        }
    }
}
