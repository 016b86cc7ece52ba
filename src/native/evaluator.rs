use std::sync::Arc;

use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    config::CommandLineOptions,
    core::{
        domain::{KillHandler, RunConfig, RunResult, StatusKillHandler},
        errors::EvaluatorError,
        traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
    },
    native::{
        run::{ProcessSupervisor, RunUpdate},
        tokens::TokenPool,
    },
};

/// Evaluates runs by executing the target algorithm as a local process.
#[derive(Debug, Clone)]
pub struct CommandLineEvaluator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    supervisor: ProcessSupervisor,
    shutdown: CancellationToken,
    outstanding: watch::Sender<usize>,
}

impl CommandLineEvaluator {
    pub fn new(options: CommandLineOptions) -> Result<Self, EvaluatorError> {
        Self::with_shutdown(options, CancellationToken::new())
    }

    /// Shares an existing shutdown token, cancelling it has the same effect
    /// as calling [`Evaluator::shutdown`].
    pub fn with_shutdown(
        options: CommandLineOptions,
        shutdown: CancellationToken,
    ) -> Result<Self, EvaluatorError> {
        options.validate()?;
        let tokens = TokenPool::new(options.cores);
        let supervisor = ProcessSupervisor::new(Arc::new(options), tokens, shutdown.clone())?;
        let (outstanding, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(Inner {
                supervisor,
                shutdown,
                outstanding,
            }),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

#[async_trait::async_trait]
impl Evaluator for CommandLineEvaluator {
    #[tracing::instrument(skip_all, fields(runs = runs.len()))]
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    ) {
        let inner = self.inner.clone();
        let guard = BatchGuard::enter(&inner.outstanding);
        tokio::spawn(async move {
            let result = inner.run_batch(runs, observer).await;
            on_complete(result);
            drop(guard);
        });
    }

    fn shutdown(&self) {
        tracing::info!("Shutting down command line evaluator");
        self.inner.shutdown.cancel();
    }

    async fn wait_for_outstanding(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Inner {
    async fn run_batch(
        &self,
        runs: Vec<RunConfig>,
        observer: Option<RunObserver>,
    ) -> Result<Vec<RunResult>, EvaluatorError> {
        if runs.is_empty() {
            return Ok(Vec::new());
        }

        let kill_handlers: Vec<Arc<StatusKillHandler>> = runs
            .iter()
            .map(|_| Arc::new(StatusKillHandler::new()))
            .collect();
        let board = Arc::new(BatchBoard::new(&runs, &kill_handlers, observer));
        let mut futures = self.create_run_futures(&runs, &kill_handlers, &board);

        let mut results: Vec<Option<RunResult>> = vec![None; runs.len()];
        let mut failure = None;
        while let Some((idx, outcome)) = futures.next().await {
            match outcome {
                Ok(result) => results[idx] = Some(result),
                Err(e) if failure.is_none() => {
                    tracing::error!("Run {} failed, killing the rest of the batch: {}", runs[idx], e);
                    kill_handlers.iter().for_each(|handler| handler.kill());
                    failure = Some(e);
                }
                Err(e) => tracing::debug!("Additional failure in batch: {}", e),
            }
        }
        board.close();

        if let Some(e) = failure {
            return Err(e);
        }
        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| EvaluatorError::Internal {
                msg: "run finished without a result".to_string(),
            })
    }

    /// One future per run, yielding the run index with its outcome.
    fn create_run_futures(
        &self,
        runs: &[RunConfig],
        kill_handlers: &[Arc<StatusKillHandler>],
        board: &Arc<BatchBoard>,
    ) -> FuturesUnordered<
        impl std::future::Future<Output = (usize, Result<RunResult, EvaluatorError>)>,
    > {
        let futures = FuturesUnordered::new();

        for (idx, (rc, kill_handler)) in runs.iter().zip(kill_handlers).enumerate() {
            let supervisor = self.supervisor.clone();
            let rc = rc.clone();
            let kill_handler: Arc<dyn KillHandler> = kill_handler.clone();
            let update: RunUpdate = {
                let board = board.clone();
                Arc::new(move |result| board.update(idx, result))
            };

            futures.push(async move { (idx, supervisor.run(rc, kill_handler, update).await) });
        }

        futures
    }
}

/// Latest snapshot of every run in a batch, forwarded to the batch observer.
struct BatchBoard {
    state: Mutex<BoardState>,
    observer: Option<RunObserver>,
}

struct BoardState {
    snapshot: Vec<RunResult>,
    closed: bool,
}

impl BatchBoard {
    fn new(
        runs: &[RunConfig],
        kill_handlers: &[Arc<StatusKillHandler>],
        observer: Option<RunObserver>,
    ) -> Self {
        let snapshot = runs
            .iter()
            .zip(kill_handlers)
            .map(|(rc, handler)| RunResult::running(rc.clone(), 0.0, 0.0, handler.clone()))
            .collect();
        Self {
            state: Mutex::new(BoardState {
                snapshot,
                closed: false,
            }),
            observer,
        }
    }

    fn update(&self, idx: usize, result: RunResult) {
        let Some(observer) = &self.observer else {
            return;
        };
        let mut state = self.state.lock();
        // a terminal entry is never replaced by a later live one
        if state.closed || !state.snapshot[idx].is_running() {
            return;
        }
        state.snapshot[idx] = result;
        observer(&state.snapshot);
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Counts a batch as outstanding for as long as it is alive.
struct BatchGuard {
    outstanding: watch::Sender<usize>,
}

impl BatchGuard {
    fn enter(outstanding: &watch::Sender<usize>) -> Self {
        outstanding.send_modify(|count| *count += 1);
        Self {
            outstanding: outstanding.clone(),
        }
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{
        constants::MSG_SHUTDOWN,
        core::{
            domain::{ExecutionConfig, RunStatus, tests::run_config_with},
            traits::evaluator::evaluate,
        },
        native::run::tests::{fast_options, script_run},
    };

    fn result_line(seed: i64) -> String {
        format!("echo 'Result of algorithm run: SAT,0.1,0,0,{}'", seed)
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let runs = vec![
            script_run(dir.path(), &format!("sleep 0.6\n{}", result_line(1)), 5.0),
            script_run(dir.path(), &format!("sleep 0.1\n{}", result_line(2)), 5.0),
            script_run(dir.path(), &format!("sleep 0.3\n{}", result_line(3)), 5.0),
        ];
        let evaluator = CommandLineEvaluator::new(fast_options()).unwrap();

        let results = evaluate(&evaluator, runs.clone(), None).await.unwrap();

        assert_eq!(results.len(), 3);
        for (i, (result, rc)) in results.iter().zip(&runs).enumerate() {
            assert_eq!(result.run_config(), rc);
            assert_eq!(result.result_seed(), i as i64 + 1);
        }
    }

    #[tokio::test]
    async fn test_observer_sees_full_batch_before_completion() {
        let dir = tempfile::tempdir().unwrap();
        let runs = vec![
            script_run(dir.path(), &format!("sleep 0.3\n{}", result_line(1)), 5.0),
            script_run(dir.path(), &format!("sleep 0.2\n{}", result_line(2)), 5.0),
        ];
        let evaluator = CommandLineEvaluator::new(fast_options()).unwrap();

        let completed = Arc::new(AtomicBool::new(false));
        let late_notifications = Arc::new(AtomicBool::new(false));
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let observer: RunObserver = {
            let completed = completed.clone();
            let late = late_notifications.clone();
            let snapshots = snapshots.clone();
            Arc::new(move |runs: &[RunResult]| {
                if completed.load(Ordering::SeqCst) {
                    late.store(true, Ordering::SeqCst);
                }
                snapshots.lock().push(runs.to_vec());
            })
        };

        let results = evaluate(&evaluator, runs.clone(), Some(observer))
            .await
            .unwrap();
        completed.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(results.len(), 2);
        assert!(!late_notifications.load(Ordering::SeqCst));
        let snapshots = snapshots.lock();
        assert!(!snapshots.is_empty());
        for snapshot in snapshots.iter() {
            assert_eq!(snapshot.len(), 2);
            assert_eq!(snapshot[0].run_config(), &runs[0]);
            assert_eq!(snapshot[1].run_config(), &runs[1]);
        }
        assert!(snapshots.last().unwrap().iter().all(|r| !r.is_running()));
    }

    #[tokio::test]
    async fn test_infrastructure_failure_fails_batch() {
        let dir = tempfile::tempdir().unwrap();
        let runs = vec![
            script_run(dir.path(), "sleep 30", 5.0),
            run_config_with(
                "missing",
                1,
                5.0,
                ExecutionConfig::new("true", "/nonexistent/algorunner", false, 5.0),
            ),
        ];
        let evaluator = CommandLineEvaluator::new(fast_options()).unwrap();

        let started = Instant::now();
        let result = evaluate(&evaluator, runs, None).await;

        assert!(matches!(
            result,
            Err(EvaluatorError::MissingExecutionDirectory { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cores_bound_concurrent_processes() {
        let dir = tempfile::tempdir().unwrap();
        let runs = vec![
            script_run(dir.path(), &format!("sleep 0.5\n{}", result_line(1)), 5.0),
            script_run(dir.path(), &format!("sleep 0.5\n{}", result_line(2)), 5.0),
        ];
        let evaluator = CommandLineEvaluator::new(CommandLineOptions {
            cores: 1,
            ..fast_options()
        })
        .unwrap();

        let started = Instant::now();
        let results = evaluate(&evaluator, runs, None).await.unwrap();

        assert!(results.iter().all(|r| r.status() == RunStatus::Sat));
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_shutdown_kills_and_refuses_runs() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = CommandLineEvaluator::new(fast_options()).unwrap();

        let running = tokio::spawn({
            let evaluator = evaluator.clone();
            let runs = vec![script_run(dir.path(), "sleep 30", 5.0)];
            async move { evaluate(&evaluator, runs, None).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        evaluator.shutdown();

        let results = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(results[0].status(), RunStatus::Killed);

        let results = evaluate(
            &evaluator,
            vec![script_run(dir.path(), &result_line(1), 5.0)],
            None,
        )
        .await
        .unwrap();
        assert_eq!(results[0].status(), RunStatus::Killed);
        assert_eq!(results[0].additional_data(), MSG_SHUTDOWN);

        tokio::time::timeout(Duration::from_secs(1), evaluator.wait_for_outstanding())
            .await
            .unwrap();
    }
}
