use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    constants::MSG_KILLED_MANUALLY,
    core::{
        domain::{KillHandler, RunConfig, RunResult, RunStatus, StatusKillHandler},
        errors::EvaluatorError,
        traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
    },
};

const TICK: Duration = Duration::from_millis(10);

/// In-memory evaluator finishing every run with a fixed status after a
/// delay. Records how it was used.
#[derive(Debug, Clone)]
pub struct EvaluatorStub {
    status: RunStatus,
    delay: Duration,
    delays: HashMap<RunConfig, Duration>,
    stats: Arc<StubStats>,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct StubStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    total_submissions: AtomicUsize,
    submissions: DashMap<RunConfig, usize>,
    outstanding: watch::Sender<usize>,
}

impl EvaluatorStub {
    pub fn new(status: RunStatus, delay: Duration) -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            status,
            delay,
            delays: HashMap::new(),
            stats: Arc::new(StubStats {
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                total_submissions: AtomicUsize::new(0),
                submissions: DashMap::new(),
                outstanding,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_delay_for(mut self, rc: RunConfig, delay: Duration) -> Self {
        self.delays.insert(rc, delay);
        self
    }

    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn submissions(&self, rc: &RunConfig) -> usize {
        self.stats.submissions.get(rc).map(|n| *n).unwrap_or(0)
    }

    pub fn total_submissions(&self) -> usize {
        self.stats.total_submissions.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        idx: usize,
        rc: RunConfig,
        kill_handler: Arc<StatusKillHandler>,
        board: Arc<Mutex<Board>>,
    ) -> Result<RunResult, EvaluatorError> {
        let delay = self.delays.get(&rc).copied().unwrap_or(self.delay);
        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats
            .peak_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let started = Instant::now();
        let killed = loop {
            if kill_handler.is_killed() || self.shutdown.is_cancelled() {
                break true;
            }
            let elapsed = started.elapsed();
            if elapsed >= delay {
                break false;
            }
            let secs = elapsed.as_secs_f64();
            board.lock().update(
                idx,
                RunResult::running(rc.clone(), secs, secs, kill_handler.clone()),
            );
            tokio::time::sleep(TICK.min(delay - elapsed)).await;
        };

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        let wallclock = started.elapsed().as_secs_f64();
        let result = if killed {
            RunResult::killed(rc, wallclock, wallclock, MSG_KILLED_MANUALLY)
        } else {
            let seed = rc.seed();
            RunResult::new(
                rc,
                self.status,
                delay.as_secs_f64(),
                0.0,
                0.0,
                seed,
                wallclock,
                "",
            )
            .map_err(|e| EvaluatorError::Internal { msg: e.to_string() })?
        };
        board.lock().update(idx, result.clone());
        Ok(result)
    }
}

struct Board {
    snapshot: Vec<RunResult>,
    observer: Option<RunObserver>,
}

impl Board {
    fn update(&mut self, idx: usize, result: RunResult) {
        if !self.snapshot[idx].is_running() {
            return;
        }
        self.snapshot[idx] = result;
        if let Some(observer) = &self.observer {
            observer(&self.snapshot);
        }
    }
}

#[async_trait::async_trait]
impl Evaluator for EvaluatorStub {
    #[tracing::instrument(skip_all, fields(runs = runs.len()))]
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    ) {
        for rc in &runs {
            *self.stats.submissions.entry(rc.clone()).or_insert(0) += 1;
        }
        self.stats
            .total_submissions
            .fetch_add(runs.len(), Ordering::SeqCst);
        self.stats.outstanding.send_modify(|count| *count += 1);

        let stub = self.clone();
        tokio::spawn(async move {
            let kill_handlers: Vec<_> = runs
                .iter()
                .map(|_| Arc::new(StatusKillHandler::new()))
                .collect();
            let board = Arc::new(Mutex::new(Board {
                snapshot: runs
                    .iter()
                    .zip(&kill_handlers)
                    .map(|(rc, handler)| RunResult::running(rc.clone(), 0.0, 0.0, handler.clone()))
                    .collect(),
                observer,
            }));

            let outcomes = join_all(runs.into_iter().zip(kill_handlers).enumerate().map(
                |(idx, (rc, handler))| stub.run(idx, rc, handler, board.clone()),
            ))
            .await;
            board.lock().observer = None;
            tracing::debug!("Stub batch finished");

            on_complete(outcomes.into_iter().collect());
            stub.stats
                .outstanding
                .send_modify(|count| *count = count.saturating_sub(1));
        });
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn wait_for_outstanding(&self) {
        let mut rx = self.stats.outstanding.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{domain::tests::run_config, traits::evaluator::evaluate};

    #[tokio::test]
    async fn test_stub_reports_status_and_usage() {
        let stub = EvaluatorStub::new(RunStatus::Unsat, Duration::from_millis(30));
        let runs = vec![run_config("a", 1, 5.0), run_config("b", 2, 5.0)];

        let results = evaluate(&stub, runs.clone(), None).await.unwrap();

        assert!(results.iter().all(|r| r.status() == RunStatus::Unsat));
        assert_eq!(stub.submissions(&runs[0]), 1);
        assert_eq!(stub.total_submissions(), 2);
        assert_eq!(stub.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_stub_honors_kill() {
        let stub = EvaluatorStub::new(RunStatus::Sat, Duration::from_secs(30));
        let observer: RunObserver = Arc::new(|runs: &[RunResult]| runs[0].kill());

        let results = tokio::time::timeout(
            Duration::from_secs(2),
            evaluate(&stub, vec![run_config("a", 1, 5.0)], Some(observer)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(results[0].status(), RunStatus::Killed);
    }
}
