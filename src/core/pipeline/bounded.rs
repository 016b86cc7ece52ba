use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::core::{
    domain::{KillHandler, RunConfig, RunResult},
    errors::EvaluatorError,
    pipeline::{RelayKillHandler, complete_detached},
    traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
};

const MSG_INTERCEPTED: &str = "Kill intercepted by decorator before dispatch to evaluator";

/// Limits how many runs are in flight inside the inner evaluator, across
/// all batches submitted to this decorator.
#[derive(Debug)]
pub struct BoundedEvaluator {
    inner: Arc<dyn Evaluator>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BoundedEvaluator {
    pub fn new(inner: Arc<dyn Evaluator>, capacity: usize) -> Result<Self, EvaluatorError> {
        if capacity == 0 {
            return Err(EvaluatorError::InvalidConfiguration {
                msg: "bounded evaluator needs at least one permit".to_string(),
            });
        }
        Ok(Self {
            inner,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }
}

struct BoundedBatch {
    inner: Arc<dyn Evaluator>,
    permits: Arc<Semaphore>,
    capacity: usize,
    runs: Vec<RunConfig>,
    relays: Vec<Arc<RelayKillHandler>>,
    observer: Option<RunObserver>,
    state: Mutex<BoundedState>,
}

struct BoundedState {
    snapshot: Vec<RunResult>,
    finals: Vec<Option<RunResult>>,
    released: Vec<bool>,
    remaining: usize,
    outstanding: isize,
    on_complete: Option<CompletionHandler>,
}

impl BoundedState {
    fn fired(&self) -> bool {
        self.on_complete.is_none()
    }
}

impl BoundedBatch {
    /// Acquires at least one and at most `wanted` permits, waiting only for
    /// the first. The permits are forgotten and handed back one per finished
    /// run through [`Self::release`].
    async fn acquire_up_to(&self, wanted: usize) -> Result<usize, EvaluatorError> {
        let wanted = wanted.min(self.capacity);
        self.permits
            .acquire()
            .await
            .map_err(|e| EvaluatorError::Internal { msg: e.to_string() })?
            .forget();

        let mut acquired = 1;
        while acquired < wanted {
            match self.permits.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    acquired += 1;
                }
                Err(_) => break,
            }
        }
        Ok(acquired)
    }

    async fn dispatch(self: Arc<Self>) {
        let total = self.runs.len();
        let mut next = 0;

        while next < total {
            let acquired = match self.acquire_up_to(total - next).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            };
            let candidates = next..next + acquired;
            next += acquired;

            let mut positions = Vec::with_capacity(acquired);
            {
                let mut state = self.state.lock();
                if state.fired() {
                    self.permits.add_permits(acquired);
                    return;
                }
                let last = candidates.end - 1;
                for pos in candidates {
                    if pos != last && self.relays[pos].is_killed() {
                        tracing::debug!("Run {} killed before dispatch", self.runs[pos]);
                        let result =
                            RunResult::killed(self.runs[pos].clone(), 0.0, 0.0, MSG_INTERCEPTED);
                        state.snapshot[pos] = result.clone();
                        state.finals[pos] = Some(result);
                        state.released[pos] = true;
                        state.remaining -= 1;
                        self.permits.add_permits(1);
                    } else {
                        positions.push(pos);
                    }
                }
                state.outstanding += positions.len() as isize;
            }

            self.clone().submit(positions);
        }
    }

    fn submit(self: Arc<Self>, positions: Vec<usize>) {
        let runs = positions.iter().map(|&p| self.runs[p].clone()).collect();
        let positions = Arc::new(positions);

        let observer: RunObserver = {
            let batch = self.clone();
            let positions = positions.clone();
            Arc::new(move |results: &[RunResult]| batch.observe(&positions, results))
        };

        let batch = self.clone();
        self.inner.evaluate_runs_async(
            runs,
            Box::new(move |result| match result {
                Ok(results) => batch.complete(&positions, results),
                Err(e) => {
                    {
                        let mut state = batch.state.lock();
                        for &pos in positions.iter() {
                            batch.release(&mut state, pos);
                        }
                    }
                    batch.fail(e);
                }
            }),
            Some(observer),
        );
    }

    /// Hands back the permit held by `pos`, once.
    fn release(&self, state: &mut BoundedState, pos: usize) -> bool {
        if state.released[pos] {
            return true;
        }
        state.released[pos] = true;
        state.outstanding -= 1;
        self.permits.add_permits(1);
        if state.outstanding < 0 {
            tracing::error!(
                "Outstanding run count dropped to {} after releasing {}",
                state.outstanding,
                self.runs[pos]
            );
            return false;
        }
        true
    }

    fn observe(&self, positions: &[usize], results: &[RunResult]) {
        let mut state = self.state.lock();
        if state.fired() {
            return;
        }
        let mut consistent = true;
        let mut advanced = false;
        for (&pos, result) in positions.iter().zip(results) {
            if state.finals[pos].is_some() || is_stale(&state.snapshot[pos], result) {
                continue;
            }
            advanced = true;
            let relay = &self.relays[pos];
            if result.is_running() {
                relay.relay_to(result);
                state.snapshot[pos] = result.with_kill_handler(relay.clone());
            } else {
                state.snapshot[pos] = result.clone();
                consistent &= self.release(&mut state, pos);
            }
        }
        if !consistent {
            drop(state);
            self.fail(negative_outstanding());
            return;
        }
        if !advanced {
            return;
        }
        if let Some(observer) = &self.observer {
            observer(&state.snapshot);
        }
    }

    fn complete(&self, positions: &[usize], results: Vec<RunResult>) {
        let mut state = self.state.lock();
        if state.fired() {
            return;
        }
        let mut consistent = true;
        for (&pos, result) in positions.iter().zip(results) {
            consistent &= self.release(&mut state, pos);
            if state.finals[pos].is_none() {
                state.remaining -= 1;
            }
            state.snapshot[pos] = result.clone();
            state.finals[pos] = Some(result);
        }
        if !consistent {
            drop(state);
            self.fail(negative_outstanding());
            return;
        }
        if state.remaining > 0 {
            return;
        }

        if let Some(observer) = &self.observer {
            observer(&state.snapshot);
        }
        let results = state
            .finals
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| EvaluatorError::Internal {
                msg: "bounded batch finished without a result".to_string(),
            });
        if let Some(on_complete) = state.on_complete.take() {
            complete_detached(on_complete, results);
        }
    }

    fn fail(&self, error: EvaluatorError) {
        let on_complete = self.state.lock().on_complete.take();
        if let Some(on_complete) = on_complete {
            tracing::error!("Bounded batch failed: {}", error);
            complete_detached(on_complete, Err(error));
        }
    }
}

/// Terminal views never regress to live ones, and live views only move
/// forward in wall time.
fn is_stale(current: &RunResult, update: &RunResult) -> bool {
    if !current.is_running() {
        return true;
    }
    update.is_running() && update.wallclock_time() < current.wallclock_time()
}

fn negative_outstanding() -> EvaluatorError {
    EvaluatorError::Internal {
        msg: "more permits released than acquired".to_string(),
    }
}

#[async_trait::async_trait]
impl Evaluator for BoundedEvaluator {
    #[tracing::instrument(skip_all, fields(runs = runs.len(), capacity = self.capacity))]
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
        let batch = Arc::new(BoundedBatch {
            inner: self.inner.clone(),
            permits: self.permits.clone(),
            capacity: self.capacity,
            relays,
            observer,
            state: Mutex::new(BoundedState {
                snapshot,
                finals: vec![None; runs.len()],
                released: vec![false; runs.len()],
                remaining: runs.len(),
                outstanding: 0,
                on_complete: Some(on_complete),
            }),
            runs,
        });

        tokio::spawn(batch.dispatch());
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    async fn wait_for_outstanding(&self) {
        self.inner.wait_for_outstanding().await;
    }
}
