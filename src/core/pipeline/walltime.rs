use std::sync::Arc;

use crate::core::{
    domain::{RunConfig, RunResult, RunStatus},
    traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
};

const DEFAULT_SCALE: f64 = 0.95;
const DEFAULT_START_AT: f64 = 0.05;

/// Reports a fraction of the elapsed wall-clock time as runtime for runs
/// whose target never pushed a CPU time.
#[derive(Debug)]
pub struct WalltimeAsRuntimeEvaluator {
    inner: Arc<dyn Evaluator>,
    scale: f64,
    start_at: f64,
}

impl WalltimeAsRuntimeEvaluator {
    pub fn new(inner: Arc<dyn Evaluator>) -> Self {
        Self::with_scale(inner, DEFAULT_SCALE, DEFAULT_START_AT)
    }

    pub fn with_scale(inner: Arc<dyn Evaluator>, scale: f64, start_at: f64) -> Self {
        Self {
            inner,
            scale,
            start_at,
        }
    }
}

fn substitute(result: &RunResult, scale: f64, start_at: f64) -> RunResult {
    let eligible = matches!(result.status(), RunStatus::Running | RunStatus::Killed);
    if eligible && result.runtime() == 0.0 && result.wallclock_time() > start_at {
        result.with_runtime(result.wallclock_time() * scale)
    } else {
        result.clone()
    }
}

#[async_trait::async_trait]
impl Evaluator for WalltimeAsRuntimeEvaluator {
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    ) {
        let (scale, start_at) = (self.scale, self.start_at);

        let observer = observer.map(|observer| -> RunObserver {
            Arc::new(move |runs: &[RunResult]| {
                let snapshot: Vec<_> = runs
                    .iter()
                    .map(|r| substitute(r, scale, start_at))
                    .collect();
                observer(&snapshot);
            })
        });

        self.inner.evaluate_runs_async(
            runs,
            Box::new(move |result| {
                on_complete(result.map(|runs| {
                    runs.iter()
                        .map(|r| substitute(r, scale, start_at))
                        .collect()
                }))
            }),
            observer,
        );
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    async fn wait_for_outstanding(&self) {
        self.inner.wait_for_outstanding().await;
    }
}
