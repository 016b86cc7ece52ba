use std::sync::Arc;

use crate::core::{
    domain::{RunConfig, RunResult},
    errors::EvaluatorError,
    pipeline::complete_detached,
    traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
};

const ZERO_CUTOFF_MESSAGE: &str = "Processed by zero-cutoff completion";

/// Completes runs with a cutoff of zero as TIMEOUT without running them.
#[derive(Debug)]
pub struct CompleteZeroCutoffEvaluator {
    inner: Arc<dyn Evaluator>,
}

impl CompleteZeroCutoffEvaluator {
    pub fn new(inner: Arc<dyn Evaluator>) -> Self {
        Self { inner }
    }
}

enum Slot {
    Fixed(RunResult),
    Forwarded(usize),
}

/// Where each submitted run's result comes from.
struct Layout {
    slots: Vec<Slot>,
}

impl Layout {
    fn assemble(&self, forwarded: &[RunResult]) -> Option<Vec<RunResult>> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Fixed(result) => Some(result.clone()),
                Slot::Forwarded(j) => forwarded.get(*j).cloned(),
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Evaluator for CompleteZeroCutoffEvaluator {
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    ) {
        let mut forwarded = Vec::new();
        let slots = runs
            .into_iter()
            .map(|rc| {
                if rc.cutoff() <= 0.0 {
                    Slot::Fixed(RunResult::timeout(rc, 0.0, 0.0, ZERO_CUTOFF_MESSAGE))
                } else {
                    forwarded.push(rc);
                    Slot::Forwarded(forwarded.len() - 1)
                }
            })
            .collect();
        let layout = Arc::new(Layout { slots });

        if forwarded.is_empty() {
            tracing::debug!("All runs have zero cutoff, completing without dispatch");
            complete_detached(on_complete, Ok(layout.assemble(&[]).unwrap_or_default()));
            return;
        }

        let observer = observer.map(|observer| -> RunObserver {
            let layout = layout.clone();
            Arc::new(move |runs: &[RunResult]| {
                if let Some(snapshot) = layout.assemble(runs) {
                    observer(&snapshot);
                }
            })
        });

        self.inner.evaluate_runs_async(
            forwarded,
            Box::new(move |result| {
                let result = result.and_then(|runs| {
                    layout
                        .assemble(&runs)
                        .ok_or_else(|| EvaluatorError::Internal {
                            msg: "inner evaluator returned fewer results than requested"
                                .to_string(),
                        })
                });
                on_complete(result);
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
