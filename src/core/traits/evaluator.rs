use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::core::{
    domain::{RunConfig, RunResult},
    errors::EvaluatorError,
};

/// Receives a full, ordered snapshot of a batch whenever some run changes.
pub type RunObserver = Arc<dyn Fn(&[RunResult]) + Send + Sync>;

/// Receives the outcome of a batch exactly once.
pub type CompletionHandler = Box<dyn FnOnce(Result<Vec<RunResult>, EvaluatorError>) + Send>;

#[mockall::automock]
#[async_trait::async_trait]
pub trait Evaluator: std::fmt::Debug + Send + Sync {
    /// Submits a batch and returns without waiting for the runs. The observer
    /// may fire any number of times before `on_complete`, never after it.
    /// Results are delivered in submission order.
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    );

    /// Refuses further work and terminates outstanding runs.
    fn shutdown(&self);

    async fn wait_for_outstanding(&self);
}

/// Submits a batch and waits for its completion.
#[tracing::instrument(skip(evaluator, runs, observer), fields(runs = runs.len()))]
pub async fn evaluate(
    evaluator: &dyn Evaluator,
    runs: Vec<RunConfig>,
    observer: Option<RunObserver>,
) -> Result<Vec<RunResult>, EvaluatorError> {
    if runs.is_empty() {
        return Ok(Vec::new());
    }

    let (tx, rx) = oneshot::channel();
    evaluator.evaluate_runs_async(
        runs,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        observer,
    );

    rx.await.map_err(|_| EvaluatorError::Internal {
        msg: "evaluator dropped the completion handler".to_string(),
    })?
}

/// Blocking variant of [`evaluate`] for threads outside the runtime.
pub fn evaluate_blocking(
    handle: &Handle,
    evaluator: &dyn Evaluator,
    runs: Vec<RunConfig>,
    observer: Option<RunObserver>,
) -> Result<Vec<RunResult>, EvaluatorError> {
    if runs.is_empty() {
        return Ok(Vec::new());
    }

    let (tx, rx) = oneshot::channel();
    {
        let _guard = handle.enter();
        evaluator.evaluate_runs_async(
            runs,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            observer,
        );
    }

    rx.blocking_recv().map_err(|_| EvaluatorError::Internal {
        msg: "evaluator dropped the completion handler".to_string(),
    })?
}
