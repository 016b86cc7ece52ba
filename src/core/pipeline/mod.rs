//! Decorators wrapping an [`Evaluator`](crate::core::traits::evaluator::Evaluator).
//! Each one owns exactly one inner evaluator and exposes the same contract.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::core::{
    domain::{KillHandler, RunResult},
    errors::EvaluatorError,
    traits::evaluator::CompletionHandler,
};

pub mod bounded;
pub mod builder;
pub mod caching;
pub mod captime;
pub mod retry;
pub mod walltime;
pub mod zero_cutoff;

/// Kill handle given to callers in place of the inner one. Forwards kills
/// to whichever inner live result it was last pointed at, including ones
/// attached after the kill.
#[derive(Debug, Default)]
pub struct RelayKillHandler {
    killed: AtomicBool,
    target: Mutex<Option<RunResult>>,
}

impl RelayKillHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relay_to(&self, live: &RunResult) {
        if !live.is_running() {
            return;
        }
        *self.target.lock() = Some(live.clone());
        if self.is_killed() {
            live.kill();
        }
    }
}

impl KillHandler for RelayKillHandler {
    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let target = self.target.lock().clone();
        if let Some(target) = target {
            target.kill();
        }
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Delivers a completion on its own task so it never runs on the stack of
/// the evaluate call that caused it.
pub(crate) fn complete_detached(
    on_complete: CompletionHandler,
    result: Result<Vec<RunResult>, EvaluatorError>,
) {
    tokio::spawn(async move { on_complete(result) });
}
