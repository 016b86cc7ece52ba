use std::sync::Arc;

use dashmap::DashSet;

use crate::core::{
    domain::{RunConfig, RunResult, RunStatus},
    errors::EvaluatorError,
    traits::evaluator::{CompletionHandler, Evaluator, RunObserver},
};

const CAPTIME_MESSAGE: &str = "Run Exceeded Captime -- Treating as CRASHED";

/// Kills runs whose observed runtime passes `cutoff * factor` and reports
/// them as CRASHED instead of KILLED.
#[derive(Debug)]
pub struct CapTimeGuardEvaluator {
    inner: Arc<dyn Evaluator>,
    factor: f64,
}

impl CapTimeGuardEvaluator {
    pub fn new(inner: Arc<dyn Evaluator>, factor: f64) -> Result<Self, EvaluatorError> {
        if factor.is_nan() || factor <= 1.0 {
            return Err(EvaluatorError::InvalidConfiguration {
                msg: format!("cap time scaling factor must be greater than 1, got {}", factor),
            });
        }
        if factor < 2.0 {
            tracing::warn!(
                "Cap time scaling factor {} is below 2, runs may be killed before they can report a result",
                factor
            );
        }
        Ok(Self { inner, factor })
    }
}

#[async_trait::async_trait]
impl Evaluator for CapTimeGuardEvaluator {
    fn evaluate_runs_async(
        &self,
        runs: Vec<RunConfig>,
        on_complete: CompletionHandler,
        observer: Option<RunObserver>,
    ) {
        let killed: Arc<DashSet<RunConfig>> = Arc::new(DashSet::new());
        let factor = self.factor;

        let guard: RunObserver = {
            let killed = killed.clone();
            Arc::new(move |runs: &[RunResult]| {
                for run in runs.iter().filter(|r| r.is_running()) {
                    let rc = run.run_config();
                    let cap = rc.cutoff() * factor;
                    if run.runtime() > cap && killed.insert(rc.clone()) {
                        tracing::warn!(
                            "Killing run {} after {:.2}s, past its cap of {:.2}s",
                            rc,
                            run.runtime(),
                            cap
                        );
                        run.kill();
                    }
                }
                if let Some(observer) = &observer {
                    observer(runs);
                }
            })
        };

        self.inner.evaluate_runs_async(
            runs,
            Box::new(move |result| {
                on_complete(result.map(|runs| {
                    runs.into_iter()
                        .map(|run| reclassify(run, &killed))
                        .collect()
                }))
            }),
            Some(guard),
        );
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    async fn wait_for_outstanding(&self) {
        self.inner.wait_for_outstanding().await;
    }
}

fn reclassify(run: RunResult, killed: &DashSet<RunConfig>) -> RunResult {
    if run.status() != RunStatus::Killed || !killed.contains(run.run_config()) {
        return run;
    }
    let data = if run.additional_data().is_empty() {
        CAPTIME_MESSAGE.to_string()
    } else {
        format!("{}; {}", CAPTIME_MESSAGE, run.additional_data())
    };
    run.with_status(RunStatus::Crashed, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{KillHandler, StatusKillHandler, tests::run_config},
        pipeline::complete_detached,
        traits::evaluator::{MockEvaluator, evaluate},
    };

    /// Reports one live observation with `runtime`, then completes KILLED
    /// if that observation was killed and SAT otherwise.
    fn observing_inner(runtime: f64, externally_killed: bool) -> MockEvaluator {
        let mut inner = MockEvaluator::new();
        inner
            .expect_evaluate_runs_async()
            .times(1)
            .returning(move |runs, on_complete, observer| {
                let rc = runs[0].clone();
                let handler = Arc::new(StatusKillHandler::new());
                if let Some(observer) = observer {
                    observer(&[RunResult::running(rc.clone(), runtime, runtime, handler.clone())]);
                }
                let result = if handler.is_killed() || externally_killed {
                    RunResult::killed(rc, runtime, runtime, "Killed Manually")
                } else {
                    RunResult::new(rc, RunStatus::Sat, runtime, 0.0, 0.0, 1, runtime, "").unwrap()
                };
                complete_detached(on_complete, Ok(vec![result]));
            });
        inner
    }

    #[test]
    fn test_rejects_factor_not_above_one() {
        for factor in [1.0, 0.5, f64::NAN] {
            let result = CapTimeGuardEvaluator::new(Arc::new(MockEvaluator::new()), factor);
            assert!(matches!(
                result,
                Err(EvaluatorError::InvalidConfiguration { .. })
            ));
        }
        assert!(CapTimeGuardEvaluator::new(Arc::new(MockEvaluator::new()), 1.5).is_ok());
    }

    #[tokio::test]
    async fn test_run_past_cap_is_killed_and_crashed() {
        let evaluator = CapTimeGuardEvaluator::new(Arc::new(observing_inner(2.5, false)), 2.0).unwrap();

        let results = evaluate(&evaluator, vec![run_config("a", 1, 1.0)], None)
            .await
            .unwrap();

        assert_eq!(results[0].status(), RunStatus::Crashed);
        assert!(results[0].additional_data().contains("Captime"));
        assert!(results[0].additional_data().contains("Killed Manually"));
    }

    #[tokio::test]
    async fn test_run_within_cap_is_untouched() {
        let evaluator = CapTimeGuardEvaluator::new(Arc::new(observing_inner(1.5, false)), 2.0).unwrap();

        let results = evaluate(&evaluator, vec![run_config("a", 1, 1.0)], None)
            .await
            .unwrap();

        assert_eq!(results[0].status(), RunStatus::Sat);
    }

    #[tokio::test]
    async fn test_external_kill_stays_killed() {
        let evaluator = CapTimeGuardEvaluator::new(Arc::new(observing_inner(0.5, true)), 2.0).unwrap();

        let results = evaluate(&evaluator, vec![run_config("a", 1, 1.0)], None)
            .await
            .unwrap();

        assert_eq!(results[0].status(), RunStatus::Killed);
    }
}
