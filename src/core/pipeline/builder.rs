use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::{CommandLineOptions, PipelineConfig},
    core::{
        errors::EvaluatorError,
        pipeline::{
            bounded::BoundedEvaluator, caching::CachingEvaluator, captime::CapTimeGuardEvaluator,
            retry::RetryCrashedEvaluator, walltime::WalltimeAsRuntimeEvaluator,
            zero_cutoff::CompleteZeroCutoffEvaluator,
        },
        traits::evaluator::Evaluator,
    },
    native::evaluator::CommandLineEvaluator,
};

/// Assembles the decorator stack selected by a [`PipelineConfig`].
///
/// From the outside in: cap-time guard, caching, zero-cutoff completion,
/// bounding, crash retry, wall-time-as-runtime and finally the evaluator
/// doing the work. The cap-time guard sits outermost so a run it kills is
/// reported once as CRASHED and never retried or cached.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    options: CommandLineOptions,
    shutdown: CancellationToken,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig, options: CommandLineOptions) -> Self {
        Self {
            config,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(self, shutdown: CancellationToken) -> Self {
        Self { shutdown, ..self }
    }

    /// Stack on top of a [`CommandLineEvaluator`].
    pub fn build(&self) -> Result<Arc<dyn Evaluator>, EvaluatorError> {
        let evaluator =
            CommandLineEvaluator::with_shutdown(self.options.clone(), self.shutdown.clone())?;
        self.wrap(Arc::new(evaluator))
    }

    /// Stack on top of an arbitrary evaluator.
    pub fn wrap(&self, inner: Arc<dyn Evaluator>) -> Result<Arc<dyn Evaluator>, EvaluatorError> {
        self.config.validate()?;
        let config = &self.config;
        let mut layers = Vec::new();
        let mut evaluator = inner;

        if config.walltime_as_runtime {
            evaluator = Arc::new(WalltimeAsRuntimeEvaluator::new(evaluator));
            layers.push("walltime");
        }
        if config.retry_crashed > 0 {
            evaluator = Arc::new(RetryCrashedEvaluator::new(evaluator, config.retry_crashed));
            layers.push("retry");
        }
        if let Some(bound) = config.bound {
            evaluator = Arc::new(BoundedEvaluator::new(evaluator, bound)?);
            layers.push("bounded");
        }
        if config.complete_zero_cutoff {
            evaluator = Arc::new(CompleteZeroCutoffEvaluator::new(evaluator));
            layers.push("zero-cutoff");
        }
        if config.cache {
            evaluator = Arc::new(CachingEvaluator::new(evaluator));
            layers.push("caching");
        }
        if let Some(factor) = config.cap_scaling_factor {
            evaluator = Arc::new(CapTimeGuardEvaluator::new(evaluator, factor)?);
            layers.push("captime");
        }

        tracing::info!("Evaluator pipeline (inner to outer): {}", layers.join(" -> "));
        Ok(evaluator)
    }
}
