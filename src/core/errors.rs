use std::path::PathBuf;

/// Failure of a whole batch. Per-run problems are reported as a
/// [`RunStatus`](crate::core::domain::RunStatus) instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvaluatorError {
    #[error("execution directory {} does not exist", path.display())]
    MissingExecutionDirectory { path: PathBuf },

    #[error("execution directory {} is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("failed to spawn target algorithm ({call}): {msg}")]
    Spawn { call: String, msg: String },

    #[error("run configuration submitted twice in one batch: {run}")]
    DuplicateRunConfig { run: String },

    #[error("invalid configuration: {msg}")]
    InvalidConfiguration { msg: String },

    #[error("internal error: {msg}")]
    Internal { msg: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidRunResult {
    #[error("runtime must be a non-negative number, got {0}")]
    Runtime(f64),

    #[error("runlength must be non-negative or -1, got {0}")]
    Runlength(f64),

    #[error("quality must be a number")]
    Quality,

    #[error("wallclock time must be non-negative, got {0}")]
    Wallclock(f64),

    #[error("cutoff time must be a non-negative number, got {0}")]
    Cutoff(f64),

    #[error("a terminal result cannot have status RUNNING")]
    RunningStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run status: {0}")]
pub struct UnknownRunStatus(pub String);
