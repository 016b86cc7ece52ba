use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use itertools::Itertools;

use crate::core::errors::{InvalidRunResult, UnknownRunStatus};

#[derive(Clone, Debug)]
pub struct ProblemInstance {
    pub name: String,
    pub id: u32,
    pub instance_specific_info: String,
    pub features: Vec<f64>,
}

impl ProblemInstance {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
            instance_specific_info: "0".to_string(),
            features: Vec::new(),
        }
    }

    pub fn with_specific_info(self, info: impl Into<String>) -> Self {
        Self {
            instance_specific_info: info.into(),
            ..self
        }
    }

    pub fn with_features(self, features: Vec<f64>) -> Self {
        Self { features, ..self }
    }
}

impl PartialEq for ProblemInstance {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.id == other.id
            && self.instance_specific_info == other.instance_specific_info
            && self.features.len() == other.features.len()
            && self
                .features
                .iter()
                .zip(&other.features)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for ProblemInstance {}

impl Hash for ProblemInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.id.hash(state);
        self.instance_specific_info.hash(state);
        for feature in &self.features {
            feature.to_bits().hash(state);
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProblemInstanceSeedPair {
    pub instance: Arc<ProblemInstance>,
    pub seed: i64,
}

impl ProblemInstanceSeedPair {
    pub fn new(instance: Arc<ProblemInstance>, seed: i64) -> Self {
        Self { instance, seed }
    }
}

/// Parameter settings produced by a configuration space. Only the active
/// parameters are stored, in the order they are passed to the target.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ParameterConfiguration {
    active: Vec<(String, String)>,
}

impl ParameterConfiguration {
    pub fn new<I, K, V>(active: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            active: active
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn active_parameters(&self) -> impl Iterator<Item = (&str, &str)> {
        self.active.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ParameterConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.active
                .iter()
                .map(|(k, v)| format!("-{} '{}'", k, v))
                .join(" ")
        )
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    pub executable: String,
    pub execution_dir: PathBuf,
    pub deterministic: bool,
    pub max_cutoff: f64,
}

impl ExecutionConfig {
    pub fn new(
        executable: impl Into<String>,
        execution_dir: impl Into<PathBuf>,
        deterministic: bool,
        max_cutoff: f64,
    ) -> Self {
        Self {
            executable: executable.into(),
            execution_dir: execution_dir.into(),
            deterministic,
            max_cutoff,
        }
    }
}

impl PartialEq for ExecutionConfig {
    fn eq(&self, other: &Self) -> bool {
        self.executable == other.executable
            && self.execution_dir == other.execution_dir
            && self.deterministic == other.deterministic
            && self.max_cutoff.to_bits() == other.max_cutoff.to_bits()
    }
}

impl Eq for ExecutionConfig {}

impl Hash for ExecutionConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.executable.hash(state);
        self.execution_dir.hash(state);
        self.deterministic.hash(state);
        self.max_cutoff.to_bits().hash(state);
    }
}

/// Identifies one requested execution of the target algorithm. Equal run
/// configurations are interchangeable and serve as the cache key.
#[derive(Clone, Debug)]
pub struct RunConfig {
    instance_seed: ProblemInstanceSeedPair,
    cutoff: f64,
    parameters: Arc<ParameterConfiguration>,
    execution: Arc<ExecutionConfig>,
}

impl RunConfig {
    pub fn new(
        instance_seed: ProblemInstanceSeedPair,
        cutoff: f64,
        parameters: Arc<ParameterConfiguration>,
        execution: Arc<ExecutionConfig>,
    ) -> Result<Self, InvalidRunResult> {
        if cutoff.is_nan() || cutoff < 0.0 {
            return Err(InvalidRunResult::Cutoff(cutoff));
        }
        Ok(Self {
            instance_seed,
            cutoff,
            parameters,
            execution,
        })
    }

    pub fn instance_seed(&self) -> &ProblemInstanceSeedPair {
        &self.instance_seed
    }

    pub fn instance(&self) -> &ProblemInstance {
        &self.instance_seed.instance
    }

    pub fn seed(&self) -> i64 {
        self.instance_seed.seed
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn parameters(&self) -> &ParameterConfiguration {
        &self.parameters
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }
}

impl PartialEq for RunConfig {
    fn eq(&self, other: &Self) -> bool {
        self.instance_seed == other.instance_seed
            && self.cutoff.to_bits() == other.cutoff.to_bits()
            && self.parameters == other.parameters
            && self.execution == other.execution
    }
}

impl Eq for RunConfig {}

impl Hash for RunConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_seed.hash(state);
        self.cutoff.to_bits().hash(state);
        self.parameters.hash(state);
        self.execution.hash(state);
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<instance={}, seed={}, cutoff={}, params=[{}]>",
            self.instance().name,
            self.seed(),
            self.cutoff,
            self.parameters
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Running,
    Sat,
    Unsat,
    Timeout,
    Crashed,
    Abort,
    Killed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 7] = [
        RunStatus::Running,
        RunStatus::Sat,
        RunStatus::Unsat,
        RunStatus::Timeout,
        RunStatus::Crashed,
        RunStatus::Abort,
        RunStatus::Killed,
    ];

    /// Whether the run answered the instance (SAT or UNSAT).
    pub fn is_decided(self) -> bool {
        matches!(self, RunStatus::Sat | RunStatus::Unsat)
    }

    pub fn code(self) -> i32 {
        match self {
            RunStatus::Timeout => 0,
            RunStatus::Sat => 1,
            RunStatus::Unsat => 2,
            RunStatus::Crashed => -1,
            RunStatus::Abort => -2,
            RunStatus::Killed => -3,
            RunStatus::Running => i32::MIN,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Whether a target algorithm may report this status on its own.
    pub fn is_permitted_by_wrappers(self) -> bool {
        !matches!(self, RunStatus::Running | RunStatus::Killed)
    }

    /// Whether the reported runtime is only a lower bound on the true one.
    pub fn is_successful_and_censored(self) -> bool {
        matches!(self, RunStatus::Timeout | RunStatus::Killed)
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            RunStatus::Running => &["RUNNING"],
            RunStatus::Sat => &["SAT", "SATISFIABLE", "SUCCESS"],
            RunStatus::Unsat => &["UNSAT", "UNSATISFIABLE"],
            RunStatus::Timeout => &["TIMEOUT"],
            RunStatus::Crashed => &["CRASHED"],
            RunStatus::Abort => &["ABORT"],
            RunStatus::Killed => &["KILLED"],
        }
    }
}

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| {
                status
                    .aliases()
                    .iter()
                    .any(|alias| alias.eq_ignore_ascii_case(key))
            })
            .ok_or_else(|| UnknownRunStatus(key.to_string()))
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.aliases()[0])
    }
}

/// Cooperative cancellation of one in-flight run. `kill` must be idempotent
/// and `is_killed` must never block.
pub trait KillHandler: fmt::Debug + Send + Sync {
    fn kill(&self);
    fn is_killed(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct StatusKillHandler {
    killed: AtomicBool,
}

impl StatusKillHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KillHandler for StatusKillHandler {
    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

/// Outcome snapshot of a run. A result with status RUNNING is a live view
/// carrying a kill handler, every other status is terminal.
#[derive(Clone, Debug)]
pub struct RunResult {
    run_config: RunConfig,
    status: RunStatus,
    runtime: f64,
    runlength: f64,
    quality: f64,
    result_seed: i64,
    wallclock_time: f64,
    additional_data: String,
    raw_result_line: String,
    kill_handler: Option<Arc<dyn KillHandler>>,
}

impl RunResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_config: RunConfig,
        status: RunStatus,
        runtime: f64,
        runlength: f64,
        quality: f64,
        result_seed: i64,
        wallclock_time: f64,
        additional_data: &str,
    ) -> Result<Self, InvalidRunResult> {
        if status == RunStatus::Running {
            return Err(InvalidRunResult::RunningStatus);
        }
        if runtime.is_nan() || runtime < 0.0 {
            return Err(InvalidRunResult::Runtime(runtime));
        }
        if runlength.is_nan() || (runlength < 0.0 && runlength != -1.0) {
            return Err(InvalidRunResult::Runlength(runlength));
        }
        if quality.is_nan() {
            return Err(InvalidRunResult::Quality);
        }
        if wallclock_time.is_nan() || wallclock_time < 0.0 {
            return Err(InvalidRunResult::Wallclock(wallclock_time));
        }
        Ok(Self {
            run_config,
            status,
            runtime,
            runlength,
            quality,
            result_seed,
            wallclock_time,
            additional_data: escape_additional_data(additional_data),
            raw_result_line: String::new(),
            kill_handler: None,
        })
    }

    /// Live view of a run that has not finished yet.
    pub fn running(
        run_config: RunConfig,
        runtime: f64,
        wallclock_time: f64,
        kill_handler: Arc<dyn KillHandler>,
    ) -> Self {
        let seed = run_config.seed();
        Self {
            run_config,
            status: RunStatus::Running,
            runtime: non_negative(runtime),
            runlength: 0.0,
            quality: 0.0,
            result_seed: seed,
            wallclock_time: non_negative(wallclock_time),
            additional_data: String::new(),
            raw_result_line: String::new(),
            kill_handler: Some(kill_handler),
        }
    }

    pub fn killed(run_config: RunConfig, runtime: f64, wallclock_time: f64, msg: &str) -> Self {
        Self::synthetic(run_config, RunStatus::Killed, runtime, wallclock_time, msg)
    }

    pub fn crashed(run_config: RunConfig, runtime: f64, wallclock_time: f64, msg: &str) -> Self {
        Self::synthetic(run_config, RunStatus::Crashed, runtime, wallclock_time, msg)
    }

    pub fn abort(run_config: RunConfig, runtime: f64, wallclock_time: f64, msg: &str) -> Self {
        Self::synthetic(run_config, RunStatus::Abort, runtime, wallclock_time, msg)
    }

    pub fn timeout(run_config: RunConfig, runtime: f64, wallclock_time: f64, msg: &str) -> Self {
        Self::synthetic(run_config, RunStatus::Timeout, runtime, wallclock_time, msg)
    }

    fn synthetic(
        run_config: RunConfig,
        status: RunStatus,
        runtime: f64,
        wallclock_time: f64,
        msg: &str,
    ) -> Self {
        let seed = run_config.seed();
        Self {
            run_config,
            status,
            runtime: non_negative(runtime),
            runlength: 0.0,
            quality: 0.0,
            result_seed: seed,
            wallclock_time: non_negative(wallclock_time),
            additional_data: escape_additional_data(msg),
            raw_result_line: String::new(),
            kill_handler: None,
        }
    }

    /// Terminal copy with a different status and additional data.
    pub fn with_status(&self, status: RunStatus, additional_data: &str) -> Self {
        Self {
            status,
            additional_data: escape_additional_data(additional_data),
            kill_handler: if status == RunStatus::Running {
                self.kill_handler.clone()
            } else {
                None
            },
            ..self.clone()
        }
    }

    pub fn with_runtime(&self, runtime: f64) -> Self {
        Self {
            runtime: non_negative(runtime),
            ..self.clone()
        }
    }

    pub fn with_wallclock_time(&self, wallclock_time: f64) -> Self {
        Self {
            wallclock_time: non_negative(wallclock_time),
            ..self.clone()
        }
    }

    pub fn with_kill_handler(&self, kill_handler: Arc<dyn KillHandler>) -> Self {
        Self {
            kill_handler: Some(kill_handler),
            ..self.clone()
        }
    }

    pub fn with_raw_result_line(self, line: impl Into<String>) -> Self {
        Self {
            raw_result_line: line.into(),
            ..self
        }
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn runtime(&self) -> f64 {
        self.runtime
    }

    pub fn runlength(&self) -> f64 {
        self.runlength
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }

    pub fn result_seed(&self) -> i64 {
        self.result_seed
    }

    pub fn wallclock_time(&self) -> f64 {
        self.wallclock_time
    }

    pub fn additional_data(&self) -> &str {
        &self.additional_data
    }

    pub fn raw_result_line(&self) -> &str {
        &self.raw_result_line
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Requests termination of a live run. Has no effect on terminal results.
    pub fn kill(&self) {
        if let Some(handler) = &self.kill_handler {
            handler.kill();
        }
    }

    /// Line in the format target algorithms report their results in.
    pub fn result_line(&self) -> String {
        let mut line = format!(
            "{}, {}, {}, {}, {}",
            self.status, self.runtime, self.runlength, self.quality, self.result_seed
        );
        if !self.additional_data.is_empty() {
            line.push_str(", ");
            line.push_str(&self.additional_data);
        }
        line
    }
}

impl PartialEq for RunResult {
    fn eq(&self, other: &Self) -> bool {
        self.run_config == other.run_config
            && self.status == other.status
            && self.runtime == other.runtime
            && self.runlength == other.runlength
            && self.quality == other.quality
            && self.result_seed == other.result_seed
            && self.wallclock_time == other.wallclock_time
            && self.additional_data == other.additional_data
            && self.raw_result_line == other.raw_result_line
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.max(0.0) }
}

fn escape_additional_data(data: &str) -> String {
    data.trim().replace('\n', "\\n").replace(',', ";")
}
