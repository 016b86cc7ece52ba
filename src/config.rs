use std::str::FromStr;
use std::time::Duration;

use crate::core::errors::EvaluatorError;

pub const MIN_OBSERVER_FREQUENCY: Duration = Duration::from_millis(25);

const ENV_PREFIX: &str = "ALGORUNNER_";

/// Settings of the process supervisor and the command-line evaluator.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandLineOptions {
    /// Period of live status reports for every running process.
    pub observer_frequency: Duration,
    /// Number of target algorithm processes allowed to run at once.
    pub cores: usize,
    /// Open a local UDP port the target can push CPU time updates to.
    pub listen_for_updates: bool,
    /// Wrap parameter values in single quotes on the command line.
    pub param_arguments_contain_quotes: bool,
    pub log_all_call_strings: bool,
    pub log_all_call_results: bool,
    pub log_all_process_output: bool,
    /// Replaces signal based termination. Invoked with the execution id
    /// variable name, the execution id and the pid appended.
    pub env_kill_command: Option<String>,
    pub pg_nice_kill_command: String,
    pub pg_force_kill_command: String,
    pub proc_nice_kill_command: String,
    pub proc_force_kill_command: String,
}

impl Default for CommandLineOptions {
    fn default() -> Self {
        Self {
            observer_frequency: Duration::from_millis(500),
            cores: 1,
            listen_for_updates: true,
            param_arguments_contain_quotes: false,
            log_all_call_strings: false,
            log_all_call_results: false,
            log_all_process_output: false,
            env_kill_command: None,
            pg_nice_kill_command: "bash -c \"kill -s TERM -%pid\"".to_string(),
            pg_force_kill_command: "bash -c \"kill -s KILL -%pid\"".to_string(),
            proc_nice_kill_command: "kill -s TERM %pid".to_string(),
            proc_force_kill_command: "kill -s KILL %pid".to_string(),
        }
    }
}

impl CommandLineOptions {
    pub fn validate(&self) -> Result<(), EvaluatorError> {
        if self.observer_frequency < MIN_OBSERVER_FREQUENCY {
            return Err(EvaluatorError::InvalidConfiguration {
                msg: format!(
                    "observer frequency must be at least {}ms, got {}ms",
                    MIN_OBSERVER_FREQUENCY.as_millis(),
                    self.observer_frequency.as_millis()
                ),
            });
        }
        if self.cores == 0 {
            return Err(EvaluatorError::InvalidConfiguration {
                msg: "cores must be at least 1".to_string(),
            });
        }
        if let Ok(available) = std::thread::available_parallelism() {
            if self.cores > available.get() {
                tracing::warn!(
                    "Number of cores requested ({}) is greater than the number available ({})",
                    self.cores,
                    available
                );
            }
        }
        Ok(())
    }

    /// Overrides defaults with `ALGORUNNER_*` environment variables.
    pub fn from_env() -> Result<Self, EvaluatorError> {
        let mut options = Self::default();
        if let Some(ms) = env_parse::<u64>("OBSERVER_FREQUENCY_MS")? {
            options.observer_frequency = Duration::from_millis(ms);
        }
        if let Some(cores) = env_parse("CORES")? {
            options.cores = cores;
        }
        if let Some(listen) = env_parse("LISTEN_FOR_UPDATES")? {
            options.listen_for_updates = listen;
        }
        if let Some(quotes) = env_parse("PARAM_ARGUMENTS_CONTAIN_QUOTES")? {
            options.param_arguments_contain_quotes = quotes;
        }
        if let Some(log) = env_parse("LOG_ALL_CALL_STRINGS")? {
            options.log_all_call_strings = log;
        }
        if let Some(log) = env_parse("LOG_ALL_CALL_RESULTS")? {
            options.log_all_call_results = log;
        }
        if let Some(log) = env_parse("LOG_ALL_PROCESS_OUTPUT")? {
            options.log_all_process_output = log;
        }
        options.env_kill_command = env_string("ENV_KILL_COMMAND");
        if let Some(cmd) = env_string("PG_NICE_KILL_COMMAND") {
            options.pg_nice_kill_command = cmd;
        }
        if let Some(cmd) = env_string("PG_FORCE_KILL_COMMAND") {
            options.pg_force_kill_command = cmd;
        }
        if let Some(cmd) = env_string("PROC_NICE_KILL_COMMAND") {
            options.proc_nice_kill_command = cmd;
        }
        if let Some(cmd) = env_string("PROC_FORCE_KILL_COMMAND") {
            options.proc_force_kill_command = cmd;
        }
        options.validate()?;
        Ok(options)
    }
}

/// Selects the decorators wrapped around the innermost evaluator.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub cache: bool,
    pub complete_zero_cutoff: bool,
    /// Maximum number of runs in flight inside the inner evaluators.
    pub bound: Option<usize>,
    /// How many times a crashed run is resubmitted.
    pub retry_crashed: usize,
    /// Runs observed past `cutoff * factor` are killed and reported as CRASHED.
    pub cap_scaling_factor: Option<f64>,
    pub walltime_as_runtime: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache: true,
            complete_zero_cutoff: true,
            bound: None,
            retry_crashed: 0,
            cap_scaling_factor: None,
            walltime_as_runtime: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), EvaluatorError> {
        if self.bound == Some(0) {
            return Err(EvaluatorError::InvalidConfiguration {
                msg: "bound must be at least 1".to_string(),
            });
        }
        if let Some(factor) = self.cap_scaling_factor {
            if factor.is_nan() || factor <= 1.0 {
                return Err(EvaluatorError::InvalidConfiguration {
                    msg: format!("cap scaling factor must be greater than 1, got {}", factor),
                });
            }
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, EvaluatorError> {
        let mut config = Self::default();
        if let Some(cache) = env_parse("CACHE")? {
            config.cache = cache;
        }
        if let Some(complete) = env_parse("COMPLETE_ZERO_CUTOFF")? {
            config.complete_zero_cutoff = complete;
        }
        if let Some(bound) = env_parse("BOUND")? {
            config.bound = Some(bound);
        }
        if let Some(retries) = env_parse("RETRY_CRASHED")? {
            config.retry_crashed = retries;
        }
        if let Some(factor) = env_parse("CAP_SCALING_FACTOR")? {
            config.cap_scaling_factor = Some(factor);
        }
        if let Some(walltime) = env_parse("WALLTIME_AS_RUNTIME")? {
            config.walltime_as_runtime = walltime;
        }
        config.validate()?;
        Ok(config)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>, EvaluatorError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| EvaluatorError::InvalidConfiguration {
                    msg: format!("{}{}={:?}: {}", ENV_PREFIX, name, value, e),
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        assert!(CommandLineOptions::default().validate().is_ok());
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_observer_frequency_floor() {
        let options = CommandLineOptions {
            observer_frequency: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(EvaluatorError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_zero_cores_rejected() {
        let options = CommandLineOptions {
            cores: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_pipeline_validation() {
        for factor in [1.0, 0.5, f64::NAN] {
            let config = PipelineConfig {
                cap_scaling_factor: Some(factor),
                ..Default::default()
            };
            assert!(config.validate().is_err(), "factor {} accepted", factor);
        }

        let config = PipelineConfig {
            bound: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            bound: Some(4),
            cap_scaling_factor: Some(1.5),
            retry_crashed: 3,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
