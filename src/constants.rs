use std::time::Duration;

pub const PORT_ENV_VAR: &str = "AEATK_PORT";
pub const CPU_TIME_FREQUENCY_ENV_VAR: &str = "AEATK_CPU_TIME_FREQUENCY";
pub const CONCURRENT_TASK_ID_ENV_VAR: &str = "AEATK_CONCURRENT_TASK_ID";
pub const EXECUTION_UUID_ENV_VAR: &str = "AEATK_EXECUTION_UUID";

/// Passed as the runlength limit; targets are never limited by runlength.
pub const MAX_RUNLENGTH_SENTINEL: &str = "2147483647";

/// Number of trailing stdout lines kept for crash diagnostics.
pub const OUTPUT_TAIL_LINES: usize = 1000;

pub const KILL_POLL_INITIAL: Duration = Duration::from_millis(25);
pub const KILL_POLL_BACKOFF: f64 = 1.5;
pub const KILL_GRACE_PERIOD: Duration = Duration::from_millis(3000);

/// First half of an observer tick. The kill flag is checked between the two
/// halves so a kill is noticed within this period.
pub const KILL_CHECK_DELAY: Duration = Duration::from_millis(25);

pub const MSG_KILLED_BEFORE_START: &str = "Kill detected before target algorithm invoked";
pub const MSG_KILLED_MANUALLY: &str = "Killed Manually";
pub const MSG_SHUTDOWN: &str = "Shutdown in progress: algorithm not executed";
pub const MSG_DUPLICATE_RESULT_LINES: &str = "ERROR: duplicate lines matched";
pub const MSG_SHUTDOWN_WHILE_RUNNING: &str = "Shutdown in progress: algorithm terminated";
pub const MSG_NO_RESULT_LINE: &str = "ERROR: Wrapper did not output anything that matched the expected output (\"Result of algorithm run:...\"). Please try executing the wrapper directly";
