use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant};

use crate::{
    config::CommandLineOptions,
    constants::{KILL_GRACE_PERIOD, KILL_POLL_BACKOFF, KILL_POLL_INITIAL},
    native::command::{EXECUTION_ID_ENV_VAR, kill_command, split_quoted},
};

/// Exit codes produced by SIGINT, SIGKILL and SIGTERM.
const SIGNAL_EXIT_CODES: [i32; 3] = [130, 137, 143];

/// Escalating termination of one target process and its process group.
#[derive(Debug)]
pub struct ProcessTerminator<'a> {
    options: &'a CommandLineOptions,
    execution_id: &'a str,
    started: AtomicBool,
}

impl<'a> ProcessTerminator<'a> {
    pub fn new(options: &'a CommandLineOptions, execution_id: &'a str) -> Self {
        Self {
            options,
            execution_id,
            started: AtomicBool::new(false),
        }
    }

    /// Terminates the child and reaps it. Only the first call does anything.
    pub async fn terminate(&self, child: &mut Child) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(Some(status)) = child.try_wait() {
            tracing::trace!("Process already exited with {}, nothing to terminate", status);
            return;
        }
        let Some(pid) = child.id() else {
            tracing::trace!("Process already reaped, nothing to terminate");
            return;
        };

        if let Some(env_kill) = &self.options.env_kill_command {
            let mut argv = split_quoted(env_kill);
            argv.extend([
                EXECUTION_ID_ENV_VAR.clone(),
                self.execution_id.to_string(),
                pid.to_string(),
            ]);
            tracing::debug!("Invoking environment kill command: {:?}", argv);
            run_kill_command(&argv).await;
        } else {
            self.signal(pid, &self.options.pg_nice_kill_command, &self.options.proc_nice_kill_command)
                .await;
        }

        if let Some(status) = wait_for_exit(child, KILL_GRACE_PERIOD).await {
            log_exit_status(pid, status);
            return;
        }

        tracing::debug!(
            "Process {} did not exit within {}ms, sending force kill",
            pid,
            KILL_GRACE_PERIOD.as_millis()
        );
        self.signal(pid, &self.options.pg_force_kill_command, &self.options.proc_force_kill_command)
            .await;

        if let Err(e) = child.start_kill() {
            tracing::trace!("Destroying process {} failed: {}", pid, e);
        }
        match child.wait().await {
            Ok(status) => log_exit_status(pid, status),
            Err(e) => tracing::warn!("Could not wait for process {}: {}", pid, e),
        }
    }

    /// Signals the process group, falling back to the single pid.
    async fn signal(&self, pid: u32, group_template: &str, process_template: &str) {
        match run_kill_command(&kill_command(group_template, pid)).await {
            Some(0) => {}
            code => {
                tracing::debug!(
                    "Process group kill for {} returned {:?}, falling back to pid",
                    pid,
                    code
                );
                run_kill_command(&kill_command(process_template, pid)).await;
            }
        }
    }
}

/// Polls for a voluntary exit with exponential backoff.
async fn wait_for_exit(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + grace;
    let mut delay = KILL_POLL_INITIAL;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Could not poll process state: {}", e);
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(delay).await;
        delay = delay.mul_f64(KILL_POLL_BACKOFF);
    }
}

async fn run_kill_command(argv: &[String]) -> Option<i32> {
    let (program, args) = argv.split_first()?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    match output {
        Ok(output) => {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                tracing::trace!("[KILL-OUT] {}", line);
            }
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                tracing::trace!("[KILL-ERR] {}", line);
            }
            output.status.code()
        }
        Err(e) => {
            tracing::warn!("Could not execute kill command {:?}: {}", argv, e);
            None
        }
    }
}

fn log_exit_status(pid: u32, status: ExitStatus) {
    match status.code() {
        Some(0) => tracing::trace!("Process {} exited normally", pid),
        Some(code) if SIGNAL_EXIT_CODES.contains(&code) => {
            tracing::debug!("Process {} exited with signal code {}", pid, code)
        }
        Some(code) => tracing::debug!("Process {} exited with code {}", pid, code),
        None => tracing::debug!("Process {} terminated by signal", pid),
    }
}
