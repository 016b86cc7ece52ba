use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::CommandLineOptions,
    constants::{
        CONCURRENT_TASK_ID_ENV_VAR, CPU_TIME_FREQUENCY_ENV_VAR, KILL_CHECK_DELAY,
        MSG_DUPLICATE_RESULT_LINES, MSG_KILLED_BEFORE_START, MSG_KILLED_MANUALLY,
        MSG_NO_RESULT_LINE, MSG_SHUTDOWN, MSG_SHUTDOWN_WHILE_RUNNING, OUTPUT_TAIL_LINES,
        PORT_ENV_VAR,
    },
    core::{
        domain::{KillHandler, RunConfig, RunResult, RunStatus},
        errors::EvaluatorError,
    },
    native::{
        command::{EXECUTION_ID_ENV_VAR, build_argv, call_string},
        kill::ProcessTerminator,
        output::{ParsedResultLine, ResultLineError, ResultLineParser},
        tokens::{SlotToken, TokenPool},
    },
};

const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Receives every snapshot of a single run, the terminal one last.
pub type RunUpdate = Arc<dyn Fn(RunResult) + Send + Sync>;

/// Runs target algorithm processes and turns their output into results.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    options: Arc<CommandLineOptions>,
    parser: Arc<ResultLineParser>,
    tokens: TokenPool,
    shutdown: CancellationToken,
}

enum Slot {
    Acquired(SlotToken),
    Refused(&'static str),
}

enum Interrupt {
    Killed,
    Shutdown,
}

impl ProcessSupervisor {
    pub fn new(
        options: Arc<CommandLineOptions>,
        tokens: TokenPool,
        shutdown: CancellationToken,
    ) -> Result<Self, EvaluatorError> {
        let parser = ResultLineParser::new().map_err(|e| EvaluatorError::Internal {
            msg: format!("invalid result line pattern: {}", e),
        })?;
        Ok(Self {
            options,
            parser: Arc::new(parser),
            tokens,
            shutdown,
        })
    }

    /// Executes one run to completion. Only infrastructure problems are
    /// returned as errors, everything else becomes the result status.
    #[tracing::instrument(skip_all, fields(run = %rc))]
    pub async fn run(
        &self,
        rc: RunConfig,
        kill_handler: Arc<dyn KillHandler>,
        update: RunUpdate,
    ) -> Result<RunResult, EvaluatorError> {
        if kill_handler.is_killed() {
            let result = RunResult::killed(rc, 0.0, 0.0, MSG_KILLED_BEFORE_START);
            update(result.clone());
            return Ok(result);
        }
        update(RunResult::running(rc.clone(), 0.0, 0.0, kill_handler.clone()));

        if self.shutdown.is_cancelled() {
            let result = RunResult::killed(rc, 0.0, 0.0, MSG_SHUTDOWN);
            update(result.clone());
            return Ok(result);
        }

        check_execution_dir(&rc).await?;

        let token = match self.acquire_slot(kill_handler.as_ref()).await? {
            Slot::Acquired(token) => token,
            Slot::Refused(msg) => {
                let result = RunResult::killed(rc, 0.0, 0.0, msg);
                update(result.clone());
                return Ok(result);
            }
        };

        let result = self.execute(&rc, &kill_handler, &update, &token).await?;
        drop(token);

        update(result.clone());
        Ok(result)
    }

    async fn acquire_slot(&self, kill_handler: &dyn KillHandler) -> Result<Slot, EvaluatorError> {
        loop {
            tokio::select! {
                token = self.tokens.acquire() => return token.map(Slot::Acquired),
                _ = self.shutdown.cancelled() => return Ok(Slot::Refused(MSG_SHUTDOWN)),
                _ = tokio::time::sleep(self.options.observer_frequency) => {
                    if kill_handler.is_killed() {
                        return Ok(Slot::Refused(MSG_KILLED_BEFORE_START));
                    }
                }
            }
        }
    }

    async fn execute(
        &self,
        rc: &RunConfig,
        kill_handler: &Arc<dyn KillHandler>,
        update: &RunUpdate,
        token: &SlotToken,
    ) -> Result<RunResult, EvaluatorError> {
        if kill_handler.is_killed() {
            return Ok(RunResult::killed(rc.clone(), 0.0, 0.0, MSG_KILLED_BEFORE_START));
        }

        let argv = build_argv(rc, self.options.param_arguments_contain_quotes);
        let call = call_string(rc, &argv);
        if self.options.log_all_call_strings {
            tracing::info!("Call: {}", call);
        } else {
            tracing::debug!("Call: {}", call);
        }

        let (program, args) = argv.split_first().ok_or_else(|| EvaluatorError::Spawn {
            call: call.clone(),
            msg: "empty executable".to_string(),
        })?;

        let execution_id = Uuid::new_v4().to_string();
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&rc.execution().execution_dir)
            .env(CONCURRENT_TASK_ID_ENV_VAR, token.id().to_string())
            .env(EXECUTION_ID_ENV_VAR.as_str(), &execution_id)
            .env(
                CPU_TIME_FREQUENCY_ENV_VAR,
                (self.options.observer_frequency.as_secs_f64() / 2.0).to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let listener = if self.options.listen_for_updates {
            match UpdateListener::bind().await {
                Ok(listener) => {
                    cmd.env(PORT_ENV_VAR, listener.port.to_string());
                    Some(listener)
                }
                Err(e) => {
                    tracing::warn!("Could not open CPU time update listener: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!("Failed to spawn target algorithm: {}", call);
            EvaluatorError::Spawn {
                call: call.clone(),
                msg: e.to_string(),
            }
        })?;
        tracing::debug!("Started process {:?} with slot {}", child.id(), token.id());

        let stdout = child.stdout.take().ok_or_else(|| EvaluatorError::Internal {
            msg: "child stdout was not captured".to_string(),
        })?;
        let stderr_drain = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!("[PROCESS-ERR] {}", line);
                }
            })
        });

        let cpu_time = listener
            .as_ref()
            .map(|l| l.cpu_time.clone())
            .unwrap_or_else(|| Arc::new(AtomicU64::new(0f64.to_bits())));
        let kill_detected = Arc::new(Notify::new());
        let ticker = self.spawn_ticker(
            rc.clone(),
            kill_handler.clone(),
            update.clone(),
            cpu_time.clone(),
            start,
            kill_detected.clone(),
        );

        let mut output = OutputState::default();
        let mut lines = BufReader::new(stdout).lines();
        let interrupt = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => output.process_line(line, rc, &self.parser, &self.options),
                    Ok(None) => break None,
                    Err(e) => {
                        tracing::warn!("Error reading target algorithm output: {}", e);
                        break None;
                    }
                },
                _ = kill_detected.notified() => break Some(Interrupt::Killed),
                _ = self.shutdown.cancelled() => break Some(Interrupt::Shutdown),
            }
        };

        ProcessTerminator::new(&self.options, &execution_id)
            .terminate(&mut child)
            .await;

        ticker.abort();
        let _ = ticker.await;
        drop(listener);
        if let Some(drain) = stderr_drain {
            let _ = tokio::time::timeout(STDERR_DRAIN_GRACE, drain).await;
        }

        let wallclock = start.elapsed().as_secs_f64();
        let runtime = f64::from_bits(cpu_time.load(Ordering::Relaxed));
        let result = match interrupt {
            // a reported result wins over a late kill
            Some(_) if output.result.is_some() => {
                output.into_result(rc, runtime, wallclock, &call)
            }
            Some(Interrupt::Killed) => {
                RunResult::killed(rc.clone(), runtime, wallclock, MSG_KILLED_MANUALLY)
            }
            Some(Interrupt::Shutdown) => {
                RunResult::killed(rc.clone(), runtime, wallclock, MSG_SHUTDOWN_WHILE_RUNNING)
            }
            None => output.into_result(rc, runtime, wallclock, &call),
        };

        if matches!(result.status(), RunStatus::Crashed | RunStatus::Abort) {
            tracing::error!("Failed run detected, call: {}", call);
            tracing::error!("Last {} lines of output:", output.tail.len());
            for line in &output.tail {
                tracing::error!("> {}", line);
            }
        }

        Ok(result)
    }

    /// Reports live snapshots and watches the kill handler until aborted.
    fn spawn_ticker(
        &self,
        rc: RunConfig,
        kill_handler: Arc<dyn KillHandler>,
        update: RunUpdate,
        cpu_time: Arc<AtomicU64>,
        start: Instant,
        kill_detected: Arc<Notify>,
    ) -> JoinHandle<()> {
        let remainder = self.options.observer_frequency.saturating_sub(KILL_CHECK_DELAY);
        tokio::spawn(async move {
            loop {
                update(RunResult::running(
                    rc.clone(),
                    f64::from_bits(cpu_time.load(Ordering::Relaxed)),
                    start.elapsed().as_secs_f64(),
                    kill_handler.clone(),
                ));
                tokio::time::sleep(KILL_CHECK_DELAY).await;
                if kill_handler.is_killed() {
                    tracing::trace!("Kill detected, terminating target algorithm");
                    kill_detected.notify_one();
                    return;
                }
                tokio::time::sleep(remainder).await;
            }
        })
    }
}

async fn check_execution_dir(rc: &RunConfig) -> Result<(), EvaluatorError> {
    let path = &rc.execution().execution_dir;
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(EvaluatorError::NotADirectory { path: path.clone() }),
        Err(_) => Err(EvaluatorError::MissingExecutionDirectory { path: path.clone() }),
    }
}

#[derive(Debug, Default)]
struct OutputState {
    tail: VecDeque<String>,
    result: Option<RunResult>,
    duplicate: bool,
}

impl OutputState {
    fn process_line(
        &mut self,
        line: String,
        rc: &RunConfig,
        parser: &ResultLineParser,
        options: &CommandLineOptions,
    ) {
        if options.log_all_process_output {
            tracing::info!("[PROCESS] {}", line);
        } else {
            tracing::trace!("[PROCESS] {}", line);
        }

        if let Some(parsed) = parser.parse(&line) {
            if self.result.is_some() {
                tracing::error!("Second result line detected: {}", line);
                self.duplicate = true;
            } else {
                if options.log_all_call_results {
                    tracing::info!("Result line: {}", line);
                } else {
                    tracing::debug!("Result line: {}", line);
                }
                self.result = Some(result_from_line(rc, parsed, &line));
            }
        }

        if self.tail.len() == OUTPUT_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn into_result(&self, rc: &RunConfig, runtime: f64, wallclock: f64, call: &str) -> RunResult {
        if self.duplicate {
            return RunResult::abort(rc.clone(), runtime, wallclock, MSG_DUPLICATE_RESULT_LINES);
        }
        match &self.result {
            Some(result) => result.with_wallclock_time(wallclock),
            None => RunResult::crashed(
                rc.clone(),
                runtime,
                wallclock,
                &format!("{} Call: {}", MSG_NO_RESULT_LINE, call),
            ),
        }
    }
}

fn result_from_line(
    rc: &RunConfig,
    parsed: Result<ParsedResultLine, ResultLineError>,
    line: &str,
) -> RunResult {
    let validated = parsed.map_err(|e| e.to_string()).and_then(|p| {
        RunResult::new(
            rc.clone(),
            p.status,
            p.runtime,
            p.runlength,
            p.quality,
            p.seed,
            0.0,
            &p.additional_data,
        )
        .map_err(|e| e.to_string())
    });

    match validated {
        Ok(result) => result.with_raw_result_line(line),
        Err(reason) => {
            tracing::error!("Could not parse result line {:?}: {}", line, reason);
            RunResult::crashed(
                rc.clone(),
                rc.execution().max_cutoff,
                0.0,
                &format!(
                    "ERROR: Couldn't parse output from wrapper ({}): {}",
                    reason, line
                ),
            )
            .with_raw_result_line(line)
        }
    }
}

/// Local UDP port the target may push its consumed CPU time to.
#[derive(Debug)]
struct UpdateListener {
    port: u16,
    cpu_time: Arc<AtomicU64>,
    received: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl UpdateListener {
    async fn bind() -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = socket.local_addr()?.port();
        let cpu_time = Arc::new(AtomicU64::new(0f64.to_bits()));
        let received = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn({
            let cpu_time = cpu_time.clone();
            let received = received.clone();
            async move {
                let mut buf = [0u8; 1024];
                loop {
                    let (len, addr) = match socket.recv_from(&mut buf).await {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::debug!("CPU time listener stopped: {}", e);
                            return;
                        }
                    };
                    if !addr.ip().is_loopback() {
                        tracing::warn!("Ignoring CPU time update from non-local address {}", addr);
                        continue;
                    }
                    let payload = String::from_utf8_lossy(&buf[..len]);
                    match payload.trim().parse::<f64>() {
                        Ok(runtime) if runtime.is_finite() => {
                            cpu_time.store(runtime.to_bits(), Ordering::Relaxed);
                            received.store(true, Ordering::Relaxed);
                        }
                        _ => tracing::warn!("Ignoring malformed CPU time update {:?}", payload),
                    }
                }
            }
        });

        Ok(Self {
            port,
            cpu_time,
            received,
            task,
        })
    }
}

impl Drop for UpdateListener {
    fn drop(&mut self) {
        if self.received.load(Ordering::Relaxed) {
            tracing::trace!(
                "Last CPU time update: {}",
                f64::from_bits(self.cpu_time.load(Ordering::Relaxed))
            );
        }
        self.task.abort();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::Path;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::core::domain::{ExecutionConfig, StatusKillHandler, tests::run_config_with};

    /// Writes a bash script and returns an executable string running it.
    pub(crate) fn script(dir: &Path, body: &str) -> String {
        let path = dir.join(format!("{}.sh", Uuid::new_v4()));
        std::fs::write(&path, format!("#!/bin/bash\n{}\n", body)).unwrap();
        format!("bash '{}'", path.display())
    }

    pub(crate) fn script_run(dir: &Path, body: &str, cutoff: f64) -> RunConfig {
        run_config_with(
            "instance.cnf",
            123,
            cutoff,
            ExecutionConfig::new(script(dir, body), dir, false, 300.0),
        )
    }

    pub(crate) fn fast_options() -> CommandLineOptions {
        CommandLineOptions {
            observer_frequency: Duration::from_millis(50),
            cores: 4,
            ..Default::default()
        }
    }

    fn supervisor(options: CommandLineOptions) -> ProcessSupervisor {
        let tokens = TokenPool::new(options.cores);
        ProcessSupervisor::new(Arc::new(options), tokens, CancellationToken::new()).unwrap()
    }

    fn recorder() -> (RunUpdate, Arc<Mutex<Vec<RunResult>>>) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        (Arc::new(move |r: RunResult| sink.lock().push(r)), updates)
    }

    #[tokio::test]
    async fn test_successful_run_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(
            dir.path(),
            "sleep 2\necho 'Result of algorithm run: SAT,1.5,-1,0,123'",
            10.0,
        );
        let (update, updates) = recorder();

        let result = supervisor(fast_options())
            .run(rc.clone(), Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Sat);
        assert_eq!(result.runtime(), 1.5);
        assert_eq!(result.runlength(), -1.0);
        assert_eq!(result.quality(), 0.0);
        assert_eq!(result.result_seed(), 123);
        assert!(result.wallclock_time() >= 2.0);
        assert_eq!(result.run_config(), &rc);
        assert!(result.raw_result_line().contains("Result of algorithm run"));

        let updates = updates.lock();
        assert!(updates.len() >= 2);
        assert!(updates[0].is_running());
        assert_eq!(updates.last().unwrap(), &result);
    }

    #[tokio::test]
    async fn test_no_output_is_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(dir.path(), "exit 0", 10.0);
        let (update, _) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Crashed);
        assert!(
            result
                .additional_data()
                .contains("did not output anything that matched")
        );
        assert!(result.additional_data().contains("instance.cnf"));
    }

    #[tokio::test]
    async fn test_duplicate_result_lines_abort() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(
            dir.path(),
            "echo 'Result of algorithm run: SAT,1,0,0,1'\necho 'Result of algorithm run: UNSAT,1,0,0,1'",
            10.0,
        );
        let (update, _) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Abort);
        assert!(result.additional_data().contains("duplicate lines"));
    }

    #[tokio::test]
    async fn test_malformed_result_is_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(
            dir.path(),
            "echo 'Result of algorithm run: SAT,fast,0,0,1'",
            10.0,
        );
        let (update, _) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Crashed);
        assert_eq!(result.runtime(), 300.0);
        assert!(result.additional_data().contains("Couldn't parse output"));
    }

    #[tokio::test]
    async fn test_forbidden_status_is_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(
            dir.path(),
            "echo 'Result of algorithm run: KILLED,1,0,0,1'",
            10.0,
        );
        let (update, _) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Crashed);
    }

    #[tokio::test]
    async fn test_kill_before_start_skips_process() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let rc = script_run(
            dir.path(),
            &format!("touch '{}'", marker.display()),
            10.0,
        );
        let kill_handler = Arc::new(StatusKillHandler::new());
        kill_handler.kill();
        let (update, updates) = recorder();

        let result = supervisor(fast_options())
            .run(rc, kill_handler, update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Killed);
        assert_eq!(result.additional_data(), MSG_KILLED_BEFORE_START);
        assert!(!marker.exists());
        assert_eq!(updates.lock().as_slice(), &[result]);
    }

    #[tokio::test]
    async fn test_kill_during_run() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(dir.path(), "sleep 30", 10.0);
        let kill_handler = Arc::new(StatusKillHandler::new());
        let (update, updates) = recorder();

        let run = tokio::spawn({
            let kill_handler = kill_handler.clone();
            async move { supervisor(fast_options()).run(rc, kill_handler, update).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        updates.lock().last().unwrap().kill();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(kill_handler.is_killed());
        assert_eq!(result.status(), RunStatus::Killed);
        assert_eq!(result.additional_data(), MSG_KILLED_MANUALLY);
        assert_eq!(updates.lock().last().unwrap().status(), RunStatus::Killed);
    }

    #[tokio::test]
    async fn test_kill_keeps_reported_result() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(
            dir.path(),
            "echo 'Result of algorithm run: SAT, 0.25, 0, 0, 123'\nsleep 30",
            10.0,
        );
        let kill_handler = Arc::new(StatusKillHandler::new());
        let (update, updates) = recorder();

        let run = tokio::spawn({
            let kill_handler = kill_handler.clone();
            async move { supervisor(fast_options()).run(rc, kill_handler, update).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        kill_handler.kill();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(result.status(), RunStatus::Sat);
        assert_eq!(result.runtime(), 0.25);
        assert_eq!(updates.lock().last().unwrap().status(), RunStatus::Sat);
    }

    #[tokio::test]
    async fn test_missing_execution_dir_fails() {
        let rc = run_config_with(
            "instance.cnf",
            1,
            10.0,
            ExecutionConfig::new("true", "/nonexistent/algorunner", false, 10.0),
        );
        let (update, _) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await;

        assert!(matches!(
            result,
            Err(EvaluatorError::MissingExecutionDirectory { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_executable_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let rc = run_config_with(
            "instance.cnf",
            1,
            10.0,
            ExecutionConfig::new("/nonexistent/solver", dir.path(), false, 10.0),
        );
        let (update, _) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await;

        assert!(matches!(result, Err(EvaluatorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_runs() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(dir.path(), "echo 'Result of algorithm run: SAT,1,0,0,1'", 10.0);
        let options = fast_options();
        let shutdown = CancellationToken::new();
        let supervisor = ProcessSupervisor::new(
            Arc::new(options.clone()),
            TokenPool::new(options.cores),
            shutdown.clone(),
        )
        .unwrap();
        shutdown.cancel();
        let (update, _) = recorder();

        let result = supervisor
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Killed);
        assert_eq!(result.additional_data(), MSG_SHUTDOWN);
    }

    #[tokio::test]
    async fn test_environment_is_exported() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(
            dir.path(),
            "echo \"Result of algorithm run: SAT,0,0,0,$AEATK_CONCURRENT_TASK_ID,port=$AEATK_PORT id=${AEATK_EXECUTION_UUID:-none}\"",
            10.0,
        );
        let (update, _) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Sat);
        assert_eq!(result.result_seed(), 0);
        let data = result.additional_data();
        let port = data
            .split_whitespace()
            .next()
            .unwrap()
            .trim_start_matches("port=");
        assert!(port.parse::<u16>().is_ok(), "unexpected data {:?}", data);
        assert!(!data.contains("id=none"));
    }

    #[tokio::test]
    async fn test_cpu_time_updates_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let rc = script_run(
            dir.path(),
            "echo -n 1.25 > /dev/udp/127.0.0.1/$AEATK_PORT\nsleep 0.5\necho 'Result of algorithm run: TIMEOUT,1.3,0,0,1'",
            10.0,
        );
        let (update, updates) = recorder();

        let result = supervisor(fast_options())
            .run(rc, Arc::new(StatusKillHandler::new()), update)
            .await
            .unwrap();

        assert_eq!(result.status(), RunStatus::Timeout);
        assert!(
            updates
                .lock()
                .iter()
                .any(|r| r.is_running() && r.runtime() == 1.25)
        );
    }
}
