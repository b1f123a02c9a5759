// Process monitor - launch, watch and terminate concurrent children
// reason: single-threaded readiness loop over pipes, no async runtime
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use netlab_core::constants::{DEFAULT_KILL_GRACE, DEFAULT_POLL_INTERVAL};
use netlab_core::domain::{
    classify_exit, ExitOutcome, MonitorEvent, MonitorState, RunHandle, RunRecord,
};
use netlab_core::error::{NetlabError, Result};
use netlab_core::port::{AsyncOptions, EventSource, RunOptions, Token};

use crate::poller::PollEventSource;
use crate::tracked_process::{self, Launch, ProcessKind, TrackedProcess};

/// Monitor tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Longest single wait inside a blocking launch
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Runs commands and tracks async children until they die
///
/// Blocking launches use a private event source and leave the monitor state
/// untouched. Async launches are tracked until `keep_running` observes their
/// death or `stop`/`stop_process` terminates them.
///
/// # Example
/// ```text
/// let mut monitor = ProcessMonitor::new();
/// let server = monitor.launch_async("iperf -s", AsyncOptions::daemon(), None)?;
/// let client = monitor.launch_async("iperf -c 10.0.0.1", AsyncOptions::new(), None)?;
/// while monitor.keep_running(Duration::from_millis(500))? {}
/// println!("{}", client.stdout());
/// ```
pub struct ProcessMonitor<E: EventSource = PollEventSource> {
    state: MonitorState,
    source: E,
    config: MonitorConfig,
    running: Vec<TrackedProcess>,
    /// Launched since the monitor left Idle
    launched: usize,
    /// Of those, non-daemons
    transients: usize,
    failures: Vec<NetlabError>,
    next_token: Token,
}

impl ProcessMonitor<PollEventSource> {
    pub fn new() -> Self {
        Self::with_config(MonitorConfig::default())
    }
}

impl Default for ProcessMonitor<PollEventSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EventSource + Default> ProcessMonitor<E> {
    pub fn with_config(config: MonitorConfig) -> Self {
        Self {
            state: MonitorState::Idle,
            source: E::default(),
            config,
            running: Vec::new(),
            launched: 0,
            transients: 0,
            failures: Vec::new(),
            next_token: 0,
        }
    }

    /// Run a command to completion
    ///
    /// # Arguments
    /// * `cmd` - Command line, run through `sh -c`
    /// * `options` - Working directory, environment overrides and deadline
    /// * `input` - Line written to stdin before it is closed (sudo credential)
    ///
    /// # Errors
    /// - `Command` if the command exits non-zero
    /// - `Timeout` with the partial output if the deadline passes; the
    ///   process group is terminated first
    /// - `Spawn` if the shell cannot be started
    pub fn launch_sync(
        &mut self,
        cmd: &str,
        options: &RunOptions,
        input: Option<&str>,
    ) -> Result<RunRecord> {
        info!(cmd = %cmd, timeout = ?options.timeout, "Running command");

        let mut source = E::default();
        let mut process = TrackedProcess::spawn(Launch {
            cmd,
            cwd: options.cwd.clone(),
            env: &options.env,
            input,
            kind: ProcessKind::Sync {
                timeout: options.timeout,
            },
        })?;
        let mut tokens = 0;
        if let Err(e) = process.register(&mut source, &mut tokens) {
            let processes = std::slice::from_mut(&mut process);
            tracked_process::terminate(processes, self.config.kill_grace);
            return Err(e.into());
        }

        let deadline = options.timeout.map(|t| Instant::now() + t);
        let processes = std::slice::from_mut(&mut process);

        while !processes[0].is_dead() {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.abort_sync(&mut source, processes, options));
                    }
                    (deadline - now).min(self.config.poll_interval)
                }
                None => self.config.poll_interval,
            };

            let ready = match source.poll(wait) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(pid = %processes[0].pid(), error = %e, "Poll failed, terminating command");
                    tracked_process::terminate(processes, self.config.kill_grace);
                    processes[0].close_pipes(&mut source);
                    processes[0].finish();
                    return Err(e.into());
                }
            };
            tracked_process::dispatch(&mut source, processes, ready);
            processes[0].poll_exit();
        }

        process.finish();
        let record = process.handle().snapshot();
        debug!(pid = %record.pid, returncode = ?record.returncode, "Command finished");

        if !record.succeeded() {
            return Err(NetlabError::Command(Box::new(record)));
        }
        Ok(record)
    }

    fn abort_sync(
        &self,
        source: &mut E,
        processes: &mut [TrackedProcess],
        options: &RunOptions,
    ) -> NetlabError {
        let timeout = options.timeout.unwrap_or_default();
        warn!(
            pid = %processes[0].pid(),
            timeout_ms = %timeout.as_millis(),
            "Command timed out, terminating"
        );

        tracked_process::terminate(processes, self.config.kill_grace);
        tracked_process::drain(source, processes, self.config.kill_grace);
        processes[0].close_pipes(source);
        processes[0].finish();

        NetlabError::Timeout {
            record: Box::new(processes[0].handle().snapshot()),
            timeout,
        }
    }
}

impl<E: EventSource> ProcessMonitor<E> {
    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn config(&self) -> MonitorConfig {
        self.config
    }

    /// Number of async processes not yet observed dead
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Handles of the async processes not yet observed dead
    pub fn handles(&self) -> Vec<RunHandle> {
        self.running.iter().map(|p| p.handle().clone()).collect()
    }

    /// Start a command and track it; returns immediately
    ///
    /// The returned handle shares its record with the monitor. Its return
    /// code stays unset until the monitor observes the death.
    ///
    /// # Errors
    /// - `Spawn` if the shell cannot be started
    pub fn launch_async(
        &mut self,
        cmd: &str,
        options: AsyncOptions,
        input: Option<&str>,
    ) -> Result<RunHandle> {
        let next = self.state.transition(MonitorEvent::Launched)?;

        let AsyncOptions {
            cwd,
            env,
            daemon,
            on_stdout,
            on_stderr,
        } = options;

        let mut process = TrackedProcess::spawn(Launch {
            cmd,
            cwd,
            env: &env,
            input,
            kind: ProcessKind::Async { daemon },
        })?;
        process.set_callbacks(on_stdout, on_stderr);

        if let Err(e) = process.register(&mut self.source, &mut self.next_token) {
            let processes = std::slice::from_mut(&mut process);
            tracked_process::terminate(processes, self.config.kill_grace);
            process.close_pipes(&mut self.source);
            return Err(e.into());
        }

        info!(pid = %process.pid(), cmd = %cmd, daemon = %daemon, "Process launched");

        let handle = process.handle().clone();
        self.running.push(process);
        self.launched += 1;
        if !daemon {
            self.transients += 1;
        }
        self.state = next;
        Ok(handle)
    }

    /// One readiness pass over every tracked pipe
    ///
    /// Reads at most one chunk per ready pipe, then re-checks every process's
    /// exit status. Deaths are classified and failures queued for the next
    /// [`keep_running`](Self::keep_running).
    ///
    /// # Errors
    /// - `NoProcesses` / `AllDaemons` on the first poll of a run that cannot
    ///   make progress; tracked processes are terminated first
    pub fn poll_step(&mut self, timeout: Duration) -> Result<()> {
        let event = MonitorEvent::Polled {
            processes: self.launched,
            transients: self.transients,
        };
        match self.state.transition(event) {
            Ok(next) => self.state = next,
            Err(e) => {
                warn!(error = %e, "Monitor validation failed");
                self.stop();
                return Err(e);
            }
        }

        let ready = self.source.poll(timeout)?;
        tracked_process::dispatch(&mut self.source, &mut self.running, ready);
        self.reap();
        Ok(())
    }

    /// Classify and drop every process that is fully dead
    fn reap(&mut self) {
        let mut index = 0;
        while index < self.running.len() {
            let process = &mut self.running[index];
            process.poll_exit();
            if !process.is_dead() {
                index += 1;
                continue;
            }

            let mut process = self.running.remove(index);
            let Some(code) = process.finish() else {
                continue;
            };
            let record = process.handle().snapshot();

            match classify_exit(code, record.is_daemon) {
                ExitOutcome::Normal => {
                    info!(pid = %record.pid, cmd = %record.cmd, "Process finished");
                }
                ExitOutcome::CommandFailed => {
                    warn!(
                        pid = %record.pid,
                        cmd = %record.cmd,
                        returncode = %code,
                        "Process failed"
                    );
                    self.failures.push(NetlabError::Command(Box::new(record)));
                }
                ExitOutcome::DaemonExited => {
                    warn!(
                        pid = %record.pid,
                        cmd = %record.cmd,
                        returncode = %code,
                        "Daemon exited"
                    );
                    self.failures.push(NetlabError::DaemonExit(Box::new(record)));
                }
            }
        }
    }

    /// Poll once, then report whether any transient process is still alive
    ///
    /// When the last transient is gone the remaining daemons are stopped and
    /// the monitor returns to Idle.
    ///
    /// # Errors
    /// - `NoProcesses` if nothing was launched
    /// - `AllDaemons` if only daemons were launched
    /// - Every queued failure (`Command`, `DaemonExit`), aggregated. Call
    ///   [`stop`](Self::stop) afterwards to terminate the rest.
    pub fn keep_running(&mut self, timeout: Duration) -> Result<bool> {
        self.poll_step(timeout)?;

        if let Some(error) = NetlabError::from_many(std::mem::take(&mut self.failures)) {
            return Err(error);
        }

        if self.running.iter().any(|p| !p.is_daemon()) {
            return Ok(true);
        }

        self.state = self.state.transition(MonitorEvent::Finished)?;
        debug!(daemons = %self.running.len(), "All transient processes finished");
        self.stop();
        Ok(false)
    }

    /// Terminate one tracked process
    ///
    /// Its exit is recorded but never counted as a failure. Unknown or
    /// already finished handles are ignored.
    pub fn stop_process(&mut self, handle: &RunHandle) {
        let Some(index) = self
            .running
            .iter()
            .position(|p| p.handle().same_record(handle))
        else {
            debug!(pid = %handle.pid(), "stop_process: not tracked");
            return;
        };

        let mut process = self.running.remove(index);
        info!(pid = %process.pid(), cmd = %handle.cmd(), "Stopping process");

        let processes = std::slice::from_mut(&mut process);
        tracked_process::terminate(processes, self.config.kill_grace);
        tracked_process::drain(&mut self.source, processes, self.config.kill_grace);
        process.close_pipes(&mut self.source);
        process.finish();
    }

    /// Terminate everything, drain remaining output and return to Idle
    ///
    /// Never fails; problems are logged. Failures not yet reported through
    /// `keep_running` are discarded.
    pub fn stop(&mut self) {
        if !self.running.is_empty() {
            info!(processes = %self.running.len(), "Stopping process monitor");
        }

        tracked_process::terminate(&mut self.running, self.config.kill_grace);
        tracked_process::drain(&mut self.source, &mut self.running, self.config.kill_grace);
        for mut process in self.running.drain(..) {
            process.close_pipes(&mut self.source);
            process.finish();
        }

        if !self.failures.is_empty() {
            warn!(count = %self.failures.len(), "Discarding unreported failures");
            self.failures.clear();
        }

        self.state = self
            .state
            .transition(MonitorEvent::Stopped)
            .unwrap_or(MonitorState::Idle);
        self.launched = 0;
        self.transients = 0;
    }
}

impl<E: EventSource> Drop for ProcessMonitor<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
