// Tracked process - one child, its two output pipes and its record
// reason: nix for process-group signals and rusage (no libc in our stack)
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::resource::{getrusage, Usage, UsageWho};
use nix::sys::signal::{killpg, Signal};
use nix::sys::time::TimeVal;
use nix::unistd::Pid;
use tracing::{debug, warn};

use netlab_core::constants::{KILL_POLL_INTERVAL, READ_CHUNK_SIZE};
use netlab_core::domain::{ResourceUsage, RunHandle, RunRecord};
use netlab_core::error::{NetlabError, Result};
use netlab_core::port::{EventSource, OutputCallback, Readiness, Token};

/// How the record of a new process is flagged
#[derive(Debug, Clone, Copy)]
pub(crate) enum ProcessKind {
    Sync { timeout: Option<Duration> },
    Async { daemon: bool },
}

/// Everything needed to start one `sh -c` child
pub(crate) struct Launch<'a> {
    pub cmd: &'a str,
    pub cwd: Option<PathBuf>,
    pub env: &'a HashMap<String, String>,
    /// Written to stdin followed by a newline, then stdin is closed
    pub input: Option<&'a str>,
    pub kind: ProcessKind,
}

/// Incremental UTF-8 decoding across read boundaries
///
/// A multi-byte character split between two reads is held back until the
/// rest arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete trailing character
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is held back at end of stream
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct OutputPipe {
    file: File,
    token: Token,
    stream: Stream,
    decoder: Utf8Decoder,
    callback: Option<OutputCallback>,
}

impl OutputPipe {
    fn new(fd: OwnedFd, stream: Stream) -> Self {
        Self {
            file: File::from(fd),
            token: 0,
            stream,
            decoder: Utf8Decoder::default(),
            callback: None,
        }
    }

    fn deliver(&mut self, handle: &RunHandle, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        match self.stream {
            Stream::Stdout => handle.append_stdout(chunk),
            Stream::Stderr => handle.append_stderr(chunk),
        }
        if let Some(callback) = self.callback.as_mut() {
            callback(chunk);
        }
    }

    /// One read; returns true at end of stream
    fn read_chunk(&mut self, handle: &RunHandle) -> io::Result<bool> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let n = loop {
            match self.file.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 {
            let rest = self.decoder.finish();
            self.deliver(handle, &rest);
            return Ok(true);
        }

        let chunk = self.decoder.decode(&buf[..n]);
        self.deliver(handle, &chunk);
        Ok(false)
    }
}

/// A child process owned by the monitor
pub(crate) struct TrackedProcess {
    child: Child,
    handle: RunHandle,
    stdout: Option<OutputPipe>,
    stderr: Option<OutputPipe>,
    exit: Option<(i32, ResourceUsage)>,
}

impl TrackedProcess {
    /// Start `sh -c <cmd>` as the leader of a new process group
    ///
    /// # Errors
    /// - `Spawn` if the shell cannot be started or stdin cannot be written
    pub fn spawn(launch: Launch<'_>) -> Result<Self> {
        let spawn_error = |source: io::Error| NetlabError::Spawn {
            cmd: launch.cmd.to_string(),
            source,
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(launch.cmd)
            .envs(launch.env)
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if launch.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &launch.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(spawn_error)?;
        let pid = child.id();

        if let (Some(input), Some(mut stdin)) = (launch.input, child.stdin.take()) {
            // Dropping stdin closes it so the child sees EOF after the line
            let written = stdin
                .write_all(input.as_bytes())
                .and_then(|_| stdin.write_all(b"\n"));
            if let Err(e) = written {
                // The child may legitimately exit before reading stdin
                if e.kind() != io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(spawn_error(e));
                }
            }
        }

        let stdout = child
            .stdout
            .take()
            .map(|p| OutputPipe::new(OwnedFd::from(p), Stream::Stdout));
        let stderr = child
            .stderr
            .take()
            .map(|p| OutputPipe::new(OwnedFd::from(p), Stream::Stderr));

        let mut record = RunRecord::new(launch.cmd, launch.cwd, pid);
        match launch.kind {
            ProcessKind::Sync { timeout } => record.timeout = timeout,
            ProcessKind::Async { daemon } => {
                record.is_async = true;
                record.is_daemon = daemon;
            }
        }

        debug!(pid = %pid, cmd = %launch.cmd, "Process spawned");

        Ok(Self {
            child,
            handle: RunHandle::new(record),
            stdout,
            stderr,
            exit: None,
        })
    }

    pub fn handle(&self) -> &RunHandle {
        &self.handle
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_daemon(&self) -> bool {
        self.handle.is_daemon()
    }

    /// Callbacks receive every decoded chunk after it is appended
    pub fn set_callbacks(
        &mut self,
        on_stdout: Option<OutputCallback>,
        on_stderr: Option<OutputCallback>,
    ) {
        if let Some(pipe) = self.stdout.as_mut() {
            pipe.callback = on_stdout;
        }
        if let Some(pipe) = self.stderr.as_mut() {
            pipe.callback = on_stderr;
        }
    }

    /// Register both pipes, taking tokens from `next_token`
    pub fn register<E: EventSource>(
        &mut self,
        source: &mut E,
        next_token: &mut Token,
    ) -> io::Result<()> {
        for pipe in [self.stdout.as_mut(), self.stderr.as_mut()].into_iter().flatten() {
            pipe.token = *next_token;
            *next_token += 1;
            source.register(pipe.file.as_raw_fd(), pipe.token)?;
        }
        Ok(())
    }

    pub fn owns(&self, token: Token) -> bool {
        [self.stdout.as_ref(), self.stderr.as_ref()]
            .into_iter()
            .flatten()
            .any(|pipe| pipe.token == token)
    }

    /// Read once from the pipe behind `readiness`, unregistering it at EOF
    pub fn service<E: EventSource>(&mut self, source: &mut E, readiness: Readiness) {
        let matches = |pipe: &Option<OutputPipe>| {
            pipe.as_ref().is_some_and(|p| p.token == readiness.token)
        };
        let slot = if matches(&self.stdout) {
            &mut self.stdout
        } else if matches(&self.stderr) {
            &mut self.stderr
        } else {
            return;
        };
        let Some(pipe) = slot.as_mut() else {
            return;
        };

        let closed = if readiness.readable || readiness.hangup {
            match pipe.read_chunk(&self.handle) {
                Ok(eof) => eof,
                Err(e) => {
                    warn!(pid = %self.child.id(), error = %e, "Pipe read failed");
                    true
                }
            }
        } else {
            readiness.error
        };

        if closed {
            source.unregister(readiness.token);
            // Dropping the pipe closes the descriptor after unregistering it
            *slot = None;
        }
    }

    /// Unregister and close any pipe still open
    pub fn close_pipes<E: EventSource>(&mut self, source: &mut E) {
        for slot in [&mut self.stdout, &mut self.stderr] {
            if let Some(mut pipe) = slot.take() {
                source.unregister(pipe.token);
                let rest = pipe.decoder.finish();
                pipe.deliver(&self.handle, &rest);
            }
        }
    }

    pub fn pipes_closed(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    /// Both pipes drained and the exit status reaped
    pub fn is_dead(&self) -> bool {
        self.pipes_closed() && self.has_exited()
    }

    /// Reap the child if it has exited; returns true once the status is known
    pub fn poll_exit(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }

        let before = children_usage();
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status, before);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = %self.child.id(), error = %e, "Failed to query exit status");
                false
            }
        }
    }

    /// Block until the child is reaped
    fn wait_exit(&mut self) {
        if self.exit.is_some() {
            return;
        }

        let before = children_usage();
        match self.child.wait() {
            Ok(status) => self.record_exit(status, before),
            Err(e) => {
                warn!(pid = %self.child.id(), error = %e, "Failed to wait for process");
                self.exit = Some((-(Signal::SIGKILL as i32), ResourceUsage::default()));
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus, before: Option<ResourceUsage>) {
        let code = exit_code(status);
        let usage = match (before, children_usage()) {
            (Some(before), Some(after)) => ResourceUsage {
                user_time: after.user_time.saturating_sub(before.user_time),
                system_time: after.system_time.saturating_sub(before.system_time),
            },
            _ => ResourceUsage::default(),
        };
        debug!(pid = %self.child.id(), returncode = %code, "Process exited");
        self.exit = Some((code, usage));
    }

    fn signal_group(&self, signal: Signal) {
        let pgid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = killpg(pgid, signal) {
            debug!(pid = %pgid, signal = %signal, error = %e, "killpg failed");
        }
    }

    /// Copy the exit status into the record; the record is final afterwards
    pub fn finish(&mut self) -> Option<i32> {
        let (code, usage) = self.exit?;
        self.handle.finish(code, usage);
        Some(code)
    }
}

impl std::fmt::Debug for TrackedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedProcess")
            .field("pid", &self.child.id())
            .field("cmd", &self.handle.cmd())
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

/// Kill policy: SIGTERM each process group, wait out `grace`, SIGKILL the rest
///
/// Every process is reaped when this returns.
pub(crate) fn terminate(processes: &mut [TrackedProcess], grace: Duration) {
    for process in processes.iter_mut() {
        if !process.poll_exit() {
            debug!(pid = %process.pid(), "Sending SIGTERM to process group");
            process.signal_group(Signal::SIGTERM);
        }
    }

    let deadline = Instant::now() + grace;
    while processes.iter_mut().any(|p| !p.poll_exit()) && Instant::now() < deadline {
        thread::sleep(KILL_POLL_INTERVAL);
    }

    for process in processes.iter_mut() {
        if process.poll_exit() {
            continue;
        }
        warn!(
            pid = %process.pid(),
            grace_ms = %grace.as_millis(),
            "Process did not exit after SIGTERM, sending SIGKILL"
        );
        process.signal_group(Signal::SIGKILL);
        process.wait_exit();
    }
}

/// Read whatever output is already buffered, for at most `limit`
///
/// Used after termination; a descendant that escaped the process group can
/// keep a pipe open forever, so this never blocks on an idle pipe.
pub(crate) fn drain<E: EventSource>(
    source: &mut E,
    processes: &mut [TrackedProcess],
    limit: Duration,
) {
    let deadline = Instant::now() + limit;

    while Instant::now() < deadline {
        if processes.iter().all(TrackedProcess::pipes_closed) {
            break;
        }
        // Other processes' pipes on a shared source stay ready; skip them
        let ready: Vec<Readiness> = match source.poll(Duration::ZERO) {
            Ok(ready) => ready
                .into_iter()
                .filter(|r| processes.iter().any(|p| p.owns(r.token)))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Poll failed while draining output");
                break;
            }
        };
        if ready.is_empty() {
            break;
        }
        dispatch(source, processes, ready);
    }
}

/// Route readiness events to the processes owning them
pub(crate) fn dispatch<E: EventSource>(
    source: &mut E,
    processes: &mut [TrackedProcess],
    ready: Vec<Readiness>,
) {
    for readiness in ready {
        if let Some(process) = processes.iter_mut().find(|p| p.owns(readiness.token)) {
            process.service(source, readiness);
        }
    }
}

/// Exit code, or the negated signal number for a signalled process
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

fn children_usage() -> Option<ResourceUsage> {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => Some(usage_of(&usage)),
        Err(e) => {
            debug!(error = %e, "getrusage failed");
            None
        }
    }
}

fn usage_of(usage: &Usage) -> ResourceUsage {
    ResourceUsage {
        user_time: duration_of(usage.user_time()),
        system_time: duration_of(usage.system_time()),
    }
}

fn duration_of(time: TimeVal) -> Duration {
    let secs = u64::try_from(time.tv_sec()).unwrap_or(0);
    let micros = u64::try_from(time.tv_usec()).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}
