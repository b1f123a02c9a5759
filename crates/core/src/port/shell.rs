// Shell Port
// The only way provisioning code reaches the OS: command lines in, run
// records out.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{RunHandle, RunRecord};
use crate::error::Result;

/// Receives each decoded output chunk of an async process, in OS order
pub type OutputCallback = Box<dyn FnMut(&str)>;

/// Options for a blocking command
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    /// Added to (or overriding) the inherited environment
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for a monitored background command
///
/// Callbacks are fixed at launch; the record they feed never changes
/// behaviour afterwards.
#[derive(Default)]
pub struct AsyncOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Daemons must outlive the run; their exit is always a failure
    pub daemon: bool,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
}

impl AsyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a daemon process
    pub fn daemon() -> Self {
        Self {
            daemon: true,
            ..Self::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn on_stdout(mut self, callback: impl FnMut(&str) + 'static) -> Self {
        self.on_stdout = Some(Box::new(callback));
        self
    }

    pub fn on_stderr(mut self, callback: impl FnMut(&str) + 'static) -> Self {
        self.on_stderr = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for AsyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOptions")
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("daemon", &self.daemon)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Command runner used by the provisioning layer
///
/// Implementations:
/// - HostShell: runs on the host through the process monitor
/// - NamespaceShell: prefixes `ip netns exec <ns>` and delegates
pub trait Shell {
    /// Run a command to completion
    ///
    /// # Errors
    /// - `Command` if the command exits non-zero
    /// - `Timeout` if it outlives `options.timeout`
    /// - `Spawn` if it cannot be started
    fn run(&self, cmd: &str, options: RunOptions) -> Result<RunRecord>;

    /// Start a command under the process monitor and return immediately
    fn run_async(&self, cmd: &str, options: AsyncOptions) -> Result<RunHandle>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::NetlabError;
    use std::cell::RefCell;

    /// Shell that records command lines instead of running them
    ///
    /// Commands containing a configured failure pattern return `Command`
    /// errors with exit code 1 and the configured stderr; commands containing a configured output
    /// pattern return that stdout.
    #[derive(Default)]
    pub struct RecordingShell {
        calls: RefCell<Vec<String>>,
        failures: RefCell<Vec<(String, String)>>,
        outputs: RefCell<Vec<(String, String)>>,
    }

    impl RecordingShell {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every command containing `pattern` fail
        pub fn fail_on(&self, pattern: impl Into<String>) {
            let pattern = pattern.into();
            let stderr = format!("mock failure: {}", pattern);
            self.fail_with(pattern, stderr);
        }

        /// Make every command containing `pattern` fail with `stderr`
        pub fn fail_with(&self, pattern: impl Into<String>, stderr: impl Into<String>) {
            self.failures
                .borrow_mut()
                .push((pattern.into(), stderr.into()));
        }

        /// Stop failing commands containing `pattern`
        pub fn clear_failures(&self) {
            self.failures.borrow_mut().clear();
        }

        /// Return `stdout` for every command containing `pattern`
        pub fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
            self.outputs
                .borrow_mut()
                .push((pattern.into(), stdout.into()));
        }

        /// Every command line seen so far, in order
        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        /// Commands seen so far that contain `pattern`
        pub fn calls_matching(&self, pattern: &str) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .filter(|c| c.contains(pattern))
                .cloned()
                .collect()
        }

        fn record(&self, cmd: &str, is_async: bool) -> RunRecord {
            self.calls.borrow_mut().push(cmd.to_string());
            let pid = self.calls.borrow().len() as u32;

            let mut record = RunRecord::new(cmd, None, pid);
            record.is_async = is_async;
            if let Some((_, stdout)) = self
                .outputs
                .borrow()
                .iter()
                .find(|(pattern, _)| cmd.contains(pattern.as_str()))
            {
                record.stdout = stdout.clone();
            }
            record
        }

        fn failure(&self, cmd: &str) -> Option<String> {
            self.failures
                .borrow()
                .iter()
                .find(|(pattern, _)| cmd.contains(pattern.as_str()))
                .map(|(_, stderr)| stderr.clone())
        }
    }

    impl Shell for RecordingShell {
        fn run(&self, cmd: &str, options: RunOptions) -> Result<RunRecord> {
            let mut record = self.record(cmd, false);
            record.cwd = options.cwd;
            record.timeout = options.timeout;

            if let Some(stderr) = self.failure(cmd) {
                record.returncode = Some(1);
                record.stderr = stderr;
                return Err(NetlabError::Command(Box::new(record)));
            }

            record.returncode = Some(0);
            Ok(record)
        }

        fn run_async(&self, cmd: &str, options: AsyncOptions) -> Result<RunHandle> {
            let mut record = self.record(cmd, true);
            record.cwd = options.cwd;
            record.is_daemon = options.daemon;
            Ok(RunHandle::new(record))
        }
    }
}
