// Run Record - ledger of one command's inputs and evolving output

use std::cell::{Ref, RefCell};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use globset::Glob;
use serde::Serialize;
use tracing::warn;

use crate::error::{NetlabError, Result};

/// CPU time consumed by a finished process and its reaped descendants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,
}

/// Inputs and results of one command
///
/// The monitor appends output while the process runs and sets `returncode`
/// once the exit status is reaped. After that the record no longer changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub cmd: String,
    pub cwd: Option<PathBuf>,
    pub pid: u32,
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or the negated signal number if the process was killed
    pub returncode: Option<i32>,
    pub is_async: bool,
    pub is_daemon: bool,
    pub timeout: Option<Duration>,
    pub usage: ResourceUsage,
}

impl RunRecord {
    pub fn new(cmd: impl Into<String>, cwd: Option<PathBuf>, pid: u32) -> Self {
        Self {
            cmd: cmd.into(),
            cwd,
            pid,
            ..Default::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.returncode.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.returncode == Some(0)
    }

    /// Match output lines against shell-style glob patterns
    ///
    /// Each pattern must match at least one line of its stream. Supported
    /// wildcards are `*`, `?`, `[seq]` and `[!seq]`.
    ///
    /// # Example
    /// ```text
    /// record.match_output(Some("10 packets transmitted*"), None)?;
    /// ```
    pub fn match_output(&self, stdout: Option<&str>, stderr: Option<&str>) -> Result<()> {
        if let Some(pattern) = stdout {
            match_lines(pattern, "stdout", &self.stdout)?;
        }
        if let Some(pattern) = stderr {
            match_lines(pattern, "stderr", &self.stderr)?;
        }
        Ok(())
    }
}

fn match_lines(pattern: &str, stream: &'static str, output: &str) -> Result<()> {
    let matcher = Glob::new(pattern)
        .map_err(|e| NetlabError::InvalidInput(format!("bad pattern '{}': {}", pattern, e)))?
        .compile_matcher();

    if output.lines().any(|line| matcher.is_match(line)) {
        return Ok(());
    }

    Err(NetlabError::Match {
        pattern: pattern.to_string(),
        stream,
        output: output.to_string(),
    })
}

impl fmt::Display for RunRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RunRecord")?;
        writeln!(f, "command: {}", self.cmd)?;
        writeln!(f, "cwd: {:?}", self.cwd)?;
        writeln!(f, "pid: {}", self.pid)?;
        writeln!(f, "returncode: {:?}", self.returncode)?;
        writeln!(f, "stdout: \n{}", self.stdout)?;
        writeln!(f, "stderr: \n{}", self.stderr)?;
        writeln!(f, "is_async: {}", self.is_async)?;
        writeln!(f, "is_daemon: {}", self.is_daemon)?;
        write!(f, "timeout: {:?}", self.timeout)
    }
}

/// Shared view of a record owned jointly by the caller and the monitor
///
/// Cloning the handle shares the same record. Handles are `!Send`: records
/// are only ever touched from the thread that drives the monitor.
#[derive(Debug, Clone)]
pub struct RunHandle(Rc<RefCell<RunRecord>>);

impl RunHandle {
    pub fn new(record: RunRecord) -> Self {
        Self(Rc::new(RefCell::new(record)))
    }

    /// Borrow the current state of the record
    ///
    /// Do not hold the borrow across calls into the monitor.
    pub fn borrow(&self) -> Ref<'_, RunRecord> {
        self.0.borrow()
    }

    /// Copy of the record as it is right now
    pub fn snapshot(&self) -> RunRecord {
        self.0.borrow().clone()
    }

    /// The finished record
    ///
    /// # Errors
    /// - `ProcessStillRunning` while the exit status has not been observed
    pub fn result(&self) -> Result<RunRecord> {
        let record = self.0.borrow();
        if !record.is_finished() {
            return Err(NetlabError::ProcessStillRunning {
                cmd: record.cmd.clone(),
                pid: record.pid,
            });
        }
        Ok(record.clone())
    }

    pub fn pid(&self) -> u32 {
        self.0.borrow().pid
    }

    pub fn cmd(&self) -> String {
        self.0.borrow().cmd.clone()
    }

    pub fn stdout(&self) -> String {
        self.0.borrow().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.0.borrow().stderr.clone()
    }

    pub fn returncode(&self) -> Option<i32> {
        self.0.borrow().returncode
    }

    pub fn is_daemon(&self) -> bool {
        self.0.borrow().is_daemon
    }

    pub fn is_finished(&self) -> bool {
        self.0.borrow().is_finished()
    }

    /// True if both handles point at the same record
    pub fn same_record(&self, other: &RunHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Append a decoded stdout chunk (process monitor only)
    pub fn append_stdout(&self, chunk: &str) {
        self.append(chunk, |r| &mut r.stdout);
    }

    /// Append a decoded stderr chunk (process monitor only)
    pub fn append_stderr(&self, chunk: &str) {
        self.append(chunk, |r| &mut r.stderr);
    }

    fn append(&self, chunk: &str, field: impl FnOnce(&mut RunRecord) -> &mut String) {
        let mut record = self.0.borrow_mut();
        if record.is_finished() {
            warn!(pid = record.pid, "output arrived for a finished record; dropped");
            return;
        }
        field(&mut record).push_str(chunk);
    }

    /// Record the exit status (process monitor only)
    ///
    /// The first call wins; the record is read-only afterwards.
    pub fn finish(&self, returncode: i32, usage: ResourceUsage) {
        let mut record = self.0.borrow_mut();
        if record.is_finished() {
            return;
        }
        record.returncode = Some(returncode);
        record.usage = usage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_record() -> RunRecord {
        let mut record = RunRecord::new("ping -c 10 10.0.0.2", None, 42);
        record.stdout = "PING 10.0.0.2\n10 packets transmitted, 10 received\n".to_string();
        record.returncode = Some(0);
        record
    }

    #[test]
    fn test_match_output() {
        let record = ping_record();
        assert!(record.match_output(Some("10 packets transmitted*"), None).is_ok());
        assert!(record.match_output(Some("PING ?0.0.0.[0-9]"), None).is_ok());

        let err = record.match_output(Some("*unreachable*"), None).unwrap_err();
        assert!(matches!(err, NetlabError::Match { stream: "stdout", .. }));

        let err = record.match_output(None, Some("*")).unwrap_err();
        assert!(matches!(err, NetlabError::Match { stream: "stderr", .. }));
    }

    #[test]
    fn test_handle_result_requires_exit() {
        let handle = RunHandle::new(RunRecord::new("sleep 1", None, 7));
        assert!(matches!(
            handle.result(),
            Err(NetlabError::ProcessStillRunning { pid: 7, .. })
        ));

        handle.append_stdout("partial");
        handle.finish(0, ResourceUsage::default());
        assert_eq!(handle.result().unwrap().stdout, "partial");
    }

    #[test]
    fn test_record_is_read_only_after_finish() {
        let handle = RunHandle::new(RunRecord::new("true", None, 1));
        let other = handle.clone();
        handle.finish(-15, ResourceUsage::default());
        other.finish(0, ResourceUsage::default());
        other.append_stderr("late");

        assert_eq!(handle.returncode(), Some(-15));
        assert_eq!(handle.stderr(), "");
        assert!(handle.same_record(&other));
    }

    #[test]
    fn test_record_serializes_for_reports() {
        let json = serde_json::to_value(ping_record()).unwrap();
        assert_eq!(json["cmd"], "ping -c 10 10.0.0.2");
        assert_eq!(json["returncode"], 0);
        assert_eq!(json["is_daemon"], false);
    }
}
