// Central Error Type for netlab

use std::time::Duration;

use thiserror::Error;

use crate::domain::RunRecord;

/// Every failure the monitor, the shells and the provisioning layer report
///
/// Process failures carry the full [`RunRecord`] so callers see the captured
/// output. Several simultaneous failures travel together as `Aggregate`.
#[derive(Error, Debug)]
pub enum NetlabError {
    /// A synchronous command exited non-zero, or a transient async one did
    #[error("command `{}` exited with {:?}\nstdout: {}\nstderr: {}", .0.cmd, .0.returncode, .0.stdout, .0.stderr)]
    Command(Box<RunRecord>),

    /// A synchronous command did not exit within its deadline
    #[error("command `{}` timed out after {timeout:?}", .record.cmd)]
    Timeout {
        record: Box<RunRecord>,
        timeout: Duration,
    },

    /// A daemon terminated while the monitor was active
    #[error("unexpected daemon exit: `{}` (pid {}, returncode {:?})", .0.cmd, .0.pid, .0.returncode)]
    DaemonExit(Box<RunRecord>),

    #[error("all monitored processes are daemons")]
    AllDaemons,

    #[error("no processes were added to the monitor")]
    NoProcesses,

    #[error("process `{cmd}` (pid {pid}) is still running")]
    ProcessStillRunning { cmd: String, pid: u32 },

    #[error("could not match '{pattern}' in {stream} output:\n{output}")]
    Match {
        pattern: String,
        stream: &'static str,
        output: String,
    },

    #[error("failed to spawn `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("privilege elevation failed: {0}")]
    Elevation(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Several failures observed together; none is dropped
    #[error("{} failures: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<NetlabError>),
}

/// Result type alias using NetlabError
pub type Result<T> = std::result::Result<T, NetlabError>;

fn join_messages(errors: &[NetlabError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl NetlabError {
    /// Collapse a list of failures into one error
    ///
    /// Returns `None` for an empty list and the error itself for a single
    /// one. Nested aggregates are flattened.
    pub fn from_many(errors: Vec<NetlabError>) -> Option<NetlabError> {
        let mut flat = Vec::with_capacity(errors.len());
        for error in errors {
            match error {
                NetlabError::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(NetlabError::Aggregate(flat)),
        }
    }

    /// The distinct failures behind this error, flattened
    pub fn constituents(&self) -> Vec<&NetlabError> {
        match self {
            NetlabError::Aggregate(inner) => {
                inner.iter().flat_map(|e| e.constituents()).collect()
            }
            other => vec![other],
        }
    }

    /// The run record a process failure carries, if any
    pub fn record(&self) -> Option<&RunRecord> {
        match self {
            NetlabError::Command(record) | NetlabError::DaemonExit(record) => Some(record.as_ref()),
            NetlabError::Timeout { record, .. } => Some(record.as_ref()),
            _ => None,
        }
    }

    pub fn is_daemon_exit(&self) -> bool {
        matches!(self, NetlabError::DaemonExit(_))
    }
}
