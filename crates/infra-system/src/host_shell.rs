// Host shell - runs commands on the host through the process monitor
use std::cell::RefCell;
use std::rc::Rc;

use nix::unistd::geteuid;
use tracing::debug;

use netlab_core::domain::{RunHandle, RunRecord};
use netlab_core::error::Result;
use netlab_core::port::{AsyncOptions, CredentialProvider, RunOptions, Shell};

use crate::process_monitor::ProcessMonitor;

/// Prefix used when sudo needs no password
pub const SUDO_NON_INTERACTIVE: &str = "sudo --preserve-env --non-interactive";

/// Prefix used when the password is piped to stdin
pub const SUDO_STDIN: &str = "sudo --preserve-env --stdin --prompt=";

/// Shell adapter for the host
///
/// With elevation enabled every command is wrapped as
/// `sudo ... sh -c '<cmd>'`, so pipes and redirections run elevated too.
/// Elevation is skipped when already running as root.
///
/// Async output callbacks run inside `keep_running`, while the monitor is
/// borrowed; they must not call back into this shell.
pub struct HostShell {
    monitor: Rc<RefCell<ProcessMonitor>>,
    credentials: Option<Rc<dyn CredentialProvider>>,
}

impl HostShell {
    /// Shell without elevation
    pub fn new(monitor: Rc<RefCell<ProcessMonitor>>) -> Self {
        Self {
            monitor,
            credentials: None,
        }
    }

    /// Shell elevating every command through sudo
    pub fn with_sudo(
        monitor: Rc<RefCell<ProcessMonitor>>,
        credentials: Rc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            monitor,
            credentials: Some(credentials),
        }
    }

    pub fn monitor(&self) -> Rc<RefCell<ProcessMonitor>> {
        Rc::clone(&self.monitor)
    }

    pub fn is_elevated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Final command line and the stdin input for it
    fn prepare(&self, cmd: &str) -> Result<(String, Option<String>)> {
        let Some(credentials) = &self.credentials else {
            return Ok((cmd.to_string(), None));
        };
        if geteuid().is_root() {
            return Ok((cmd.to_string(), None));
        }

        let credential = credentials.credential()?;
        Ok((elevate(cmd, credential.is_some()), credential))
    }
}

/// Wrap a command for sudo
pub fn elevate(cmd: &str, with_password: bool) -> String {
    let prefix = if with_password {
        SUDO_STDIN
    } else {
        SUDO_NON_INTERACTIVE
    };
    format!("{} sh -c {}", prefix, shell_quote(cmd))
}

/// Single-quote a string for `sh`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

impl Shell for HostShell {
    fn run(&self, cmd: &str, options: RunOptions) -> Result<RunRecord> {
        let (cmd, input) = self.prepare(cmd)?;
        debug!(cmd = %cmd, elevated = %input.is_some(), "HostShell run");
        self.monitor
            .borrow_mut()
            .launch_sync(&cmd, &options, input.as_deref())
    }

    fn run_async(&self, cmd: &str, options: AsyncOptions) -> Result<RunHandle> {
        let (cmd, input) = self.prepare(cmd)?;
        debug!(cmd = %cmd, daemon = %options.daemon, "HostShell run_async");
        self.monitor
            .borrow_mut()
            .launch_async(&cmd, options, input.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_core::port::credentials::mocks::StaticCredentials;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("echo 'x'"), r"'echo '\''x'\'''");
    }

    #[test]
    fn test_elevate_prefixes() {
        assert_eq!(
            elevate("ip link", false),
            "sudo --preserve-env --non-interactive sh -c 'ip link'"
        );
        assert_eq!(
            elevate("echo 1 | tee /x", true),
            "sudo --preserve-env --stdin --prompt= sh -c 'echo 1 | tee /x'"
        );
    }

    #[test]
    fn test_plain_shell_runs_commands() {
        let shell = HostShell::new(Rc::new(RefCell::new(ProcessMonitor::new())));
        let record = shell.run("echo 'Hello World'", RunOptions::new()).unwrap();
        assert_eq!(record.stdout, "Hello World\n");
        assert!(!shell.is_elevated());
    }

    #[test]
    fn test_sudo_prefix_follows_credentials() {
        let credentials = Rc::new(StaticCredentials::new(None));
        let shell = HostShell::with_sudo(
            Rc::new(RefCell::new(ProcessMonitor::new())),
            credentials.clone(),
        );

        let (first, input) = shell.prepare("ip link").unwrap();
        shell.prepare("ip addr").unwrap();

        assert_eq!(input, None);
        if geteuid().is_root() {
            assert_eq!(first, "ip link");
            assert_eq!(credentials.call_count(), 0);
        } else {
            assert!(first.starts_with(SUDO_NON_INTERACTIVE));
            assert_eq!(credentials.call_count(), 2);
        }
    }
}
