// netlab Infrastructure - System Adapters
// Implements: EventSource (poll), Shell (host), CredentialProvider (sudo)

pub mod host_shell;
pub mod poller;
pub mod process_monitor;
pub mod sudo;
mod tracked_process;

pub use host_shell::HostShell;
pub use poller::PollEventSource;
pub use process_monitor::{MonitorConfig, ProcessMonitor};
pub use sudo::SudoCredentials;
pub use tracked_process::Utf8Decoder;
