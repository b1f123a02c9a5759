// Application Layer - Provisioning use cases over the Shell port

pub mod cgroup;
pub mod cleanup;
pub mod namespace_shell;
pub mod network;

// Re-exports
pub use cgroup::{CGroup, CGroupLimits};
pub use cleanup::{CleanupStack, Compensation, Operation, Scope};
pub use namespace_shell::NamespaceShell;
pub use network::{Netem, Network, NetworkOptions};
