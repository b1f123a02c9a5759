// Domain Layer - Pure data and rules, no OS access

pub mod base58;
pub mod monitor_state;
pub mod run_record;
pub mod scoped;

// Re-exports
pub use monitor_state::{classify_exit, ExitOutcome, MonitorEvent, MonitorState};
pub use run_record::{ResourceUsage, RunHandle, RunRecord};
pub use scoped::{default_uid, CGroupName, InterfaceName, NamespaceName, ScopeKind, Scoped, UID_MAX};
