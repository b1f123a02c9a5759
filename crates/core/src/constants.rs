// Shared constants (no magic values in adapters)
use std::time::Duration;

/// Grace period between SIGTERM and SIGKILL when terminating a process group (500ms)
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Interval between reap attempts while waiting out the kill grace period (10ms)
pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for a single readiness wait inside a blocking launch (50ms)
/// Keeps exit detection responsive once both pipes have closed.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default timeout for one `keep_running` step (500ms)
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_millis(500);

/// Bytes read from a pipe per readiness event (64 KiB, one Linux pipe buffer)
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Environment variable consulted before prompting for the sudo password
pub const SUDO_PASSWORD_ENV: &str = "NETLAB_SUDO_PASSWORD";

/// Prefix of every scoped OS object name (`n-<uid>-<name>`)
pub const SCOPE_PREFIX: &str = "n";

/// Default cgroup v2 mount point
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Name of the initial network namespace as understood by `ip link set ... netns`
pub const HOST_NETNS: &str = "1";
