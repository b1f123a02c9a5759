// CGroup - cgroup v2 resource limits driven through the shell
//
// Directory creation and controller writes go through the (elevated) shell.
// Existence checks and reading `cgroup.procs` use the filesystem directly,
// which the cgroup2 mount allows for unprivileged readers.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::info;

use crate::domain::CGroupName;
use crate::error::{NetlabError, Result};
use crate::port::{RunOptions, Shell};

/// Period written to `cpu.max` alongside the quota (100ms)
pub const CPU_PERIOD_US: u64 = 100_000;

/// Controller limits for one cgroup
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CGroupLimits {
    /// Share of one CPU, in (0, 1]
    pub cpu_max: Option<f64>,
    /// Memory throttling threshold in bytes, > 0
    pub memory_high: Option<u64>,
}

impl CGroupLimits {
    /// # Errors
    /// - `InvalidInput` if a limit is out of range
    pub fn validate(&self) -> Result<()> {
        if let Some(cpu) = self.cpu_max {
            if !(cpu > 0.0 && cpu <= 1.0) {
                return Err(NetlabError::InvalidInput(format!(
                    "cpu.max must be in range (0, 1], was {}",
                    cpu
                )));
            }
        }
        if self.memory_high == Some(0) {
            return Err(NetlabError::InvalidInput(
                "memory.high must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// (controller file, value) pairs for the limits that are set
    fn writes(&self) -> Vec<(&'static str, String)> {
        let mut writes = Vec::new();
        if let Some(cpu) = self.cpu_max {
            let quota = (cpu * CPU_PERIOD_US as f64) as u64;
            writes.push(("cpu.max", format!("{} {}", quota, CPU_PERIOD_US)));
        }
        if let Some(bytes) = self.memory_high {
            writes.push(("memory.high", bytes.to_string()));
        }
        writes
    }
}

/// One cgroup under a cgroup v2 hierarchy
pub struct CGroup {
    name: CGroupName,
    root: PathBuf,
    path: PathBuf,
    limits: CGroupLimits,
    shell: Rc<dyn Shell>,
    pids: Vec<u32>,
}

impl CGroup {
    /// # Errors
    /// - `InvalidInput` if the limits are out of range
    pub fn new(
        name: CGroupName,
        shell: Rc<dyn Shell>,
        root: impl Into<PathBuf>,
        limits: CGroupLimits,
    ) -> Result<Self> {
        limits.validate()?;
        let root = root.into();
        let path = root.join(name.scoped());
        Ok(Self {
            name,
            root,
            path,
            limits,
            shell,
            pids: Vec::new(),
        })
    }

    pub fn name(&self) -> &CGroupName {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn limits(&self) -> CGroupLimits {
        self.limits
    }

    /// Processes added through [`add_pid`](Self::add_pid)
    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the cgroup and apply its limits
    ///
    /// # Arguments
    /// * `force` - Replace a cgroup of the same name instead of failing
    ///
    /// # Errors
    /// - `InvalidState` if the cgroup exists and `force` is false
    pub fn build(&mut self, force: bool) -> Result<()> {
        if self.exists() {
            if !force {
                return Err(NetlabError::InvalidState(format!(
                    "cgroup {} already exists",
                    self.name
                )));
            }
            self.delete(true)?;
        }

        self.make()?;
        self.set_limits()
    }

    /// Create the cgroup directory
    ///
    /// # Errors
    /// - `InvalidState` if it already exists
    pub fn make(&self) -> Result<()> {
        if self.exists() {
            return Err(NetlabError::InvalidState(format!(
                "cgroup {} already exists",
                self.name
            )));
        }

        self.run(&format!("mkdir {}", self.path.display()))?;
        info!(cgroup = %self.name, path = %self.path.display(), "CGroup created");
        Ok(())
    }

    /// Remove the cgroup directory
    ///
    /// # Errors
    /// - `InvalidState` if it does not exist and `not_exist_ok` is false
    /// - `InvalidState` if processes still run inside it
    pub fn delete(&self, not_exist_ok: bool) -> Result<()> {
        if !self.exists() {
            if not_exist_ok {
                return Ok(());
            }
            return Err(NetlabError::InvalidState(format!(
                "cgroup {} does not exist",
                self.name
            )));
        }

        match self.run(&format!("rmdir {}", self.path.display())) {
            Ok(_) => {
                info!(cgroup = %self.name, "CGroup deleted");
                Ok(())
            }
            Err(NetlabError::Command(record)) if record.stderr.contains("No such file") => {
                info!(cgroup = %self.name, "CGroup already gone");
                Ok(())
            }
            Err(NetlabError::Command(record))
                if record.stderr.contains("Device or resource busy") =>
            {
                Err(NetlabError::InvalidState(format!(
                    "cgroup {} is busy; stop its processes before deleting it",
                    self.name
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Enable the needed controllers and write every configured limit
    ///
    /// # Errors
    /// - `InvalidState` if a controller file does not appear after enabling
    pub fn set_limits(&self) -> Result<()> {
        for (file, value) in self.limits.writes() {
            self.enable_controller(file)?;
            self.write(&self.path.join(file), &value)?;
            info!(cgroup = %self.name, controller = %file, value = %value, "Limit set");
        }
        Ok(())
    }

    fn enable_controller(&self, file: &str) -> Result<()> {
        let controller = file.split('.').next().unwrap_or(file);
        self.write(
            &self.root.join("cgroup.subtree_control"),
            &format!("+{}", controller),
        )?;

        if !self.path.join(file).exists() {
            return Err(NetlabError::InvalidState(format!(
                "controller file {} not found in {}",
                file,
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Move a running process into the cgroup
    ///
    /// # Errors
    /// - `InvalidInput` if no process with that pid is running
    pub fn add_pid(&mut self, pid: u32) -> Result<()> {
        if !Path::new("/proc").join(pid.to_string()).exists() {
            return Err(NetlabError::InvalidInput(format!(
                "process {} is not running",
                pid
            )));
        }

        self.write(&self.path.join("cgroup.procs"), &pid.to_string())?;
        if !self.pids.contains(&pid) {
            self.pids.push(pid);
        }
        Ok(())
    }

    /// Release every tracked process and remove the cgroup
    ///
    /// Tracked processes still inside are moved back to the root cgroup;
    /// anything left is killed through `cgroup.kill`.
    pub fn hard_clean(&mut self) -> Result<()> {
        if !self.pids.is_empty() && self.exists() {
            let procs = std::fs::read_to_string(self.path.join("cgroup.procs"))?;
            let active: Vec<u32> = procs
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect();

            for pid in self.pids.iter().filter(|p| active.contains(p)) {
                self.write(&self.root.join("cgroup.procs"), &pid.to_string())?;
            }
            self.write(&self.path.join("cgroup.kill"), "1")?;
        }

        self.delete(true)?;
        self.pids.clear();
        info!(cgroup = %self.name, "CGroup cleaned");
        Ok(())
    }

    fn write(&self, file: &Path, value: &str) -> Result<()> {
        self.run(&format!("echo '{}' | tee {}", value, file.display()))
            .map(|_| ())
    }

    fn run(&self, cmd: &str) -> Result<()> {
        self.shell.run(cmd, RunOptions::new()).map(|_| ())
    }
}
