//! Settings loading
//!
//! Layers, lowest first: built-in defaults, the TOML settings file,
//! `NETLAB_*` environment variables. Command-line flags are applied on top
//! by `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use netlab_core::application::NetworkOptions;
use netlab_core::constants::{DEFAULT_CGROUP_ROOT, DEFAULT_KILL_GRACE, DEFAULT_POLL_INTERVAL};
use netlab_core::domain::default_uid;
use netlab_infra_system::MonitorConfig;

/// Settings file used when `--config` is not given
pub const DEFAULT_SETTINGS_PATH: &str = "~/.config/netlab/netlab.toml";

const ENV_PREFIX: &str = "NETLAB";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Elevate every command through sudo
    pub sudo: bool,
    pub log_format: LogFormat,
    /// SIGTERM to SIGKILL grace period
    pub kill_grace_ms: u64,
    /// Readiness wait inside blocking launches
    pub poll_interval_ms: u64,
    /// Scope uid for created names (defaults to the process id)
    pub uid: Option<u32>,
    pub cgroup_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sudo: false,
            log_format: LogFormat::Pretty,
            kill_grace_ms: DEFAULT_KILL_GRACE.as_millis() as u64,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            uid: None,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location
    ///
    /// An explicit path must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_string_lossy().into_owned(), true),
            None => (DEFAULT_SETTINGS_PATH.to_string(), false),
        };
        let path = shellexpand::tilde(&path).into_owned();

        Config::builder()
            .add_source(File::new(&path, FileFormat::Toml).required(required))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .with_context(|| format!("Failed to load settings from {}", path))?
            .try_deserialize()
            .with_context(|| format!("Invalid settings in {}", path))
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn network_options(&self) -> NetworkOptions {
        NetworkOptions {
            uid: self.uid.unwrap_or_else(default_uid),
            cgroup_root: self.cgroup_root.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn settings_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = settings_file(
            r#"
sudo = true
log_format = "json"
kill_grace_ms = 250
uid = 7
"#,
        );

        let settings = Settings::load(Some(file.path())).unwrap();

        assert!(settings.sudo);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.kill_grace_ms, 250);
        assert_eq!(settings.poll_interval_ms, DEFAULT_POLL_INTERVAL.as_millis() as u64);
        assert_eq!(settings.network_options().uid, 7);
        assert_eq!(settings.monitor_config().kill_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");

        assert!(Settings::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let file = settings_file("log_format = \"xml\"\n");

        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("Invalid settings"));
    }

    #[test]
    fn test_default_uid_is_process_id() {
        let settings = Settings::default();
        assert_eq!(settings.network_options().uid, std::process::id());
        assert_eq!(settings.cgroup_root, PathBuf::from(DEFAULT_CGROUP_ROOT));
    }
}
