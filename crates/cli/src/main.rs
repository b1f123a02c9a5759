//! netlab CLI - run and monitor processes inside throwaway network topologies

mod commands;
mod logging;
mod output;
mod settings;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use netlab_core::constants::DEFAULT_STEP_TIMEOUT;
use netlab_core::port::Shell;
use netlab_infra_system::{HostShell, ProcessMonitor, SudoCredentials};

use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "netlab")]
#[command(about = "Run and monitor processes inside throwaway network topologies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: ~/.config/netlab/netlab.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Elevate commands through sudo
    #[arg(long, global = true)]
    sudo: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command to completion
    Exec {
        /// Command line, passed to `sh -c`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        /// Kill the command after this many seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variable (KEY=VALUE, repeatable)
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Glob that some stdout line must match
        #[arg(long)]
        expect: Option<String>,

        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run tasks and daemons together until every task has finished
    Run {
        /// Command that must finish successfully (repeatable)
        #[arg(short, long = "task")]
        tasks: Vec<String>,

        /// Command that must keep running until the tasks finish (repeatable)
        #[arg(short, long = "daemon")]
        daemons: Vec<String>,

        /// Milliseconds per monitoring step
        #[arg(long)]
        step_ms: Option<u64>,

        /// Print the run records as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Build a two-namespace veth topology, ping across it and tear it down
    Demo {
        /// Echo requests to send
        #[arg(short = 'c', long, default_value = "3")]
        count: u32,

        /// netem delay on the first link end, in milliseconds
        #[arg(long)]
        delay_ms: Option<u32>,

        /// netem loss on the first link end, in percent
        #[arg(long)]
        loss: Option<f64>,
    },

    /// Delete namespaces left behind by netlab processes that are gone
    Sweep {
        /// Only list what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_env_pair(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

/// Wiring shared by every subcommand
pub struct App {
    pub settings: Settings,
    pub monitor: Rc<RefCell<ProcessMonitor>>,
}

impl App {
    fn new(settings: Settings) -> Self {
        let monitor = ProcessMonitor::with_config(settings.monitor_config());
        Self {
            settings,
            monitor: Rc::new(RefCell::new(monitor)),
        }
    }

    /// Host shell, elevated when configured or when `elevate` is set
    pub fn shell(&self, elevate: bool) -> Rc<dyn Shell> {
        let monitor = Rc::clone(&self.monitor);
        if self.settings.sudo || elevate {
            Rc::new(HostShell::with_sudo(monitor, Rc::new(SudoCredentials::new())))
        } else {
            Rc::new(HostShell::new(monitor))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if cli.sudo {
        settings.sudo = true;
    }

    logging::init(settings.log_format);
    debug!(settings = ?settings, "Settings loaded");

    let app = App::new(settings);

    match cli.command {
        Commands::Exec {
            command,
            timeout,
            cwd,
            env,
            expect,
            json,
        } => {
            let env: HashMap<String, String> = env.into_iter().collect();
            let request = commands::ExecRequest {
                command: command.join(" "),
                timeout: timeout.map(Duration::from_secs_f64),
                cwd,
                env,
                expect,
            };
            commands::exec(&app, request, json)
        }

        Commands::Run {
            tasks,
            daemons,
            step_ms,
            json,
        } => {
            let step = step_ms.map_or(DEFAULT_STEP_TIMEOUT, Duration::from_millis);
            commands::run(&app, &tasks, &daemons, step, json)
        }

        Commands::Demo {
            count,
            delay_ms,
            loss,
        } => commands::demo(&app, count, delay_ms, loss),

        Commands::Sweep { dry_run } => commands::sweep(&app, dry_run),
    }
}
