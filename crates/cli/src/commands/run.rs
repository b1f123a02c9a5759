use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Result};
use colored::Colorize;
use tracing::info;

use netlab_core::domain::{RunHandle, RunRecord};
use netlab_core::port::{AsyncOptions, Shell};

use crate::output::{self, PrefixedOutput};
use crate::App;

/// Launch daemons then tasks, monitor until the tasks are done, summarize
///
/// Daemons start first so tasks can rely on them. Any failure stops every
/// remaining process before the summary is printed.
pub fn run(
    app: &App,
    tasks: &[String],
    daemons: &[String],
    step: Duration,
    json: bool,
) -> Result<()> {
    if tasks.is_empty() && daemons.is_empty() {
        bail!("Nothing to run: pass at least one --task or --daemon");
    }

    let shell = app.shell(false);
    let mut handles: Vec<RunHandle> = Vec::new();

    let launched = launch_all(&shell, daemons, tasks, &mut handles);
    let outcome = match launched {
        Ok(()) => monitor(app, step),
        Err(err) => Err(err),
    };
    app.monitor.borrow_mut().stop();

    let records: Vec<RunRecord> = handles.iter().map(RunHandle::snapshot).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if !records.is_empty() {
        println!("{}", output::records_table(&records));
    }

    match outcome {
        Ok(()) => {
            if !json {
                println!("{}", "✓ All tasks finished".green().bold());
            }
            Ok(())
        }
        Err(err) => {
            if !json {
                output::print_failure(&err);
            }
            Err(err.into())
        }
    }
}

fn launch_all(
    shell: &Rc<dyn Shell>,
    daemons: &[String],
    tasks: &[String],
    handles: &mut Vec<RunHandle>,
) -> netlab_core::Result<()> {
    let labelled = daemons
        .iter()
        .enumerate()
        .map(|(i, cmd)| (format!("d{}", i), cmd, true))
        .chain(
            tasks
                .iter()
                .enumerate()
                .map(|(i, cmd)| (format!("t{}", i), cmd, false)),
        );

    for (label, cmd, daemon) in labelled {
        let options = AsyncOptions {
            daemon,
            ..AsyncOptions::default()
        }
        .on_stdout(PrefixedOutput::stdout(&label).into_callback())
        .on_stderr(PrefixedOutput::stderr(&label).into_callback());

        let handle = shell.run_async(cmd, options)?;
        info!(label = %label, pid = %handle.pid(), cmd = %cmd, "Launched");
        handles.push(handle);
    }
    Ok(())
}

fn monitor(app: &App, step: Duration) -> netlab_core::Result<()> {
    loop {
        let running = app.monitor.borrow_mut().keep_running(step)?;
        if !running {
            return Ok(());
        }
    }
}
