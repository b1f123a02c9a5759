use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use netlab_core::domain::RunRecord;
use netlab_core::port::RunOptions;

use crate::output;
use crate::App;

pub struct ExecRequest {
    pub command: String,
    pub timeout: Option<Duration>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub expect: Option<String>,
}

impl ExecRequest {
    fn options(&self) -> RunOptions {
        RunOptions {
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            timeout: self.timeout,
        }
    }
}

/// Run one command and show its record, also when it failed
pub fn exec(app: &App, request: ExecRequest, json: bool) -> Result<()> {
    let shell = app.shell(false);
    let report = |record: &RunRecord| -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(record)?);
        } else {
            output::print_record(record);
        }
        Ok(())
    };

    match shell.run(&request.command, request.options()) {
        Ok(record) => {
            report(&record)?;
            if let Some(pattern) = &request.expect {
                record.match_output(Some(pattern.as_str()), None)?;
            }
            Ok(())
        }
        Err(err) => {
            if let Some(record) = err.record() {
                report(record)?;
            }
            Err(err.into())
        }
    }
}
