//! Terminal output: record summaries, error listings, prefixed live output

use colored::{ColoredString, Colorize};
use tabled::{Table, Tabled};

use netlab_core::domain::RunRecord;
use netlab_core::NetlabError;

#[derive(Tabled)]
pub struct RecordRow {
    pid: u32,
    kind: &'static str,
    command: String,
    returncode: String,
    user: String,
    system: String,
}

impl From<&RunRecord> for RecordRow {
    fn from(record: &RunRecord) -> Self {
        let kind = if record.is_daemon {
            "daemon"
        } else if record.is_async {
            "task"
        } else {
            "sync"
        };
        Self {
            pid: record.pid,
            kind,
            command: record.cmd.clone(),
            returncode: record
                .returncode
                .map_or_else(|| "-".to_string(), |code| code.to_string()),
            user: format!("{:.3}s", record.usage.user_time.as_secs_f64()),
            system: format!("{:.3}s", record.usage.system_time.as_secs_f64()),
        }
    }
}

pub fn records_table(records: &[RunRecord]) -> String {
    Table::new(records.iter().map(RecordRow::from)).to_string()
}

/// Print captured output followed by a one-line status
pub fn print_record(record: &RunRecord) {
    if !record.stdout.is_empty() {
        print!("{}", record.stdout);
    }
    if !record.stderr.is_empty() {
        eprint!("{}", record.stderr);
    }

    match record.returncode {
        Some(0) => println!("{}", "✓ exited with 0".green().bold()),
        Some(code) => println!("{}", format!("✗ exited with {}", code).red().bold()),
        None => println!("{}", "… still running".yellow()),
    }
}

/// List every constituent failure
pub fn print_failure(error: &NetlabError) {
    let failures = error.constituents();
    println!(
        "{}",
        format!("✗ {} failure(s)", failures.len()).red().bold()
    );
    for failure in failures {
        match failure.record() {
            Some(record) => println!(
                "  {} {} (pid {}, returncode {:?})",
                "✗".red(),
                record.cmd,
                record.pid,
                record.returncode
            ),
            None => println!("  {} {}", "✗".red(), failure),
        }
    }
}

/// Splits a chunk stream into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed, without newlines
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// The trailing partial line, if any
    pub fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Live output of one process, one prefixed line at a time
///
/// A partial last line is printed when the output callback is dropped, which
/// happens once its pipe reaches EOF.
pub struct PrefixedOutput {
    prefix: ColoredString,
    to_stderr: bool,
    lines: LineBuffer,
}

impl PrefixedOutput {
    pub fn stdout(label: &str) -> Self {
        Self {
            prefix: format!("[{}]", label).cyan(),
            to_stderr: false,
            lines: LineBuffer::default(),
        }
    }

    pub fn stderr(label: &str) -> Self {
        Self {
            prefix: format!("[{}]", label).yellow(),
            to_stderr: true,
            lines: LineBuffer::default(),
        }
    }

    pub fn into_callback(mut self) -> impl FnMut(&str) + 'static {
        move |chunk| {
            for line in self.lines.push(chunk) {
                self.emit(&line);
            }
        }
    }

    fn emit(&self, line: &str) {
        if self.to_stderr {
            eprintln!("{} {}", self.prefix, line);
        } else {
            println!("{} {}", self.prefix, line);
        }
    }
}

impl Drop for PrefixedOutput {
    fn drop(&mut self) {
        if let Some(rest) = self.lines.take_rest() {
            self.emit(&rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_core::domain::ResourceUsage;
    use std::time::Duration;

    #[test]
    fn test_line_buffer_joins_split_chunks() {
        let mut lines = LineBuffer::default();

        assert!(lines.push("hel").is_empty());
        assert_eq!(lines.push("lo\nwor"), vec!["hello"]);
        assert_eq!(lines.push("ld\r\n\nend"), vec!["world", ""]);
        assert_eq!(lines.take_rest().as_deref(), Some("end"));
        assert_eq!(lines.take_rest(), None);
    }

    #[test]
    fn test_record_row_formatting() {
        let mut record = RunRecord::new("sleep 1", None, 42);
        record.is_async = true;
        record.is_daemon = true;
        record.usage = ResourceUsage {
            user_time: Duration::from_millis(1500),
            system_time: Duration::ZERO,
        };

        let row = RecordRow::from(&record);
        assert_eq!(row.kind, "daemon");
        assert_eq!(row.returncode, "-");
        assert_eq!(row.user, "1.500s");

        record.returncode = Some(-15);
        assert_eq!(RecordRow::from(&record).returncode, "-15");
    }

    #[test]
    fn test_records_table_lists_commands() {
        let table = records_table(&[
            RunRecord::new("echo a", None, 1),
            RunRecord::new("echo b", None, 2),
        ]);
        assert!(table.contains("echo a"));
        assert!(table.contains("echo b"));
        assert!(table.contains("returncode"));
    }
}
