//! Process monitor behaviour against real child processes

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use netlab_core::constants::DEFAULT_KILL_GRACE;
use netlab_core::domain::RunHandle;
use netlab_core::port::{AsyncOptions, RunOptions, Shell};
use netlab_core::NetlabError;
use netlab_infra_system::{HostShell, ProcessMonitor};

const STEP: Duration = Duration::from_millis(100);

/// Drive the monitor until every transient process has finished
fn run_to_completion(monitor: &mut ProcessMonitor) -> Result<(), NetlabError> {
    while monitor.keep_running(STEP)? {}
    Ok(())
}

fn collector() -> (Rc<RefCell<String>>, impl FnMut(&str) + 'static) {
    let sink = Rc::new(RefCell::new(String::new()));
    let writer = Rc::clone(&sink);
    (sink, move |chunk: &str| writer.borrow_mut().push_str(chunk))
}

#[test]
fn test_echo_hello_world() {
    let mut monitor = ProcessMonitor::new();
    let record = monitor
        .launch_sync("echo 'Hello World'", &RunOptions::new(), None)
        .unwrap();

    assert_eq!(record.stdout, "Hello World\n");
    assert_eq!(record.stderr, "");
    assert_eq!(record.returncode, Some(0));
}

#[test]
fn test_large_payloads_keep_single_newline() {
    let mut monitor = ProcessMonitor::new();

    for size in [4096, 40960] {
        let payload = "x".repeat(size);
        let record = monitor
            .launch_sync(&format!("echo {}", payload), &RunOptions::new(), None)
            .unwrap();

        assert_eq!(record.stdout.len(), size + 1);
        assert_eq!(record.stdout, format!("{}\n", payload));
    }
}

#[test]
fn test_sync_timeout_kills_within_grace() {
    let mut monitor = ProcessMonitor::new();
    let timeout = Duration::from_secs(2);

    let start = Instant::now();
    let err = monitor
        .launch_sync("sleep 10", &RunOptions::new().timeout(timeout), None)
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, NetlabError::Timeout { .. }), "got {:?}", err);
    assert!(elapsed >= timeout, "returned early after {:?}", elapsed);
    assert!(
        elapsed <= timeout + DEFAULT_KILL_GRACE + Duration::from_secs(1),
        "took {:?}",
        elapsed
    );
}

#[test]
fn test_true_with_generous_timeout() {
    let mut monitor = ProcessMonitor::new();
    let record = monitor
        .launch_sync("true", &RunOptions::new().timeout(Duration::from_secs(10)), None)
        .unwrap();

    assert_eq!(record.returncode, Some(0));
}

#[test]
fn test_sync_failure_carries_output() {
    let mut monitor = ProcessMonitor::new();
    let err = monitor
        .launch_sync("echo partial; echo broken >&2; exit 4", &RunOptions::new(), None)
        .unwrap_err();

    let record = err.record().expect("command failure carries its record");
    assert_eq!(record.returncode, Some(4));
    assert_eq!(record.stdout, "partial\n");
    assert_eq!(record.stderr, "broken\n");
}

#[test]
fn test_cwd_and_env_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.path().canonicalize().unwrap();
    let mut monitor = ProcessMonitor::new();

    let record = monitor
        .launch_sync(
            "pwd; echo $NETLAB_TEST_VALUE",
            &RunOptions::new().cwd(&dir).env("NETLAB_TEST_VALUE", "42"),
            None,
        )
        .unwrap();

    assert_eq!(record.stdout, format!("{}\n42\n", dir.display()));
}

#[test]
fn test_keep_running_without_processes() {
    let mut monitor = ProcessMonitor::new();

    let start = Instant::now();
    let err = monitor.keep_running(Duration::from_secs(5)).unwrap_err();

    assert!(matches!(err, NetlabError::NoProcesses));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_keep_running_with_only_daemons() {
    let mut monitor = ProcessMonitor::new();
    let handle = monitor
        .launch_async("sleep 30", AsyncOptions::daemon(), None)
        .unwrap();

    let start = Instant::now();
    let err = monitor.keep_running(Duration::from_secs(5)).unwrap_err();

    assert!(matches!(err, NetlabError::AllDaemons));
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(monitor.running(), 0);
    assert!(handle.returncode().is_some());
}

#[test]
fn test_daemon_exit_fails_next_step() {
    let mut monitor = ProcessMonitor::new();
    monitor
        .launch_async("sleep 0.2; exit 0", AsyncOptions::daemon(), None)
        .unwrap();
    monitor
        .launch_async("sleep 10", AsyncOptions::new(), None)
        .unwrap();

    let err = run_to_completion(&mut monitor).unwrap_err();
    monitor.stop();

    let failures = err.constituents();
    assert!(failures.iter().any(|e| e.is_daemon_exit()));
    let record = failures
        .iter()
        .find_map(|e| e.record().filter(|r| r.is_daemon))
        .unwrap();
    assert_eq!(record.cmd, "sleep 0.2; exit 0");
    assert_eq!(record.returncode, Some(0));
}

#[test]
fn test_simultaneous_daemon_exits_are_all_reported() {
    let mut monitor = ProcessMonitor::new();
    monitor
        .launch_async("exit 0", AsyncOptions::daemon(), None)
        .unwrap();
    monitor
        .launch_async("exit 5", AsyncOptions::daemon(), None)
        .unwrap();
    monitor
        .launch_async("sleep 10", AsyncOptions::new(), None)
        .unwrap();

    // Let both daemons be reaped before any failure is reported
    let deadline = Instant::now() + Duration::from_secs(5);
    while monitor.running() > 1 {
        assert!(Instant::now() < deadline, "daemons were not reaped");
        monitor.poll_step(STEP).unwrap();
    }

    let err = monitor.keep_running(STEP).unwrap_err();
    monitor.stop();

    assert!(matches!(err, NetlabError::Aggregate(_)));
    let mut codes: Vec<(String, Option<i32>)> = err
        .constituents()
        .iter()
        .filter(|e| e.is_daemon_exit())
        .filter_map(|e| e.record())
        .map(|r| (r.cmd.clone(), r.returncode))
        .collect();
    codes.sort();
    assert_eq!(
        codes,
        vec![
            ("exit 0".to_string(), Some(0)),
            ("exit 5".to_string(), Some(5)),
        ]
    );
}

#[test]
fn test_transient_failure_is_reported() {
    let mut monitor = ProcessMonitor::new();
    monitor
        .launch_async("exit 3", AsyncOptions::new(), None)
        .unwrap();

    let err = run_to_completion(&mut monitor).unwrap_err();
    monitor.stop();

    assert!(matches!(&err, NetlabError::Command(r) if r.returncode == Some(3)));
}

#[test]
fn test_tasks_finish_and_daemons_are_stopped() {
    let mut monitor = ProcessMonitor::new();
    let daemon = monitor
        .launch_async("sleep 30", AsyncOptions::daemon(), None)
        .unwrap();
    let task = monitor
        .launch_async("sleep 0.2; echo done", AsyncOptions::new(), None)
        .unwrap();

    run_to_completion(&mut monitor).unwrap();

    assert_eq!(task.returncode(), Some(0));
    assert_eq!(task.stdout(), "done\n");
    assert!(daemon.returncode().is_some());
    assert_eq!(monitor.running(), 0);
}

#[test]
fn test_callback_chunks_match_final_output() {
    let mut monitor = ProcessMonitor::new();
    let (out, on_stdout) = collector();
    let (err, on_stderr) = collector();

    let handle = monitor
        .launch_async(
            "for i in 1 2 3 4 5; do echo line $i; echo oops $i >&2; sleep 0.02; done; \
             head -c 200000 /dev/zero | tr '\\0' 'a'",
            AsyncOptions::new().on_stdout(on_stdout).on_stderr(on_stderr),
            None,
        )
        .unwrap();

    run_to_completion(&mut monitor).unwrap();

    let record = handle.snapshot();
    assert_eq!(*out.borrow(), record.stdout);
    assert_eq!(*err.borrow(), record.stderr);
    assert!(record.stdout.ends_with(&"a".repeat(1000)));
    assert_eq!(record.stderr.lines().count(), 5);
}

#[test]
fn test_stop_process_sets_returncode() {
    let mut monitor = ProcessMonitor::new();
    let daemon = monitor
        .launch_async("sleep 100", AsyncOptions::daemon(), None)
        .unwrap();
    monitor
        .launch_async("sleep 100", AsyncOptions::new(), None)
        .unwrap();

    let start = Instant::now();
    monitor.stop_process(&daemon);

    assert!(daemon.returncode().is_some());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(monitor.running(), 1);

    // Stopping a handle twice is harmless
    monitor.stop_process(&daemon);
    monitor.stop();
    assert_eq!(monitor.running(), 0);
}

#[test]
fn test_monitor_is_reusable_after_stop() {
    let mut monitor = ProcessMonitor::new();
    monitor
        .launch_async("exit 1", AsyncOptions::daemon(), None)
        .unwrap();
    monitor.stop();

    let handle: RunHandle = monitor
        .launch_async("echo again", AsyncOptions::new(), None)
        .unwrap();
    run_to_completion(&mut monitor).unwrap();

    assert_eq!(handle.stdout(), "again\n");
}

#[test]
fn test_host_shell_runs_pipelines() {
    let monitor = Rc::new(RefCell::new(ProcessMonitor::new()));
    let shell = HostShell::new(Rc::clone(&monitor));

    let record = shell
        .run("printf 'a\\nb\\nc\\n' | wc -l", RunOptions::new())
        .unwrap();
    assert_eq!(record.stdout.trim(), "3");

    let handle = shell
        .run_async("echo async", AsyncOptions::new())
        .unwrap();
    run_to_completion(&mut monitor.borrow_mut()).unwrap();
    assert_eq!(handle.stdout(), "async\n");
}
