//! Lifecycle integration tests
//!
//! Exercise the process core against real local processes: helper task
//! execution, pre/post-run ordering, the teardown registry and best-effort
//! remote retrieval.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lte_harness::lifecycle::{ProcessCore, ProcessState, SharedProcess, TeardownRegistry};
use lte_harness::paths::RunDir;
use lte_harness::process::{LocalProcess, ProcessHandle};
use lte_harness::remote::{RemoteHost, RunNode, SshTarget};
use lte_harness::HarnessError;
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn configured_core(tmp: &TempDir, name: &str) -> ProcessCore {
    let mut core = ProcessCore::new(name, RunNode::local("127.0.0.1"));
    core.run_dir = Some(RunDir::new(tmp.path().join(name)).unwrap());
    core.state = ProcessState::Configured;
    core.stop_grace = Duration::ZERO;
    core
}

#[test]
fn helper_task_args_suffix_reaches_the_script() {
    let tmp = TempDir::new().unwrap();
    let script = write_script(tmp.path(), "record_args.sh", "echo \"$1:$2\" > args.out");
    let core = configured_core(&tmp, "task_args");

    core.run_task(&format!("{} args=3,27", script.display())).unwrap();

    // The task ran in its own subdirectory named after the script.
    let out = fs::read_to_string(
        tmp.path()
            .join("task_args")
            .join("record_args.sh")
            .join("args.out"),
    )
    .unwrap();
    assert_eq!(out.trim(), "3:27");
}

#[test]
fn failing_prerun_task_aborts_before_main_launch() {
    let tmp = TempDir::new().unwrap();
    let ok = write_script(tmp.path(), "ok.sh", "touch ran.marker");
    let fail = write_script(tmp.path(), "fail.sh", "exit 1");
    let late = write_script(tmp.path(), "late.sh", "touch late.marker");

    let mut core = configured_core(&tmp, "prerun");
    core.prerun_scripts = vec![
        ok.display().to_string(),
        fail.display().to_string(),
        late.display().to_string(),
    ];

    let err = core.prerun_tasks().unwrap_err();
    assert!(matches!(err, HarnessError::Task(_)));

    // First task ran, the one after the failure never did.
    assert!(tmp.path().join("prerun/ok.sh/ran.marker").is_file());
    assert!(!tmp.path().join("prerun/late.sh/late.marker").exists());
    // And no main process was ever launched.
    assert!(core.process.is_none());
}

#[test]
fn failing_postrun_task_does_not_stop_the_rest() {
    let tmp = TempDir::new().unwrap();
    let fail = write_script(tmp.path(), "fail.sh", "exit 1");
    let collect = write_script(tmp.path(), "collect.sh", "touch collected.marker");

    let mut core = configured_core(&tmp, "postrun");
    core.postrun_scripts = vec![fail.display().to_string(), collect.display().to_string()];

    // Does not raise; the remaining tasks still run.
    core.postrun_tasks();
    assert!(tmp.path().join("postrun/collect.sh/collected.marker").is_file());
}

#[test]
fn launch_main_supervises_and_stop_terminates() {
    let tmp = TempDir::new().unwrap();
    let registry = TeardownRegistry::new();
    let mut core = configured_core(&tmp, "main");

    let handle = Box::new(LocalProcess::new(
        "main",
        core.run_dir.as_ref().unwrap().path(),
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'RRC Connected'; sleep 60".to_string(),
        ],
        Vec::new(),
    )) as Box<dyn ProcessHandle>;

    core.launch_main(&registry, handle).unwrap();
    assert_eq!(core.state, ProcessState::Running);
    assert_eq!(registry.len(), 1);
    assert!(core.running());

    // Console output accumulates from launch.
    let deadline = Instant::now() + Duration::from_secs(10);
    while core.count_in_stdout("RRC Connected") == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(core.count_in_stdout("RRC Connected"), 1);

    core.stop();
    assert_eq!(core.state, ProcessState::Terminated);
    assert!(!core.running());
}

#[test]
fn launch_failure_leaves_terminated_never_partially_running() {
    let tmp = TempDir::new().unwrap();
    let registry = TeardownRegistry::new();
    let mut core = configured_core(&tmp, "missing");

    let handle = Box::new(LocalProcess::new(
        "missing",
        core.run_dir.as_ref().unwrap().path(),
        vec!["/nonexistent/bin/srsnothing".to_string()],
        Vec::new(),
    )) as Box<dyn ProcessHandle>;

    let err = core.launch_main(&registry, handle).unwrap_err();
    assert!(matches!(err, HarnessError::Launch(_)));
    assert_eq!(core.state, ProcessState::Terminated);
    assert!(core.process.is_none());
    assert!(registry.is_empty());
}

#[test]
fn registry_unwind_stops_real_processes_in_reverse() {
    let tmp = TempDir::new().unwrap();
    let registry = TeardownRegistry::new();

    let mut handles: Vec<SharedProcess> = Vec::new();
    for name in ["epc", "enb"] {
        let dir = RunDir::new(tmp.path().join(name)).unwrap();
        let mut proc = LocalProcess::new(
            name,
            dir.path(),
            vec!["sh".to_string(), "-c".to_string(), "sleep 60".to_string()],
            Vec::new(),
        );
        proc.launch().unwrap();
        let shared: SharedProcess =
            Arc::new(Mutex::new(Box::new(proc) as Box<dyn ProcessHandle>));
        registry.remember_to_stop(shared.clone());
        handles.push(shared);
    }

    registry.unwind();
    assert!(registry.is_empty());
    for shared in &handles {
        assert!(shared.lock().unwrap().terminated());
    }
}

/// Best-effort retrieval swallows an unreachable host; the mandatory pull
/// under the same condition raises.
#[test]
fn pull_required_flag_controls_fatality() {
    let tmp = TempDir::new().unwrap();
    let run_dir = RunDir::new(tmp.path().join("run")).unwrap();
    let host = RemoteHost::new(
        run_dir,
        SshTarget {
            user: "nobody".to_string(),
            host: "host.invalid".to_string(),
        },
    );

    let remote = Path::new("/lte-harness-srsue/srsue/srsue_metrics.csv");
    let local = tmp.path().join("srsue_metrics.csv");

    // Cleanup-path retrieval: caught and logged.
    host.pull("scp-back-metrics", remote, &local, false).unwrap();

    // Mandatory mid-test retrieval: propagates.
    let err = host
        .pull("scp-back-metrics", remote, &local, true)
        .unwrap_err();
    assert!(matches!(err, HarnessError::RemoteIo(_)));
}
