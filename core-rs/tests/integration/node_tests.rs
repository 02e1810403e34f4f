//! Node integration tests
//!
//! Drive the controlled-process wrappers end to end on the local host with a
//! scripted stand-in for the vendor binary.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lte_harness::lifecycle::{ControlledProcess, ProcessState};
use lte_harness::paths::{ArtifactKind, RunDir};
use lte_harness::remote::RunNode;
use lte_harness::resource::SubscriberSpec;
use lte_harness::template::{DirTemplates, YamlRenderer};
use lte_harness::{EnbNode, EpcNode, HarnessError, TestEnv};
use serde_yaml::Value;
use tempfile::TempDir;

fn yaml(s: &str) -> Value {
    serde_yaml::from_str(s).unwrap()
}

fn write_executable(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// Fake installation tree whose binary emits base-station markers and then
/// idles until stopped.
fn fake_enb_inst(root: &Path) {
    fs::create_dir_all(root.join("lib")).unwrap();
    fs::create_dir_all(root.join("bin")).unwrap();
    write_executable(
        &root.join("bin").join(EnbNode::BINFILE),
        "echo 'RACH: prach detected'\necho 'RACH: prach detected'\nwhile true; do sleep 0.2; done",
    );
}

fn fake_epc_inst(root: &Path) {
    fs::create_dir_all(root.join("lib")).unwrap();
    fs::create_dir_all(root.join("bin")).unwrap();
    write_executable(&root.join("bin").join(EpcNode::BINFILE), "sleep 60");
}

fn enb_env(tmp: &TempDir) -> TestEnv {
    fake_enb_inst(&tmp.path().join("inst"));
    TestEnv::new(
        RunDir::new(tmp.path().join("run")).unwrap(),
        tmp.path().join("inst"),
        yaml("{srsenb: {id: 0x19B}}"),
        yaml("{}"),
        Box::new(YamlRenderer),
    )
}

#[test]
fn enb_full_local_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let env = enb_env(&tmp);

    let mut enb = EnbNode::new(RunNode::local("127.0.1.2"), yaml("{rf_dev_type: zmq}")).unwrap();
    enb.core_mut().stop_grace = Duration::ZERO;
    enb.set_epc_addr("127.0.1.1");

    enb.configure(&env).unwrap();
    assert_eq!(enb.state(), ProcessState::Configured);

    enb.start(&env).unwrap();
    assert_eq!(enb.state(), ProcessState::Running);
    assert!(enb.running());
    assert_eq!(env.registry().len(), 1);

    // The marker protocol is the only observability channel: wait for the
    // scripted binary's RACH lines to land in the captured console output.
    let deadline = Instant::now() + Duration::from_secs(10);
    while enb.get_counter("prach_received").unwrap() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(enb.get_counter("prach_received").unwrap(), 2);

    // Suite-end unwinding stops the process even though no test stopped it.
    env.stop_all();
    assert!(!enb.running());

    enb.cleanup(&env).unwrap();
    assert_eq!(enb.state(), ProcessState::Terminated);

    // The captured console output was teed into the run directory.
    let stdout_log = enb
        .core()
        .expect_run_dir()
        .unwrap()
        .path()
        .join("stdout.log");
    assert!(fs::read_to_string(stdout_log).unwrap().contains("RACH:"));
}

#[test]
fn enb_prerun_failure_prevents_main_launch() {
    let tmp = TempDir::new().unwrap();
    let env = enb_env(&tmp);

    let fail = tmp.path().join("fail.sh");
    write_executable(&fail, "exit 1");

    let mut enb = EnbNode::new(
        RunNode::local("127.0.1.2"),
        yaml(&format!(
            "{{rf_dev_type: zmq, prerun_scripts: ['{}']}}",
            fail.display()
        )),
    )
    .unwrap();
    enb.configure(&env).unwrap();

    let err = enb.start(&env).unwrap_err();
    assert!(matches!(err, HarnessError::Task(_)));
    // The main process never launched and nothing was registered.
    assert!(!enb.running());
    assert!(env.registry().is_empty());
}

#[test]
fn enb_postrun_failure_still_collects_artifacts() {
    let tmp = TempDir::new().unwrap();
    let env = enb_env(&tmp);

    let fail = tmp.path().join("fail.sh");
    write_executable(&fail, "exit 1");
    let collect = tmp.path().join("collect.sh");
    write_executable(&collect, "touch collected.marker");

    let mut enb = EnbNode::new(
        RunNode::local("127.0.1.2"),
        yaml(&format!(
            "{{rf_dev_type: zmq, postrun_scripts: ['{}', '{}']}}",
            fail.display(),
            collect.display()
        )),
    )
    .unwrap();
    enb.core_mut().stop_grace = Duration::ZERO;
    enb.configure(&env).unwrap();
    enb.start(&env).unwrap();

    enb.cleanup(&env).unwrap();
    assert_eq!(enb.state(), ProcessState::Terminated);

    // The failing first task did not stop the collecting one.
    let marker = enb
        .core()
        .expect_run_dir()
        .unwrap()
        .path()
        .join("collect.sh")
        .join("collected.marker");
    assert!(marker.is_file());

    env.stop_all();
}

#[test]
fn epc_prerun_failure_prevents_main_launch() {
    let tmp = TempDir::new().unwrap();
    fake_epc_inst(&tmp.path().join("inst"));
    let env = TestEnv::new(
        RunDir::new(tmp.path().join("run")).unwrap(),
        tmp.path().join("inst"),
        yaml("{srsepc: {rlc_drb_mode: UM}}"),
        yaml("{}"),
        Box::new(YamlRenderer),
    );

    let fail = tmp.path().join("fail.sh");
    write_executable(&fail, "exit 1");

    let mut epc = EpcNode::new(RunNode::local("127.0.1.1"));
    epc.configure(&env).unwrap();
    epc.core_mut().prerun_scripts = vec![fail.display().to_string()];

    let err = epc.start(&env).unwrap_err();
    assert!(matches!(err, HarnessError::Task(_)));
    assert!(!epc.running());
    assert!(env.registry().is_empty());
}

/// End-to-end template rendering: the generated config file carries the
/// already-resolved artifact paths and the subscriber records.
#[test]
fn epc_configure_renders_vendor_style_templates() {
    let tmp = TempDir::new().unwrap();
    fake_epc_inst(&tmp.path().join("inst"));

    let templates = tmp.path().join("templates");
    fs::create_dir_all(&templates).unwrap();
    fs::write(
        templates.join(EpcNode::CFGFILE),
        "[mme]\nmme_bind_addr = ${epc.run_addr}\n[hss]\ndb_file = ${epc.db_filename}\n[log]\nfilename = ${epc.log_filename}\n",
    )
    .unwrap();
    fs::write(templates.join(EpcNode::DBFILE), "# subscribers\n").unwrap();

    let env = TestEnv::new(
        RunDir::new(tmp.path().join("run")).unwrap(),
        tmp.path().join("inst"),
        yaml("{srsepc: {rlc_drb_mode: AM}}"),
        yaml("{}"),
        Box::new(DirTemplates::new(&templates)),
    );

    let mut epc = EpcNode::new(RunNode::local("127.0.1.1"));
    epc.subscriber_add(
        &env,
        SubscriberSpec {
            imsi: "901700000001113".to_string(),
            ..Default::default()
        },
    )
    .unwrap();
    epc.configure(&env).unwrap();

    let paths = epc.core().expect_paths().unwrap();
    let cfg = fs::read_to_string(paths.local(ArtifactKind::Config).unwrap()).unwrap();
    assert!(cfg.contains("mme_bind_addr = 127.0.1.1"));

    // The rendered paths are the active (local) artifact paths.
    let db_path: PathBuf = paths.local(ArtifactKind::Db).unwrap().to_path_buf();
    assert!(cfg.contains(&db_path.display().to_string()));
    // AM mode derived QoS class 9 for the subscriber list.
    assert_eq!(epc.subscribers()[0].qci, Some(9));
}
