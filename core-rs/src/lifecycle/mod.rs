//! Controlled process lifecycle
//!
//! One state machine per external process:
//! Idle -> Configured -> Staged (remote only) -> Running -> Stopping ->
//! Terminated. Lifecycle-fatal errors unwind the whole configure/start call
//! and never leave a process partially running with partially written
//! config; cleanup-path errors are swallowed per artifact.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::{HarnessError, Result};
use crate::paths::{ArtifactKind, RunDir, RunPaths};
use crate::process::{LocalProcess, ProcessHandle, DEFAULT_TASK_TIMEOUT, DEFAULT_TERMINATE_TIMEOUT};
use crate::remote::{RemoteHost, RunNode};
use crate::testenv::TestEnv;

/// Grace period after stopping, letting dependent downstream processes
/// finish their own teardown before artifacts are collected.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Configured,
    Staged,
    Running,
    Stopping,
    Terminated,
}

pub type SharedProcess = Arc<Mutex<Box<dyn ProcessHandle>>>;

/// Process-wide teardown stack. Every controlled process registers its
/// handle at launch; the suite unwinds the stack in reverse push order at
/// suite end, independent of individual test outcomes, so dependents stop
/// before their dependencies.
#[derive(Default)]
pub struct TeardownRegistry {
    stack: Mutex<Vec<SharedProcess>>,
}

impl TeardownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember_to_stop(&self, handle: SharedProcess) {
        let mut stack = self.stack.lock().unwrap_or_else(|p| p.into_inner());
        stack.push(handle);
    }

    pub fn len(&self) -> usize {
        self.stack.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every registered process, most recently launched first.
    pub fn unwind(&self) {
        let mut drained: Vec<SharedProcess> = {
            let mut stack = self.stack.lock().unwrap_or_else(|p| p.into_inner());
            stack.drain(..).collect()
        };
        while let Some(handle) = drained.pop() {
            let Ok(mut proc) = handle.lock() else { continue };
            if !proc.terminated() {
                info!(process = proc.name(), "stopping registered process");
                proc.terminate(DEFAULT_TERMINATE_TIMEOUT);
            }
        }
    }
}

/// Shared state and helpers composed into every controlled process kind.
pub struct ProcessCore {
    pub name: String,
    pub run_node: RunNode,
    pub state: ProcessState,
    pub run_dir: Option<RunDir>,
    pub paths: Option<RunPaths>,
    pub rem_host: Option<RemoteHost>,
    pub process: Option<SharedProcess>,
    pub prerun_scripts: Vec<String>,
    pub postrun_scripts: Vec<String>,
    pub additional_args: Vec<String>,
    pub stop_grace: Duration,
}

impl ProcessCore {
    pub fn new(name: &str, run_node: RunNode) -> Self {
        ProcessCore {
            name: name.to_string(),
            run_node,
            state: ProcessState::Idle,
            run_dir: None,
            paths: None,
            rem_host: None,
            process: None,
            prerun_scripts: Vec::new(),
            postrun_scripts: Vec::new(),
            additional_args: Vec::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn expect_run_dir(&self) -> Result<&RunDir> {
        self.run_dir
            .as_ref()
            .ok_or_else(|| HarnessError::Process(format!("{}: not configured", self.name)))
    }

    pub fn expect_paths(&self) -> Result<&RunPaths> {
        self.paths
            .as_ref()
            .ok_or_else(|| HarnessError::Process(format!("{}: paths not resolved", self.name)))
    }

    pub fn expect_rem_host(&self) -> Result<&RemoteHost> {
        self.rem_host.as_ref().ok_or_else(|| {
            HarnessError::Process(format!("{}: no remote host for local placement", self.name))
        })
    }

    /// Run one helper script synchronously. The task string is the script
    /// path, optionally followed by ` args=a,b,c`.
    pub fn run_task(&self, task: &str) -> Result<()> {
        let (script, args): (String, Vec<String>) = match task.split_once(" args=") {
            None => (task.trim().to_string(), Vec::new()),
            Some((script, args)) => (
                script.trim().to_string(),
                args.split(',').map(|a| a.trim().to_string()).collect(),
            ),
        };
        let mut task_name = script.rsplit('/').next().unwrap_or_default().to_string();
        if task_name.is_empty() {
            task_name = "task".to_string();
        }

        info!(task = %task_name, script = %script, args = ?args, "running helper task");
        let dir = self.expect_run_dir()?.new_dir(&task_name)?;
        let mut argv = vec![script];
        argv.extend(args);
        let mut proc = LocalProcess::new(&task_name, dir.path(), argv, Vec::new());
        proc.launch_sync(DEFAULT_TASK_TIMEOUT).map(|_| ())
    }

    /// Run every pre-run task in order; the first failing task aborts the
    /// whole start sequence before the main process is launched.
    pub fn prerun_tasks(&self) -> Result<()> {
        for task in &self.prerun_scripts {
            self.run_task(task)?;
        }
        Ok(())
    }

    /// Run every post-run task; the process already ran to completion, so a
    /// failing task is logged and the remaining tasks still execute.
    pub fn postrun_tasks(&self) {
        for task in &self.postrun_scripts {
            if let Err(e) = self.run_task(task) {
                warn!(error_kind = e.kind(), error = %e, "postrun task failed, continuing");
            }
        }
    }

    /// Launch the main process and register it with the suite teardown
    /// stack, so an unrelated failure elsewhere still tears it down.
    pub fn launch_main(
        &mut self,
        registry: &TeardownRegistry,
        mut handle: Box<dyn ProcessHandle>,
    ) -> Result<()> {
        match self.state {
            ProcessState::Configured | ProcessState::Staged => {}
            other => {
                return Err(HarnessError::Process(format!(
                    "{}: cannot launch from state {:?}",
                    self.name, other
                )))
            }
        }
        if let Err(e) = handle.launch() {
            self.state = ProcessState::Terminated;
            return Err(e);
        }
        let shared: SharedProcess = Arc::new(Mutex::new(handle));
        registry.remember_to_stop(shared.clone());
        self.process = Some(shared);
        self.state = ProcessState::Running;
        Ok(())
    }

    pub fn stdin_write(&self, data: &str) {
        if let Some(handle) = &self.process {
            if let Ok(mut proc) = handle.lock() {
                proc.stdin_write(data);
            }
        }
    }

    pub fn get_stdout(&self) -> String {
        match &self.process {
            Some(handle) => handle
                .lock()
                .map(|proc| proc.stdout())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    pub fn count_in_stdout(&self, marker: &str) -> usize {
        self.get_stdout().matches(marker).count()
    }

    pub fn running(&self) -> bool {
        match &self.process {
            Some(handle) => match handle.lock() {
                Ok(mut proc) => !proc.terminated(),
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Stop the main process: skip graceful signaling if already terminated,
    /// otherwise wait out the graceful window and escalate.
    pub fn stop(&mut self) {
        if let Some(handle) = &self.process {
            self.state = ProcessState::Stopping;
            if let Ok(mut proc) = handle.lock() {
                if !proc.terminated() {
                    proc.terminate(DEFAULT_TERMINATE_TIMEOUT);
                }
            }
        }
        self.state = ProcessState::Terminated;
    }

    /// Give dependent downstream processes time to tear down first.
    pub fn sleep_after_stop(&self) {
        if !self.stop_grace.is_zero() {
            thread::sleep(self.stop_grace);
        }
    }

    /// Best-effort retrieval of the listed artifacts from the remote host;
    /// each failure is caught and logged so one missing file never prevents
    /// retrieval of the others.
    pub fn pull_artifacts(&self, kinds: &[ArtifactKind]) {
        let (Some(paths), Some(rem_host)) = (&self.paths, &self.rem_host) else {
            return;
        };
        for &kind in kinds {
            let Some(entry) = paths.get(kind) else { continue };
            let Some(remote) = entry.remote.as_deref() else {
                continue;
            };
            let op = format!("scp-back-{}", kind.key());
            let _ = rem_host.pull(&op, remote, &entry.local, false);
        }
    }
}

/// The lifecycle surface every controlled process kind exposes.
pub trait ControlledProcess {
    fn core(&self) -> &ProcessCore;
    fn core_mut(&mut self) -> &mut ProcessCore;

    /// Resolve paths, build the configuration overlay stack and write the
    /// generated config files (staging them to the remote host when placed
    /// remotely).
    fn configure(&mut self, env: &TestEnv) -> Result<()>;

    /// Run pre-run tasks and launch the main process.
    fn start(&mut self, env: &TestEnv) -> Result<()>;

    /// Post-run tasks, artifact retrieval and counter extraction.
    fn cleanup(&mut self, env: &TestEnv) -> Result<()>;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn state(&self) -> ProcessState {
        self.core().state
    }

    fn running(&self) -> bool {
        self.core().running()
    }

    fn stop(&mut self) {
        self.core_mut().stop()
    }
}
