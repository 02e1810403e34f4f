//! Local OS process handle

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::ProcessHandle;
use crate::errors::{HarnessError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERM_WAIT: Duration = Duration::from_secs(3);

/// A process spawned on the local host with its console output captured
/// continuously into an in-memory buffer (and `stdout.log`/`stderr.log`
/// under the run directory).
pub struct LocalProcess {
    name: String,
    run_dir: PathBuf,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout_buf: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
    exit_code: Option<i32>,
}

impl LocalProcess {
    pub fn new(name: &str, run_dir: &Path, argv: Vec<String>, env: Vec<(String, String)>) -> Self {
        LocalProcess {
            name: name.to_string(),
            run_dir: run_dir.to_path_buf(),
            argv,
            env,
            child: None,
            stdin: None,
            stdout_buf: Arc::new(Mutex::new(String::new())),
            readers: Vec::new(),
            exit_code: None,
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    fn spawn_reader<R: Read + Send + 'static>(
        stream: R,
        buf: Option<Arc<Mutex<String>>>,
        log_path: PathBuf,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut log = File::create(&log_path).ok();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if let Some(f) = log.as_mut() {
                            let _ = f.write_all(line.as_bytes());
                        }
                        if let Some(b) = &buf {
                            if let Ok(mut guard) = b.lock() {
                                guard.push_str(&line);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Join reader threads and drop the stdin pipe once the child is gone.
    fn reap(&mut self) {
        self.stdin = None;
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.poll_terminated() {
                return true;
            }
            thread::sleep(POLL_INTERVAL);
        }
        self.poll_terminated()
    }

    fn poll_terminated(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }
        let polled = match self.child.as_mut() {
            None => return false,
            Some(child) => child.try_wait(),
        };
        match polled {
            Ok(Some(status)) => {
                self.exit_code = Some(status.code().unwrap_or(-1));
                debug!(process = %self.name, code = ?self.exit_code, "process exited");
                self.reap();
                true
            }
            Ok(None) => false,
            Err(_) => {
                self.exit_code = Some(-1);
                true
            }
        }
    }

    #[cfg(unix)]
    fn send_signal(&self, signal: nix::sys::signal::Signal) {
        if let Some(child) = self.child.as_ref() {
            let pid = nix::unistd::Pid::from_raw(child.id() as i32);
            if let Err(e) = nix::sys::signal::kill(pid, signal) {
                debug!(process = %self.name, %signal, error = %e, "signal delivery failed");
            }
        }
    }

    fn force_kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            match child.wait() {
                Ok(status) => self.exit_code = Some(status.code().unwrap_or(-1)),
                Err(_) => self.exit_code = Some(-1),
            }
        }
        self.reap();
    }
}

impl ProcessHandle for LocalProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(HarnessError::Process(format!(
                "{}: already launched",
                self.name
            )));
        }
        let program = self
            .argv
            .first()
            .cloned()
            .ok_or_else(|| HarnessError::Launch(format!("{}: empty argv", self.name)))?;

        debug!(process = %self.name, argv = ?self.argv, "launching");

        let mut cmd = Command::new(&program);
        cmd.args(&self.argv[1..])
            .current_dir(&self.run_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, val) in &self.env {
            cmd.env(key, val);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Handle goes straight to terminated state on spawn failure.
                self.exit_code = Some(-1);
                return Err(HarnessError::Launch(format!(
                    "{}: failed to spawn {}: {}",
                    self.name, program, e
                )));
            }
        };

        self.stdin = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            self.readers.push(Self::spawn_reader(
                stdout,
                Some(self.stdout_buf.clone()),
                self.run_dir.join("stdout.log"),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            self.readers.push(Self::spawn_reader(
                stderr,
                None,
                self.run_dir.join("stderr.log"),
            ));
        }
        self.child = Some(child);
        Ok(())
    }

    fn launch_sync(&mut self, timeout: Duration) -> Result<i32> {
        self.launch()?;
        if !self.wait_for_exit(timeout) {
            warn!(process = %self.name, ?timeout, "helper task timed out, terminating");
            self.terminate(Duration::from_secs(5));
            return Err(HarnessError::Task(format!(
                "{}: timed out after {:?}",
                self.name, timeout
            )));
        }
        let code = self.exit_code.unwrap_or(-1);
        if code != 0 {
            return Err(HarnessError::Task(format!(
                "{}: exited with code {}",
                self.name, code
            )));
        }
        Ok(code)
    }

    fn stdin_write(&mut self, data: &str) {
        match self.stdin.as_mut() {
            Some(stdin) => {
                let res = stdin.write_all(data.as_bytes()).and_then(|_| stdin.flush());
                if let Err(e) = res {
                    warn!(process = %self.name, error = %e, "stdin write failed");
                }
            }
            None => {
                warn!(process = %self.name, "stdin write with no open stdin");
            }
        }
    }

    fn stdout(&self) -> String {
        self.stdout_buf
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    fn terminated(&mut self) -> bool {
        self.poll_terminated()
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn terminate(&mut self, timeout: Duration) {
        if self.poll_terminated() {
            self.reap();
            return;
        }
        debug!(process = %self.name, "terminating");

        #[cfg(unix)]
        {
            self.send_signal(nix::sys::signal::Signal::SIGINT);
            if self.wait_for_exit(timeout) {
                self.reap();
                return;
            }
            self.send_signal(nix::sys::signal::Signal::SIGTERM);
            if self.wait_for_exit(TERM_WAIT) {
                self.reap();
                return;
            }
            warn!(process = %self.name, "graceful stop failed, forcing kill");
        }
        #[cfg(not(unix))]
        let _ = timeout;

        self.force_kill();
    }
}
