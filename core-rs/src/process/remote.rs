//! Remote process handle
//!
//! A remote process is supervised through its ssh transport process: the
//! local ssh child's stdout is the remote binary's console output, and the
//! transport exiting means the remote command exited. Termination first asks
//! the remote side to stop, then tears down the transport.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use super::{LocalProcess, ProcessHandle};
use crate::errors::Result;
use crate::remote::{shell_quote, RemoteHost};

pub struct RemoteProcess {
    inner: LocalProcess,
    host: RemoteHost,
    remote_binary: String,
}

impl RemoteProcess {
    /// `remote_argv` is the argv executed on the remote host; `remote_env`
    /// is prefixed as VAR=value assignments (ssh does not forward the local
    /// environment). `stderr_redirect` appends a shell redirection for
    /// binaries whose diagnostic stream must land in a remote file.
    pub fn new(
        name: &str,
        run_dir: &Path,
        host: RemoteHost,
        remote_argv: &[String],
        remote_env: &[(String, String)],
        stderr_redirect: Option<&Path>,
    ) -> Self {
        let remote_binary = remote_argv.first().cloned().unwrap_or_default();

        let mut parts: Vec<String> = remote_env
            .iter()
            .map(|(key, val)| format!("{}={}", key, shell_quote(val)))
            .collect();
        parts.extend(remote_argv.iter().map(|arg| shell_quote(arg)));
        let mut command = parts.join(" ");
        if let Some(path) = stderr_redirect {
            command.push_str(&format!(" 2> {}", shell_quote(&path.to_string_lossy())));
        }

        let argv = vec![
            "ssh".to_string(),
            "-T".to_string(),
            host.target().to_string(),
            command,
        ];
        RemoteProcess {
            inner: LocalProcess::new(name, run_dir, argv, Vec::new()),
            host,
            remote_binary,
        }
    }
}

impl ProcessHandle for RemoteProcess {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn launch(&mut self) -> Result<()> {
        self.inner.launch()
    }

    fn launch_sync(&mut self, timeout: Duration) -> Result<i32> {
        self.inner.launch_sync(timeout)
    }

    fn stdin_write(&mut self, data: &str) {
        self.inner.stdin_write(data)
    }

    fn stdout(&self) -> String {
        self.inner.stdout()
    }

    fn terminated(&mut self) -> bool {
        self.inner.terminated()
    }

    fn exit_code(&self) -> Option<i32> {
        self.inner.exit_code()
    }

    fn terminate(&mut self, timeout: Duration) {
        if !self.inner.terminated() && !self.remote_binary.is_empty() {
            // Stop the remote side before the transport goes away; the
            // process may already be gone, so a failure here is expected.
            let cmd = format!("pkill -SIGINT -f {}", shell_quote(&self.remote_binary));
            if let Err(e) = self.host.run_remote("remote-kill", &cmd) {
                debug!(process = %self.inner.name(), error = %e, "remote kill failed");
            }
        }
        self.inner.terminate(timeout);
    }
}
