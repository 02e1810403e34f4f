//! External process handles
//!
//! One handle per controlled OS process, local or remote. Lifecycle
//! transitions are driven by a single controlling thread; the only internal
//! concurrency is the reader thread that accumulates the child's console
//! output from the moment of launch (markers in that output are the only way
//! protocol events are observed, so capture must not be poll-on-demand).

pub mod local;
pub mod remote;

pub use local::LocalProcess;
pub use remote::RemoteProcess;

use std::time::Duration;

use crate::errors::Result;

/// Default wait for synchronous helper tasks (pre/post-run scripts).
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(1200);

/// Default graceful-stop window before escalating to a forced kill.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

pub trait ProcessHandle: Send {
    fn name(&self) -> &str;

    /// Spawn the process. Does not block. A missing binary or unreachable
    /// host fails with a Launch error and leaves the handle terminated.
    fn launch(&mut self) -> Result<()>;

    /// Blocking launch for short-lived helper tasks. A non-zero exit code
    /// fails with a Task error.
    fn launch_sync(&mut self, timeout: Duration) -> Result<i32>;

    /// Best-effort write to the process stdin. Failures are logged, not
    /// raised: by the time tracing is toggled the process may have exited.
    fn stdin_write(&mut self, data: &str);

    /// Everything captured from stdout so far.
    fn stdout(&self) -> String;

    /// Occurrences of a marker substring in the accumulated stdout.
    fn count_in_stdout(&self, marker: &str) -> usize {
        self.stdout().matches(marker).count()
    }

    /// Non-blocking liveness probe.
    fn terminated(&mut self) -> bool;

    fn exit_code(&self) -> Option<i32>;

    /// Request graceful shutdown, wait up to `timeout`, escalate to a forced
    /// kill. Idempotent once the process is gone.
    fn terminate(&mut self, timeout: Duration);
}
