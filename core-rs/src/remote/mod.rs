//! Remote host transport and staging
//!
//! All remote operations shell out to `ssh`/`scp`; each operation runs as a
//! named synchronous helper process with its own subdirectory under the
//! owning run directory, so its console output lands next to the run's other
//! artifacts.

use std::fmt;
use std::path::Path;

use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::config;
use crate::errors::{HarnessError, Result};
use crate::paths::RunDir;
use crate::process::{LocalProcess, ProcessHandle};
use std::time::Duration;

/// Upper bound for one staging or control operation over the remote shell.
pub const SSH_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Quote one argument for the remote shell.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:+,@".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// SSH credentials of a remote run node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Where a controlled process executes: the local host or a named remote
/// run node reached over ssh.
#[derive(Debug, Clone)]
pub struct RunNode {
    addr: String,
    ssh: Option<SshTarget>,
    label: Option<String>,
}

impl RunNode {
    pub fn local(addr: &str) -> Self {
        RunNode {
            addr: addr.to_string(),
            ssh: None,
            label: None,
        }
    }

    pub fn remote(addr: &str, ssh_user: &str, ssh_addr: &str) -> Self {
        RunNode {
            addr: addr.to_string(),
            ssh: Some(SshTarget {
                user: ssh_user.to_string(),
                host: ssh_addr.to_string(),
            }),
            label: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Build from a `run_node` configuration mapping:
    /// `{run_type: local|ssh, run_addr: ..., ssh_user: ..., ssh_addr: ..., run_label: ...}`
    pub fn from_conf(conf: &Value) -> Result<Self> {
        let run_type = config::get_str(conf, &["run_type"]).unwrap_or("local");
        let addr = config::get_str(conf, &["run_addr"])
            .ok_or_else(|| HarnessError::Config("run_node without run_addr".to_string()))?;
        let label = config::get_str(conf, &["run_label"]).map(str::to_string);

        let ssh = match run_type {
            "local" => None,
            "ssh" => {
                let user = config::get_str(conf, &["ssh_user"]).ok_or_else(|| {
                    HarnessError::Config("ssh run_node without ssh_user".to_string())
                })?;
                let host = config::get_str(conf, &["ssh_addr"]).ok_or_else(|| {
                    HarnessError::Config("ssh run_node without ssh_addr".to_string())
                })?;
                Some(SshTarget {
                    user: user.to_string(),
                    host: host.to_string(),
                })
            }
            other => {
                return Err(HarnessError::Config(format!(
                    "unsupported run_type {}",
                    other
                )))
            }
        };

        Ok(RunNode {
            addr: addr.to_string(),
            ssh,
            label,
        })
    }

    pub fn is_local(&self) -> bool {
        self.ssh.is_none()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn ssh_target(&self) -> Result<&SshTarget> {
        self.ssh.as_ref().ok_or_else(|| {
            HarnessError::Config(format!("run node {} has no ssh credentials", self.addr))
        })
    }
}

/// Handle on one remote host, scoped to one process run.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    run_dir: RunDir,
    target: SshTarget,
}

impl RemoteHost {
    pub fn new(run_dir: RunDir, target: SshTarget) -> Self {
        RemoteHost { run_dir, target }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn run_helper(&self, name: &str, argv: Vec<String>) -> Result<()> {
        let dir = self
            .run_dir
            .new_dir(name)
            .map_err(|e| HarnessError::RemoteIo(format!("{}: {}", name, e)))?;
        let mut proc = LocalProcess::new(name, dir.path(), argv, Vec::new());
        proc.launch_sync(SSH_OP_TIMEOUT)
            .map(|_| ())
            .map_err(|e| HarnessError::RemoteIo(format!("{} via {}: {}", name, self.target, e)))
    }

    /// Run a command line on the remote host; non-zero exit is a RemoteIo
    /// error.
    pub fn run_remote(&self, name: &str, remote_cmd: &str) -> Result<()> {
        debug!(op = name, target = %self.target, cmd = remote_cmd, "remote command");
        self.run_helper(
            name,
            vec![
                "ssh".to_string(),
                self.target.to_string(),
                remote_cmd.to_string(),
            ],
        )
    }

    /// Copy a file or tree to the remote host.
    pub fn scp_to(&self, name: &str, local: &Path, remote: &Path) -> Result<()> {
        debug!(op = name, target = %self.target, local = %local.display(), remote = %remote.display(), "copy to remote");
        self.run_helper(
            name,
            vec![
                "scp".to_string(),
                "-r".to_string(),
                "-q".to_string(),
                local.to_string_lossy().to_string(),
                format!("{}:{}", self.target, remote.display()),
            ],
        )
    }

    /// Copy a file or tree back from the remote host.
    pub fn scp_from(&self, name: &str, remote: &Path, local: &Path) -> Result<()> {
        debug!(op = name, target = %self.target, remote = %remote.display(), local = %local.display(), "copy from remote");
        self.run_helper(
            name,
            vec![
                "scp".to_string(),
                "-r".to_string(),
                "-q".to_string(),
                format!("{}:{}", self.target, remote.display()),
                local.to_string_lossy().to_string(),
            ],
        )
    }

    pub fn mkdir(&self, path: &Path) -> Result<()> {
        self.run_remote("mkdir", &format!("mkdir -p {}", quote_path(path)))
    }

    /// Remove the directory if it exists, then create it. Idempotent.
    pub fn recreate_remote_dir(&self, path: &Path) -> Result<()> {
        let q = quote_path(path);
        self.run_remote("recreate-remote-dir", &format!("rm -rf {q} && mkdir -p {q}"))
    }

    /// Rewrite the binary's embedded library search path. Must run before
    /// any capability grant: raised capabilities make the ELF loader ignore
    /// LD_LIBRARY_PATH.
    pub fn change_elf_rpath(&self, binary: &Path, lib_dir: &Path) -> Result<()> {
        info!(binary = %binary.display(), "setting RPATH");
        self.run_remote(
            "patchelf",
            &format!(
                "patchelf --set-rpath {} {}",
                quote_path(lib_dir),
                quote_path(binary)
            ),
        )
    }

    /// CAP_NET_ADMIN: the binary creates tunnel devices (ioctl TUNSETIFF).
    pub fn setcap_net_admin(&self, binary: &Path) -> Result<()> {
        info!(binary = %binary.display(), "applying CAP_NET_ADMIN capability");
        self.run_remote(
            "setcap-net-admin",
            &format!("sudo setcap cap_net_admin+ep {}", quote_path(binary)),
        )
    }

    /// CAP_SYS_ADMIN for netns(CLONE_NEWNET) plus CAP_NET_ADMIN for tunnels.
    pub fn setcap_netsys_admin(&self, binary: &Path) -> Result<()> {
        info!(binary = %binary.display(), "applying CAP_SYS_ADMIN+CAP_NET_ADMIN capability");
        self.run_remote(
            "setcap-netsys-admin",
            &format!(
                "sudo setcap cap_sys_admin,cap_net_admin+ep {}",
                quote_path(binary)
            ),
        )
    }

    pub fn create_netns(&self, name: &str) -> Result<()> {
        info!(netns = name, "creating netns");
        let q = shell_quote(name);
        self.run_remote(
            "create-netns",
            &format!("ip netns list | grep -q \"^{q}\" || sudo ip netns add {q}"),
        )
    }

    /// Retrieve one artifact. When `required` is false a failed copy is
    /// caught and logged so the remaining artifacts still get pulled; the
    /// single mandatory metrics retrieval passes `required = true` and
    /// propagates the failure.
    pub fn pull(&self, name: &str, remote: &Path, local: &Path, required: bool) -> Result<()> {
        match self.scp_from(name, remote, local) {
            Ok(()) => Ok(()),
            Err(e) if required => Err(e),
            Err(e) => {
                warn!(op = name, error_kind = e.kind(), error = %e, "artifact pull failed, continuing");
                Ok(())
            }
        }
    }
}
