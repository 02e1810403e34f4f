//! Local binary preparation
//!
//! Counterparts of the remote-host operations for processes placed on the
//! local host: rpath patching, capability grants and netns creation. Each
//! step runs the system tool as a synchronous helper process in its own
//! subdirectory of the run dir.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::errors::Result;
use crate::paths::RunDir;
use crate::process::{LocalProcess, ProcessHandle};

const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

fn run_tool(run_dir: &RunDir, name: &str, argv: Vec<String>) -> Result<()> {
    let dir = run_dir.new_dir(name)?;
    let mut proc = LocalProcess::new(name, dir.path(), argv, Vec::new());
    proc.launch_sync(TOOL_TIMEOUT).map(|_| ())
}

/// Value for LD_LIBRARY_PATH with `lib_dir` prepended to the inherited one.
pub fn prepend_library_path(lib_dir: &Path) -> String {
    match std::env::var("LD_LIBRARY_PATH") {
        Ok(current) if !current.is_empty() => format!("{}:{}", lib_dir.display(), current),
        _ => lib_dir.display().to_string(),
    }
}

/// Rewrite the binary's embedded library search path. Must run before any
/// capability grant: raised capabilities make the ELF loader ignore
/// LD_LIBRARY_PATH.
pub fn change_elf_rpath(binary: &Path, rpath: &str, run_dir: &RunDir) -> Result<()> {
    info!(binary = %binary.display(), "setting RPATH");
    run_tool(
        run_dir,
        "patchelf",
        vec![
            "patchelf".to_string(),
            "--set-rpath".to_string(),
            rpath.to_string(),
            binary.to_string_lossy().to_string(),
        ],
    )
}

/// CAP_NET_ADMIN: the binary creates tunnel devices (ioctl TUNSETIFF).
pub fn setcap_net_admin(binary: &Path, run_dir: &RunDir) -> Result<()> {
    info!(binary = %binary.display(), "applying CAP_NET_ADMIN capability");
    run_tool(
        run_dir,
        "setcap_net_admin",
        vec![
            "sudo".to_string(),
            "setcap".to_string(),
            "cap_net_admin+ep".to_string(),
            binary.to_string_lossy().to_string(),
        ],
    )
}

/// CAP_SYS_ADMIN for netns(CLONE_NEWNET) plus CAP_NET_ADMIN for tunnels.
pub fn setcap_netsys_admin(binary: &Path, run_dir: &RunDir) -> Result<()> {
    info!(binary = %binary.display(), "applying CAP_SYS_ADMIN+CAP_NET_ADMIN capability");
    run_tool(
        run_dir,
        "setcap_netsys_admin",
        vec![
            "sudo".to_string(),
            "setcap".to_string(),
            "cap_sys_admin,cap_net_admin+ep".to_string(),
            binary.to_string_lossy().to_string(),
        ],
    )
}

/// Create a network namespace if it does not already exist.
pub fn create_netns(name: &str, run_dir: &RunDir) -> Result<()> {
    info!(netns = name, "creating netns");
    run_tool(
        run_dir,
        "create_netns",
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("ip netns list | grep -q \"^{name}\" || sudo ip netns add {name}"),
        ],
    )
}
