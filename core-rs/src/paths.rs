//! Artifact path resolution
//!
//! Every artifact a controlled process produces (config, log, pcap, metrics,
//! ...) has a local path under the run directory and, when the process is
//! placed on a remote host, a remote path under a fixed per-kind prefix. The
//! active path is selected once at configure time; everything downstream
//! (templating, argv construction, retrieval) reads the already-resolved
//! paths and never re-decides placement.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::errors::{HarnessError, Result};

/// A directory for one run of one process, holding generated configs,
/// captured output and per-task subdirectories.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create (or reuse) the directory at `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(RunDir { path })
    }

    /// Create a timestamped run directory under `parent`.
    pub fn timestamped(parent: &Path, prefix: &str) -> Result<Self> {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        Self::new(parent.join(format!("{}-{}", prefix, stamp)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a child entry without creating it.
    pub fn child(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Create a subdirectory and return it as a RunDir.
    pub fn new_dir(&self, name: &str) -> Result<RunDir> {
        RunDir::new(self.path.join(name))
    }

    /// Create an empty child file and return its path.
    pub fn new_file(&self, name: &str) -> Result<PathBuf> {
        let path = self.path.join(name);
        File::create(&path)?;
        Ok(path)
    }
}

/// The artifacts a controlled process can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Config,
    ConfigSib,
    ConfigRr,
    ConfigRb,
    Db,
    Log,
    Pcap,
    S1apPcap,
    Metrics,
    Tracing,
    Interceptor,
}

impl ArtifactKind {
    pub fn key(self) -> &'static str {
        match self {
            ArtifactKind::Config => "config",
            ArtifactKind::ConfigSib => "config_sib",
            ArtifactKind::ConfigRr => "config_rr",
            ArtifactKind::ConfigRb => "config_rb",
            ArtifactKind::Db => "db",
            ArtifactKind::Log => "log",
            ArtifactKind::Pcap => "pcap",
            ArtifactKind::S1apPcap => "s1ap_pcap",
            ArtifactKind::Metrics => "metrics",
            ArtifactKind::Tracing => "tracing",
            ArtifactKind::Interceptor => "interceptor",
        }
    }

    /// Configuration key under which the active path is handed to the
    /// template layer, if the external binary reads this path from its
    /// generated config file.
    pub fn config_key(self) -> Option<&'static str> {
        match self {
            ArtifactKind::ConfigSib => Some("sib_filename"),
            ArtifactKind::ConfigRr => Some("rr_filename"),
            ArtifactKind::ConfigRb => Some("rb_filename"),
            ArtifactKind::Db => Some("db_filename"),
            ArtifactKind::Log => Some("log_filename"),
            ArtifactKind::Pcap => Some("pcap_filename"),
            ArtifactKind::S1apPcap => Some("s1ap_pcap_filename"),
            ArtifactKind::Metrics => Some("metrics_filename"),
            ArtifactKind::Tracing => Some("tracing_filename"),
            ArtifactKind::Config | ArtifactKind::Interceptor => None,
        }
    }
}

/// Local/remote path pair for one artifact. `remote` is only present when the
/// owning process is placed on a remote host.
#[derive(Debug, Clone)]
pub struct ArtifactPath {
    pub local: PathBuf,
    pub remote: Option<PathBuf>,
}

impl ArtifactPath {
    /// The path valid in the executing binary's own filesystem namespace.
    pub fn active(&self) -> &Path {
        self.remote.as_deref().unwrap_or(&self.local)
    }
}

/// Remote directory layout for a remotely-placed process: a fixed prefix,
/// the mirrored installation tree under it, and an instance subdirectory.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    prefix: PathBuf,
    instance: String,
    inst_basename: String,
}

impl RemoteLayout {
    pub fn new(prefix: &Path, instance: &str, inst_dir: &Path) -> Result<Self> {
        let inst_basename = inst_dir
            .file_name()
            .ok_or_else(|| {
                HarnessError::Config(format!(
                    "installation dir {} has no basename",
                    inst_dir.display()
                ))
            })?
            .to_string_lossy()
            .to_string();
        Ok(RemoteLayout {
            prefix: prefix.to_path_buf(),
            instance: instance.to_string(),
            inst_basename,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Remote copy of the installation tree.
    pub fn inst_dir(&self) -> PathBuf {
        self.prefix.join(&self.inst_basename)
    }

    /// Remote run directory of this instance.
    pub fn run_dir(&self) -> PathBuf {
        self.prefix.join(&self.instance)
    }
}

/// Resolved artifact paths for one process run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    entries: Vec<(ArtifactKind, ArtifactPath)>,
    remote: Option<RemoteLayout>,
}

impl RunPaths {
    /// Resolve the manifest against a run directory and, if placed remotely,
    /// a remote layout. This is the single point where local vs. remote is
    /// decided.
    pub fn resolve(
        run_dir: &RunDir,
        manifest: &[(ArtifactKind, &str)],
        remote: Option<RemoteLayout>,
    ) -> RunPaths {
        let remote_run_dir = remote.as_ref().map(|r| r.run_dir());
        let entries = manifest
            .iter()
            .map(|&(kind, filename)| {
                let path = ArtifactPath {
                    local: run_dir.child(filename),
                    remote: remote_run_dir.as_ref().map(|d| d.join(filename)),
                };
                (kind, path)
            })
            .collect();
        RunPaths { entries, remote }
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&ArtifactPath> {
        self.entries.iter().find(|(k, _)| *k == kind).map(|(_, p)| p)
    }

    pub fn local(&self, kind: ArtifactKind) -> Option<&Path> {
        self.get(kind).map(|p| p.local.as_path())
    }

    pub fn remote(&self, kind: ArtifactKind) -> Option<&Path> {
        self.get(kind).and_then(|p| p.remote.as_deref())
    }

    pub fn active(&self, kind: ArtifactKind) -> Option<&Path> {
        self.get(kind).map(|p| p.active())
    }

    pub fn layout(&self) -> Option<&RemoteLayout> {
        self.remote.as_ref()
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &ArtifactPath)> {
        self.entries.iter().map(|(k, p)| (*k, p))
    }
}
