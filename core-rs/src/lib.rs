//! # LTE Harness Core
//!
//! Process lifecycle and configuration machinery for driving LTE network
//! element binaries (core network, base station, modem) under test: layered
//! configuration overlays, deterministic artifact path resolution, local and
//! remote process supervision, remote staging over ssh/scp, post-run
//! artifact retrieval and CSV metrics verification.
//!
//! ## Architecture
//!
//! ```text
//! TestEnv ──── config overlays ────> ControlledProcess (per node kind)
//!    │                                   │ configure -> stage -> start
//!    │                                   │ stop -> cleanup
//!    ├─ ResourcePool (ports, msisdn)     ▼
//!    └─ TeardownRegistry <──────── ProcessHandle (local | remote/ssh)
//! ```
//!
//! Every path an external binary reads from its generated config is resolved
//! once, at configure time, to that binary's own filesystem namespace; the
//! harness never re-decides placement later.

pub mod binprep;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod nodes;
pub mod paths;
pub mod process;
pub mod remote;
pub mod resource;
pub mod template;
pub mod testenv;

pub use config::{overlay, overlay_at};
pub use errors::{HarnessError, Result};
pub use lifecycle::{ControlledProcess, ProcessCore, ProcessState, TeardownRegistry};
pub use metrics::{Criterion, MetricsFile, Operation};
pub use nodes::{EnbNode, EpcNode, UeNode};
pub use paths::{ArtifactKind, ArtifactPath, RemoteLayout, RunDir, RunPaths};
pub use process::{LocalProcess, ProcessHandle, RemoteProcess};
pub use remote::{RemoteHost, RunNode, SshTarget};
pub use resource::{PortLease, ResourcePool, Subscriber, SubscriberSpec};
pub use template::{DirTemplates, TemplateRenderer, YamlRenderer};
pub use testenv::TestEnv;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
