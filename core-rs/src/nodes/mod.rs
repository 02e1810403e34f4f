//! Controlled network element processes
//!
//! One wrapper per process kind (core network, base station, modem), each
//! composing the lifecycle core with its own configuration layering, file
//! manifest and console marker vocabulary.

pub mod enb;
pub mod epc;
pub mod ue;

pub use enb::EnbNode;
pub use epc::EpcNode;
pub use ue::UeNode;

use std::path::Path;

use serde_yaml::Value;

use crate::config;
use crate::errors::{HarnessError, Result};
use crate::paths::{ArtifactKind, RunPaths};

pub(crate) fn local_path(paths: &RunPaths, kind: ArtifactKind) -> Result<&Path> {
    paths
        .local(kind)
        .ok_or_else(|| HarnessError::Process(format!("artifact {} not in manifest", kind.key())))
}

pub(crate) fn remote_path(paths: &RunPaths, kind: ArtifactKind) -> Result<&Path> {
    paths
        .remote(kind)
        .ok_or_else(|| HarnessError::Process(format!("no remote path for {}", kind.key())))
}

pub(crate) fn active_path(paths: &RunPaths, kind: ArtifactKind) -> Result<&Path> {
    paths
        .active(kind)
        .ok_or_else(|| HarnessError::Process(format!("artifact {} not in manifest", kind.key())))
}

/// Overlay the active path of each listed artifact under its config key, so
/// generated config files always point at paths valid in the executing
/// binary's own filesystem namespace.
pub(crate) fn overlay_artifact_paths(
    values: &mut Value,
    section: &str,
    paths: &RunPaths,
    kinds: &[ArtifactKind],
) {
    for &kind in kinds {
        if let (Some(key), Some(path)) = (kind.config_key(), paths.active(kind)) {
            config::overlay_at(
                values,
                &[section, key],
                Value::String(path.display().to_string()),
            );
        }
    }
}

/// Script list from a configuration mapping (`prerun_scripts` /
/// `postrun_scripts`).
pub(crate) fn parse_script_list(conf: &Value, key: &str) -> Vec<String> {
    config::get_path(conf, &[key])
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Free-form extra argv entries; each config entry may carry several
/// space-separated tokens.
pub(crate) fn parse_additional_args(section_values: &Value) -> Vec<String> {
    config::get_path(section_values, &["additional_args"])
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .flat_map(|entry| entry.split_whitespace().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
