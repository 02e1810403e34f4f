//! Config file rendering
//!
//! The vendor config grammar is owned by the template set; this module only
//! guarantees that every path placed into the value tree was already resolved
//! to the executing binary's namespace before rendering.

use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;

use crate::config;
use crate::errors::{HarnessError, Result};

pub trait TemplateRenderer: Send + Sync {
    /// Render the named template against a configuration tree.
    fn render(&self, template_name: &str, values: &Value) -> Result<String>;
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_.]+)\}").expect("placeholder regex"));

/// Replace `${dotted.key}` placeholders with scalar values from the tree.
pub fn substitute(text: &str, values: &Value, origin: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(text) {
        let whole = caps.get(0).expect("capture 0 always present");
        let key = &caps[1];
        let segments: Vec<&str> = key.split('.').collect();
        let value = config::get_path(values, &segments).ok_or_else(|| {
            HarnessError::Config(format!("template {}: no value for {}", origin, key))
        })?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&config::scalar_to_string(value)?);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Templates loaded from a directory, one file per template name.
pub struct DirTemplates {
    dir: PathBuf,
}

impl DirTemplates {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        DirTemplates { dir: dir.into() }
    }
}

impl TemplateRenderer for DirTemplates {
    fn render(&self, template_name: &str, values: &Value) -> Result<String> {
        let path = self.dir.join(template_name);
        let text = fs::read_to_string(&path)
            .map_err(|_| HarnessError::FileNotFound(path.display().to_string()))?;
        substitute(&text, values, template_name)
    }
}

/// Fallback renderer emitting the whole value tree as YAML. Used where no
/// vendor template set is installed (selftests, path inspection).
pub struct YamlRenderer;

impl TemplateRenderer for YamlRenderer {
    fn render(&self, _template_name: &str, values: &Value) -> Result<String> {
        Ok(serde_yaml::to_string(values)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_substitute_nested_keys() {
        let values = yaml("{epc: {run_addr: 10.0.0.1, hss: {db_filename: /run/db.csv}}}");
        let out = substitute(
            "mme_bind_addr = ${epc.run_addr}\ndb_file = ${epc.hss.db_filename}\n",
            &values,
            "srsepc.conf",
        )
        .unwrap();
        assert_eq!(out, "mme_bind_addr = 10.0.0.1\ndb_file = /run/db.csv\n");
    }

    #[test]
    fn test_substitute_missing_key_is_config_error() {
        let values = yaml("{epc: {}}");
        let err = substitute("addr = ${epc.run_addr}", &values, "srsepc.conf").unwrap_err();
        match err {
            HarnessError::Config(msg) => assert!(msg.contains("epc.run_addr")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_substitute_renders_numbers_and_bools() {
        let values = yaml("{enb: {n_prb: 50, enable_pcap: true}}");
        let out = substitute("${enb.n_prb} ${enb.enable_pcap}", &values, "t").unwrap();
        assert_eq!(out, "50 true");
    }

    #[test]
    fn test_dir_templates_reads_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("srsepc.conf"), "addr=${epc.run_addr}\n").unwrap();
        let renderer = DirTemplates::new(tmp.path());
        let out = renderer
            .render("srsepc.conf", &yaml("{epc: {run_addr: 1.2.3.4}}"))
            .unwrap();
        assert_eq!(out, "addr=1.2.3.4\n");
    }

    #[test]
    fn test_dir_templates_missing_file() {
        let tmp = TempDir::new().unwrap();
        let renderer = DirTemplates::new(tmp.path());
        assert!(matches!(
            renderer.render("nope.conf", &yaml("{}")),
            Err(HarnessError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_yaml_renderer_dumps_tree() {
        let out = YamlRenderer
            .render("anything", &yaml("{ue: {rf_dev_type: zmq}}"))
            .unwrap();
        assert!(out.contains("rf_dev_type: zmq"));
    }
}
