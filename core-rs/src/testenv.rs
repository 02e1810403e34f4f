//! Suite execution environment
//!
//! Shared by every controlled process of one suite run: the run directory
//! root, the installation trees, the layered configuration sources, the
//! resource pool and the teardown registry.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_yaml::Value;

use crate::config;
use crate::errors::Result;
use crate::lifecycle::TeardownRegistry;
use crate::paths::RunDir;
use crate::resource::ResourcePool;
use crate::template::TemplateRenderer;

pub struct TestEnv {
    run_root: RunDir,
    inst_root: PathBuf,
    registry: Arc<TeardownRegistry>,
    pool: Mutex<ResourcePool>,
    defaults: Value,
    suite_config: Value,
    renderer: Box<dyn TemplateRenderer>,
}

impl TestEnv {
    /// `defaults` maps a defaults section name (e.g. `srsepc`) to its
    /// mapping; `suite_config` maps a config section name (e.g. `epc`,
    /// `enb`, `modem`) to the suite-level overrides.
    pub fn new(
        run_root: RunDir,
        inst_root: PathBuf,
        defaults: Value,
        suite_config: Value,
        renderer: Box<dyn TemplateRenderer>,
    ) -> Self {
        TestEnv {
            run_root,
            inst_root,
            registry: Arc::new(TeardownRegistry::new()),
            pool: Mutex::new(ResourcePool::new()),
            defaults,
            suite_config,
            renderer,
        }
    }

    pub fn run_root(&self) -> &RunDir {
        &self.run_root
    }

    /// Installation tree for a process, optionally per run label when
    /// several builds are staged side by side.
    pub fn get_inst(&self, run_label: Option<&str>) -> PathBuf {
        match run_label {
            Some(label) => self.inst_root.join(label),
            None => self.inst_root.clone(),
        }
    }

    pub fn registry(&self) -> &TeardownRegistry {
        &self.registry
    }

    /// Shareable registry handle, e.g. for a Ctrl+C unwinder.
    pub fn registry_handle(&self) -> Arc<TeardownRegistry> {
        self.registry.clone()
    }

    /// Defaults for one section, empty mapping when absent.
    pub fn defaults(&self, section: &str) -> Value {
        config::get_path(&self.defaults, &[section])
            .cloned()
            .unwrap_or_else(config::empty)
    }

    /// Suite-level configuration for one section, empty mapping when absent.
    pub fn suite_config(&self, section: &str) -> Value {
        config::get_path(&self.suite_config, &[section])
            .cloned()
            .unwrap_or_else(config::empty)
    }

    pub fn render(&self, template_name: &str, values: &Value) -> Result<String> {
        self.renderer.render(template_name, values)
    }

    pub fn next_port_range(&self, owner: &str, count: u16) -> Result<u16> {
        self.pool
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .next_port_range(owner, count)
    }

    pub fn next_msisdn(&self) -> String {
        self.pool
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .next_msisdn()
    }

    /// Unwind the teardown stack, stopping every registered process in
    /// reverse launch order.
    pub fn stop_all(&self) {
        self.registry.unwind();
    }
}
