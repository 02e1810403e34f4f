//! eNodeB (base station) process wrapper

use std::fs;
use std::path::PathBuf;

use serde_yaml::Value;
use tracing::{debug, info, warn};

use super::{active_path, local_path, overlay_artifact_paths, parse_additional_args, parse_script_list, remote_path};
use crate::config::{self, tables};
use crate::errors::{HarnessError, Result};
use crate::lifecycle::{ControlledProcess, ProcessCore, ProcessState};
use crate::metrics::{self, Criterion, MetricsFile, Operation};
use crate::paths::{ArtifactKind, RemoteLayout, RunPaths};
use crate::process::{LocalProcess, ProcessHandle, RemoteProcess};
use crate::remote::{RemoteHost, RunNode};
use crate::binprep;
use crate::testenv::TestEnv;

/// RF front-end drivers this wrapper can configure.
pub const RF_DEV_TYPES: &[&str] = &["zmq", "uhd", "soapy", "bladerf", "fapi"];

pub struct EnbNode {
    core: ProcessCore,
    conf: Value,
    inst: Option<PathBuf>,
    gen_conf: Option<Value>,
    epc_addr: Option<String>,
    num_prb: u16,
    enable_pcap: bool,
    enable_tracing: bool,
    enable_malloc_interceptor: bool,
    enable_ul_qam64: bool,
    have_metrics: bool,
}

impl EnbNode {
    pub const REMOTE_DIR: &'static str = "/lte-harness-srsenb";
    pub const BINFILE: &'static str = "srsenb";
    pub const CFGFILE: &'static str = "srsenb.conf";
    pub const CFGFILE_SIB: &'static str = "srsenb_sib.conf";
    pub const CFGFILE_RR: &'static str = "srsenb_rr.conf";
    pub const CFGFILE_RB: &'static str = "srsenb_rb.conf";
    pub const LOGFILE: &'static str = "srsenb.log";
    pub const PCAPFILE: &'static str = "srsenb_mac.pcap";
    pub const S1AP_PCAPFILE: &'static str = "srsenb_s1ap.pcap";
    pub const TRACINGFILE: &'static str = "srsenb_tracing.log";
    pub const METRICSFILE: &'static str = "srsenb_metrics.csv";
    pub const INTERCEPTORFILE: &'static str = "srsenb_minterceptor.log";

    const MANIFEST: &'static [(ArtifactKind, &'static str)] = &[
        (ArtifactKind::Config, Self::CFGFILE),
        (ArtifactKind::ConfigSib, Self::CFGFILE_SIB),
        (ArtifactKind::ConfigRr, Self::CFGFILE_RR),
        (ArtifactKind::ConfigRb, Self::CFGFILE_RB),
        (ArtifactKind::Log, Self::LOGFILE),
        (ArtifactKind::Pcap, Self::PCAPFILE),
        (ArtifactKind::S1apPcap, Self::S1AP_PCAPFILE),
        (ArtifactKind::Metrics, Self::METRICSFILE),
        (ArtifactKind::Tracing, Self::TRACINGFILE),
        (ArtifactKind::Interceptor, Self::INTERCEPTORFILE),
    ];

    /// `conf` is the resource-specific configuration of this instance.
    pub fn new(run_node: RunNode, conf: Value) -> Result<Self> {
        let rf_dev_type = config::get_str(&conf, &["rf_dev_type"]).unwrap_or("");
        if !RF_DEV_TYPES.contains(&rf_dev_type) {
            return Err(HarnessError::Config(format!(
                "invalid rf_dev_type={}",
                if rf_dev_type.is_empty() { "None" } else { rf_dev_type }
            )));
        }
        let name = format!("srsenb_{}", run_node.addr());
        Ok(EnbNode {
            core: ProcessCore::new(&name, run_node),
            conf,
            inst: None,
            gen_conf: None,
            epc_addr: None,
            num_prb: 100,
            enable_pcap: false,
            enable_tracing: false,
            enable_malloc_interceptor: false,
            enable_ul_qam64: false,
            have_metrics: false,
        })
    }

    /// Core-network address rendered into the S1 configuration; computed
    /// values win over any statically-configured address.
    pub fn set_epc_addr(&mut self, addr: &str) {
        self.epc_addr = Some(addr.to_string());
    }

    pub fn addr(&self) -> &str {
        self.core.run_node.addr()
    }

    pub fn num_prb(&self) -> u16 {
        self.num_prb
    }

    pub fn enable_ul_qam64(&self) -> bool {
        self.enable_ul_qam64
    }

    pub fn gen_conf(&self) -> Option<&Value> {
        self.gen_conf.as_ref()
    }

    pub fn get_counter(&self, counter_name: &str) -> Result<usize> {
        match counter_name {
            "prach_received" => Ok(self.core.count_in_stdout("RACH:")),
            other => Err(HarnessError::Config(format!(
                "counter {} not implemented",
                other
            ))),
        }
    }

    /// Counter snapshot extracted from the accumulated console output.
    pub fn kpi_summary(&self) -> Vec<(&'static str, usize)> {
        vec![("prach_received", self.core.count_in_stdout("RACH:"))]
    }

    /// Copy back the metrics file if that has not happened yet. The file is
    /// not fully flushed until the process stops, so a running process is
    /// stopped first. Only the explicit mid-test retrieval passes
    /// `required = true`; best-effort cleanup swallows the failure.
    pub fn retrieve_metrics(&mut self, required: bool) -> Result<()> {
        if self.have_metrics {
            debug!(process = %self.core.name, "metrics already copied back");
            return Ok(());
        }
        if self.core.running() {
            self.core.stop();
        }
        if !self.core.run_node.is_local() {
            let paths = self.core.expect_paths()?;
            let rem_host = self.core.expect_rem_host()?;
            rem_host.pull(
                "scp-back-metrics",
                remote_path(paths, ArtifactKind::Metrics)?,
                local_path(paths, ArtifactKind::Metrics)?,
                required,
            )?;
        }
        self.have_metrics = true;
        Ok(())
    }

    /// Aggregate a metric from the pulled CSV and compare it against a
    /// threshold. The retrieval is mandatory here: an unreachable host
    /// fails the verification instead of being swallowed.
    pub fn verify_metric(
        &mut self,
        value: f64,
        operation: Operation,
        metric: &str,
        criterion: Criterion,
        window: usize,
    ) -> Result<String> {
        self.retrieve_metrics(true)?;
        let path = {
            let paths = self.core.expect_paths()?;
            local_path(paths, ArtifactKind::Metrics)?.to_path_buf()
        };
        let data = MetricsFile::from_path(&path)?;
        metrics::verify(&data, value, operation, metric, criterion, window)
    }

    fn stage(&mut self) -> Result<()> {
        let staged = {
            let paths = self.core.expect_paths()?;
            let layout = paths.layout().ok_or_else(|| {
                HarnessError::Process(format!("{}: staging without remote layout", self.core.name))
            })?;
            let rem_host = self.core.expect_rem_host()?;
            let inst = self.inst.as_deref().ok_or_else(|| {
                HarnessError::Process(format!("{}: staging before configure", self.core.name))
            })?;

            info!(target = %rem_host.target(), "staging srsenb to remote host");
            let configs = [
                ("scp-cfg-to-remote", ArtifactKind::Config),
                ("scp-cfg-sib-to-remote", ArtifactKind::ConfigSib),
                ("scp-cfg-rr-to-remote", ArtifactKind::ConfigRr),
                ("scp-cfg-rb-to-remote", ArtifactKind::ConfigRb),
            ];
            rem_host
                .recreate_remote_dir(&layout.inst_dir())
                .and_then(|_| rem_host.scp_to("scp-inst-to-remote", inst, layout.prefix()))
                .and_then(|_| rem_host.recreate_remote_dir(&layout.run_dir()))
                .and_then(|_| {
                    for (op, kind) in configs {
                        rem_host.scp_to(op, local_path(paths, kind)?, remote_path(paths, kind)?)?;
                    }
                    Ok(())
                })
        };
        match staged {
            Ok(()) => {
                self.core.state = ProcessState::Staged;
                Ok(())
            }
            Err(e) => {
                self.core.state = ProcessState::Terminated;
                Err(HarnessError::Staging(e.to_string()))
            }
        }
    }

    fn start_locally(&mut self, env: &TestEnv) -> Result<()> {
        let inst = self
            .inst
            .clone()
            .ok_or_else(|| HarnessError::Process(format!("{}: not configured", self.core.name)))?;
        let run_dir = self.core.expect_run_dir()?.clone();
        let binary = inst.join("bin").join(Self::BINFILE);
        let lib = inst.join("lib");
        let env_vars = vec![(
            "LD_LIBRARY_PATH".to_string(),
            binprep::prepend_library_path(&lib),
        )];

        let mut argv = vec![binary.display().to_string()];
        {
            let paths = self.core.expect_paths()?;
            argv.push(active_path(paths, ArtifactKind::Config)?.display().to_string());
        }
        argv.extend(self.core.additional_args.clone());

        let handle = Box::new(LocalProcess::new(
            &self.core.name,
            run_dir.path(),
            argv,
            env_vars,
        )) as Box<dyn ProcessHandle>;
        self.core.launch_main(env.registry(), handle)
    }

    fn start_remotely(&mut self, env: &TestEnv) -> Result<()> {
        let run_dir = self.core.expect_run_dir()?.clone();
        let rem_host: RemoteHost = self.core.expect_rem_host()?.clone();

        let mut remote_env = Vec::new();
        let (remote_argv, stderr_redirect) = {
            let paths = self.core.expect_paths()?;
            let layout = paths.layout().ok_or_else(|| {
                HarnessError::Process(format!("{}: no remote layout", self.core.name))
            })?;
            let remote_inst = layout.inst_dir();
            remote_env.push((
                "LD_LIBRARY_PATH".to_string(),
                remote_inst.join("lib").display().to_string(),
            ));
            if self.enable_malloc_interceptor {
                let path = config::get_str(&self.conf, &["malloc_interceptor_path"])
                    .ok_or_else(|| {
                        HarnessError::Config(
                            "malloc interceptor enabled without malloc_interceptor_path"
                                .to_string(),
                        )
                    })?;
                info!(path, "setting LD_PRELOAD for malloc interceptor");
                remote_env.push(("LD_PRELOAD".to_string(), path.to_string()));
            }

            let mut remote_argv = vec![
                remote_inst.join("bin").join(Self::BINFILE).display().to_string(),
                active_path(paths, ArtifactKind::Config)?.display().to_string(),
            ];
            remote_argv.extend(self.core.additional_args.clone());

            // The interceptor writes to stderr; pin it to its own file.
            let stderr_redirect = if self.enable_malloc_interceptor {
                Some(remote_path(paths, ArtifactKind::Interceptor)?.to_path_buf())
            } else {
                None
            };
            (remote_argv, stderr_redirect)
        };

        let handle = Box::new(RemoteProcess::new(
            &self.core.name,
            run_dir.path(),
            rem_host,
            &remote_argv,
            &remote_env,
            stderr_redirect.as_deref(),
        )) as Box<dyn ProcessHandle>;
        self.core.launch_main(env.registry(), handle)
    }
}

impl ControlledProcess for EnbNode {
    fn core(&self) -> &ProcessCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }

    fn configure(&mut self, env: &TestEnv) -> Result<()> {
        if self.core.state != ProcessState::Idle {
            return Err(HarnessError::Process(format!(
                "{}: configure from state {:?}",
                self.core.name, self.core.state
            )));
        }

        let inst = env.get_inst(self.core.run_node.label());
        if !inst.join("lib").is_dir() {
            return Err(HarnessError::Launch(format!(
                "no lib/ in {}",
                inst.display()
            )));
        }
        let binary = inst.join("bin").join(Self::BINFILE);
        if !binary.is_file() {
            return Err(HarnessError::Launch(format!(
                "binary missing: {}",
                binary.display()
            )));
        }

        let run_dir = env.run_root().new_dir(&self.core.name)?;

        let remote_layout = if self.core.run_node.is_local() {
            None
        } else {
            // The default prefix can be moved by the resource configuration.
            let prefix = config::get_str(&self.conf, &["remote_dir"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(Self::REMOTE_DIR));
            self.core.rem_host = Some(RemoteHost::new(
                run_dir.clone(),
                self.core.run_node.ssh_target()?.clone(),
            ));
            Some(RemoteLayout::new(&prefix, &self.core.name, &inst)?)
        };

        let paths = RunPaths::resolve(&run_dir, Self::MANIFEST, remote_layout);

        // defaults -> suite config -> resource config -> computed values.
        let mut values = config::empty();
        config::overlay_at(&mut values, &["enb"], env.defaults("srsenb"));
        config::overlay_at(&mut values, &["enb"], env.suite_config("enb"));
        config::overlay_at(&mut values, &["enb"], self.conf.clone());
        overlay_artifact_paths(
            &mut values,
            "enb",
            &paths,
            &[
                ArtifactKind::ConfigSib,
                ArtifactKind::ConfigRr,
                ArtifactKind::ConfigRb,
                ArtifactKind::Log,
                ArtifactKind::Pcap,
                ArtifactKind::S1apPcap,
                ArtifactKind::Metrics,
                ArtifactKind::Tracing,
            ],
        );
        if let Some(addr) = &self.epc_addr {
            config::overlay_at(&mut values, &["enb", "mme_addr"], Value::String(addr.clone()));
        }

        self.enable_pcap = config::get_str(&values, &["enb", "enable_pcap"])
            .map(config::str2bool)
            .unwrap_or(false);
        self.enable_tracing = config::get_str(&values, &["enb", "enable_tracing"])
            .map(config::str2bool)
            .unwrap_or(false);
        self.enable_malloc_interceptor =
            config::get_str(&values, &["enb", "enable_malloc_interceptor"])
                .map(config::str2bool)
                .unwrap_or(false);
        self.enable_ul_qam64 = config::get_str(&values, &["enb", "enable_ul_qam64"])
            .map(config::str2bool)
            .unwrap_or(false);
        config::overlay_at(&mut values, &["enb", "enable_pcap"], Value::Bool(self.enable_pcap));
        config::overlay_at(
            &mut values,
            &["enb", "enable_tracing"],
            Value::Bool(self.enable_tracing),
        );
        config::overlay_at(
            &mut values,
            &["enb", "enable_ul_qam64"],
            Value::Bool(self.enable_ul_qam64),
        );

        self.num_prb = config::get_path(&values, &["enb", "num_prb"])
            .and_then(Value::as_u64)
            .unwrap_or(100) as u16;
        // Rejects cells wider than the supported table instead of clamping.
        tables::num_prb_to_symbol_size(self.num_prb)?;

        // The simulated RF front-end shares the sample rate with the modem.
        if config::get_str(&values, &["enb", "rf_dev_type"]) == Some("zmq") {
            config::overlay_at(
                &mut values,
                &["enb", "base_srate"],
                Value::from(u64::from(tables::num_prb_to_base_srate(self.num_prb)?)),
            );
        }

        self.core.additional_args = parse_additional_args(&values["enb"]);
        self.core.prerun_scripts = parse_script_list(&self.conf, "prerun_scripts");
        self.core.postrun_scripts = parse_script_list(&self.conf, "postrun_scripts");

        debug!(config = ?values, "srsenb config");
        let files = [
            (Self::CFGFILE, ArtifactKind::Config),
            (Self::CFGFILE_SIB, ArtifactKind::ConfigSib),
            (Self::CFGFILE_RR, ArtifactKind::ConfigRr),
            (Self::CFGFILE_RB, ArtifactKind::ConfigRb),
        ];
        for (template, kind) in files {
            let text = env.render(template, &values)?;
            fs::write(local_path(&paths, kind)?, text)?;
        }

        self.gen_conf = Some(values);
        self.inst = Some(inst);
        self.core.run_dir = Some(run_dir);
        self.core.paths = Some(paths);
        self.core.state = ProcessState::Configured;

        if !self.core.run_node.is_local() {
            self.stage()?;
        }
        Ok(())
    }

    fn start(&mut self, env: &TestEnv) -> Result<()> {
        info!(process = %self.core.name, "starting srsenb");
        match self.core.state {
            ProcessState::Configured | ProcessState::Staged => {}
            other => {
                return Err(HarnessError::Process(format!(
                    "{}: start from state {:?}",
                    self.core.name, other
                )))
            }
        }

        self.core.prerun_tasks()?;

        if self.core.run_node.is_local() {
            self.start_locally(env)?;
        } else {
            self.start_remotely(env)?;
        }

        // send t+Enter to enable console trace
        debug!(process = %self.core.name, "enabling console trace");
        self.core.stdin_write("t\n");
        Ok(())
    }

    fn cleanup(&mut self, _env: &TestEnv) -> Result<()> {
        if self.core.process.is_none() {
            return Ok(());
        }
        if self.core.running() {
            self.core.stop();
        }
        // Give attached modems time to tear down before files are collected.
        self.core.sleep_after_stop();

        self.core.postrun_tasks();

        if !self.core.run_node.is_local() {
            if let Err(e) = self.retrieve_metrics(false) {
                warn!(error_kind = e.kind(), error = %e, "metrics retrieval failed");
            }
            let mut kinds = vec![ArtifactKind::Log];
            if self.enable_pcap {
                kinds.push(ArtifactKind::Pcap);
                kinds.push(ArtifactKind::S1apPcap);
            }
            if self.enable_tracing {
                kinds.push(ArtifactKind::Tracing);
            }
            if self.enable_malloc_interceptor {
                kinds.push(ArtifactKind::Interceptor);
            }
            self.core.pull_artifacts(&kinds);
        }

        for (counter, count) in self.kpi_summary() {
            info!(process = %self.core.name, counter, count, "counter");
        }
        self.core.state = ProcessState::Terminated;
        Ok(())
    }
}
