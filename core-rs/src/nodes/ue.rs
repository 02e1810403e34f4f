//! UE (modem) process wrapper
//!
//! The modem binary runs inside its own network namespace so the data plane
//! of the simulated subscriber never collides with the host network. All
//! protocol-level events are observed through fixed console markers; the
//! marker text is part of the wire contract with the binary and is matched
//! byte-exact.

use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value;
use tracing::{debug, info, warn};

use super::{active_path, local_path, overlay_artifact_paths, parse_additional_args, parse_script_list, remote_path};
use crate::binprep;
use crate::config::{self, tables};
use crate::errors::{HarnessError, Result};
use crate::lifecycle::{ControlledProcess, ProcessCore, ProcessState};
use crate::metrics::{self, Criterion, MetricsFile, Operation};
use crate::paths::{ArtifactKind, RemoteLayout, RunPaths};
use crate::process::{LocalProcess, ProcessHandle, RemoteProcess};
use crate::remote::{RemoteHost, RunNode};
use crate::resource::PORTS_PER_RADIO;
use crate::testenv::TestEnv;

/// RF front-end drivers this wrapper can configure.
pub const RF_DEV_TYPES: &[&str] = &["zmq", "uhd", "soapy", "bladerf"];

/// Console markers observed in the modem's stdout, by counter name.
const COUNTER_MARKERS: &[(&str, &str)] = &[
    ("handover_success", "HO successful"),
    ("prach_sent", "Random Access Transmission: seq="),
    ("prach_sent_nr", "Random Access Transmission: prach_occasion="),
    ("paging_received", "S-TMSI match in paging message"),
    ("reestablishment_attempts", "RRC Connection Reestablishment"),
    ("reestablishment_ok", "Reestablishment OK"),
    ("rrc_connected_transitions", "RRC Connected"),
    ("rrc_idle_transitions", "RRC IDLE"),
];

const ATTACH_MARKER: &str = "Network attach successful.";
const ATTACH_ADDR_MARKER: &str = "Network attach successful. IP: ";

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+(?:\.[0-9]+){3}").expect("ipv4 regex"));

pub struct UeNode {
    core: ProcessCore,
    conf: Value,
    inst: Option<PathBuf>,
    gen_conf: Option<Value>,
    enb_num_prb: u16,
    num_carriers: u64,
    num_nr_carriers: u64,
    zmq_base_port: Option<u16>,
    enable_pcap: bool,
    have_metrics: bool,
}

impl UeNode {
    pub const REMOTE_DIR: &'static str = "/lte-harness-srsue";
    pub const BINFILE: &'static str = "srsue";
    pub const CFGFILE: &'static str = "srsue.conf";
    pub const PCAPFILE: &'static str = "srsue.pcap";
    pub const LOGFILE: &'static str = "srsue.log";
    pub const METRICSFILE: &'static str = "srsue_metrics.csv";
    pub const NETNS: &'static str = "srsue1";

    const MANIFEST: &'static [(ArtifactKind, &'static str)] = &[
        (ArtifactKind::Config, Self::CFGFILE),
        (ArtifactKind::Log, Self::LOGFILE),
        (ArtifactKind::Pcap, Self::PCAPFILE),
        (ArtifactKind::Metrics, Self::METRICSFILE),
    ];

    /// A zmq-placed modem reserves its RF port range at construction time,
    /// before any configuration is generated.
    pub fn new(env: &TestEnv, run_node: RunNode, conf: Value) -> Result<Self> {
        let rf_dev_type = config::get_str(&conf, &["rf_dev_type"]).unwrap_or("");
        if !RF_DEV_TYPES.contains(&rf_dev_type) {
            return Err(HarnessError::Config(format!(
                "invalid rf_dev_type={}",
                if rf_dev_type.is_empty() { "None" } else { rf_dev_type }
            )));
        }
        let name = format!("srsue_{}", run_node.addr());
        let zmq_base_port = if rf_dev_type == "zmq" {
            Some(env.next_port_range(&name, PORTS_PER_RADIO)?)
        } else {
            None
        };
        Ok(UeNode {
            core: ProcessCore::new(&name, run_node),
            conf,
            inst: None,
            gen_conf: None,
            enb_num_prb: 100,
            num_carriers: 1,
            num_nr_carriers: 0,
            zmq_base_port,
            enable_pcap: false,
            have_metrics: false,
        })
    }

    pub fn addr(&self) -> &str {
        self.core.run_node.addr()
    }

    pub fn netns(&self) -> &'static str {
        Self::NETNS
    }

    pub fn zmq_base_bind_port(&self) -> Option<u16> {
        self.zmq_base_port
    }

    pub fn num_carriers(&self) -> u64 {
        self.num_carriers
    }

    pub fn num_nr_carriers(&self) -> u64 {
        self.num_nr_carriers
    }

    /// Cell width of the base station this modem attaches to; drives the
    /// derived sample rate.
    pub fn set_enb_num_prb(&mut self, num_prb: u16) {
        self.enb_num_prb = num_prb;
    }

    pub fn gen_conf(&self) -> Option<&Value> {
        self.gen_conf.as_ref()
    }

    /// Whether the modem is EMM registered.
    pub fn is_registered(&self) -> bool {
        self.core.get_stdout().contains(ATTACH_MARKER)
    }

    /// Whether the modem is RRC connected right now: the last connection
    /// marker must come after the last release marker.
    pub fn is_rrc_connected(&self) -> bool {
        let stdout = self.core.get_stdout();
        let connected = stdout.rfind("RRC Connected");
        let released = stdout.rfind("RRC IDLE");
        match (connected, released) {
            (Some(c), Some(r)) => c > r,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// IPv4 address assigned at attach, scraped from the attach marker line.
    pub fn assigned_addr(&self) -> Option<String> {
        let stdout = self.core.get_stdout();
        for line in stdout.lines().rev() {
            if line.contains(ATTACH_ADDR_MARKER) {
                return IPV4_RE.find(line).map(|m| m.as_str().to_string());
            }
        }
        None
    }

    pub fn get_counter(&self, counter_name: &str) -> Result<usize> {
        for (name, marker) in COUNTER_MARKERS {
            if *name == counter_name {
                return Ok(self.core.count_in_stdout(marker));
            }
        }
        Err(HarnessError::Config(format!(
            "counter {} not implemented",
            counter_name
        )))
    }

    /// Counter snapshot extracted from the accumulated console output.
    pub fn kpi_summary(&self) -> Vec<(&'static str, usize)> {
        let stdout = self.core.get_stdout();
        COUNTER_MARKERS
            .iter()
            .map(|&(name, marker)| (name, stdout.matches(marker).count()))
            .collect()
    }

    /// Copy back the metrics file if that has not happened yet. The file is
    /// not fully flushed until the process stops, so a running process is
    /// stopped first.
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

    /// Mandatory-retrieval metric verification against the pulled CSV.
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

    /// Configure and start against the given base station; the usual entry
    /// point from scenario code.
    pub fn connect(&mut self, env: &TestEnv, enb_num_prb: u16) -> Result<()> {
        info!(process = %self.core.name, "starting srsue");
        self.set_enb_num_prb(enb_num_prb);
        self.configure(env)?;
        self.start(env)
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

            info!(target = %rem_host.target(), "staging srsue to remote host");
            rem_host
                .recreate_remote_dir(&layout.inst_dir())
                .and_then(|_| rem_host.scp_to("scp-inst-to-remote", inst, layout.prefix()))
                .and_then(|_| rem_host.recreate_remote_dir(&layout.run_dir()))
                .and_then(|_| {
                    rem_host.scp_to(
                        "scp-cfg-to-remote",
                        local_path(paths, ArtifactKind::Config)?,
                        remote_path(paths, ArtifactKind::Config)?,
                    )
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

        // Capability grants disable LD_LIBRARY_PATH in the ELF loader, so
        // the rpath gets patched instead.
        binprep::change_elf_rpath(&binary, &binprep::prepend_library_path(&lib), &run_dir)?;
        // CAP_SYS_ADMIN to enter the network namespace, CAP_NET_ADMIN for
        // the tunnel device.
        binprep::setcap_netsys_admin(&binary, &run_dir)?;
        binprep::create_netns(self.netns(), &run_dir)?;

        let mut argv = vec![binary.display().to_string()];
        {
            let paths = self.core.expect_paths()?;
            argv.push(active_path(paths, ArtifactKind::Config)?.display().to_string());
        }
        argv.push(format!("--gw.netns={}", self.netns()));
        argv.extend(self.core.additional_args.clone());

        let handle = Box::new(LocalProcess::new(
            &self.core.name,
            run_dir.path(),
            argv,
            Vec::new(),
        )) as Box<dyn ProcessHandle>;
        self.core.launch_main(env.registry(), handle)
    }

    fn start_remotely(&mut self, env: &TestEnv) -> Result<()> {
        let run_dir = self.core.expect_run_dir()?.clone();
        let rem_host: RemoteHost = self.core.expect_rem_host()?.clone();
        let remote_argv = {
            let paths = self.core.expect_paths()?;
            let layout = paths.layout().ok_or_else(|| {
                HarnessError::Process(format!("{}: no remote layout", self.core.name))
            })?;
            let remote_inst = layout.inst_dir();
            let remote_binary = remote_inst.join("bin").join(Self::BINFILE);
            rem_host.change_elf_rpath(&remote_binary, &remote_inst.join("lib"))?;
            rem_host.setcap_netsys_admin(&remote_binary)?;
            rem_host.create_netns(self.netns())?;

            let mut remote_argv = vec![
                remote_binary.display().to_string(),
                active_path(paths, ArtifactKind::Config)?.display().to_string(),
                format!("--gw.netns={}", self.netns()),
            ];
            remote_argv.extend(self.core.additional_args.clone());
            remote_argv
        };

        let handle = Box::new(RemoteProcess::new(
            &self.core.name,
            run_dir.path(),
            rem_host,
            &remote_argv,
            &[],
            None,
        )) as Box<dyn ProcessHandle>;
        self.core.launch_main(env.registry(), handle)
    }
}

impl ControlledProcess for UeNode {
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
            let prefix = config::get_str(&self.conf, &["remote_dir"])
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(Self::REMOTE_DIR));
            self.core.rem_host = Some(RemoteHost::new(
                run_dir.clone(),
                self.core.run_node.ssh_target()?.clone(),
            ));
            Some(RemoteLayout::new(&prefix, Self::BINFILE, &inst)?)
        };

        let paths = RunPaths::resolve(&run_dir, Self::MANIFEST, remote_layout);

        // defaults -> suite config -> resource config -> computed values.
        let mut values = config::empty();
        config::overlay_at(&mut values, &["ue"], env.defaults("srsue"));
        config::overlay_at(&mut values, &["ue"], env.suite_config("modem"));
        config::overlay_at(&mut values, &["ue"], self.conf.clone());
        overlay_artifact_paths(
            &mut values,
            "ue",
            &paths,
            &[ArtifactKind::Log, ArtifactKind::Pcap, ArtifactKind::Metrics],
        );

        self.enable_pcap = config::get_str(&values, &["ue", "enable_pcap"])
            .map(config::str2bool)
            .unwrap_or(false);
        config::overlay_at(&mut values, &["ue", "enable_pcap"], Value::Bool(self.enable_pcap));

        self.num_carriers = config::get_path(&values, &["ue", "num_carriers"])
            .and_then(Value::as_u64)
            .unwrap_or(1);
        self.num_nr_carriers = config::get_path(&values, &["ue", "num_nr_carriers"])
            .and_then(Value::as_u64)
            .unwrap_or(0);

        // The simulated RF front-end shares the base station's sample rate;
        // the port range was reserved at construction.
        if config::get_str(&values, &["ue", "rf_dev_type"]) == Some("zmq") {
            config::overlay_at(
                &mut values,
                &["ue", "base_srate"],
                Value::from(u64::from(tables::num_prb_to_base_srate(self.enb_num_prb)?)),
            );
            if let Some(port) = self.zmq_base_port {
                config::overlay_at(
                    &mut values,
                    &["ue", "zmq_base_port"],
                    Value::from(u64::from(port)),
                );
            }
        }

        self.core.additional_args = parse_additional_args(&values["ue"]);
        self.core.prerun_scripts = parse_script_list(&self.conf, "prerun_scripts");
        self.core.postrun_scripts = parse_script_list(&self.conf, "postrun_scripts");

        debug!(config = ?values, "srsue config");
        let cfg_text = env.render(Self::CFGFILE, &values)?;
        fs::write(local_path(&paths, ArtifactKind::Config)?, cfg_text)?;

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
        // Give the attach teardown time to settle before collecting files.
        self.core.sleep_after_stop();

        self.core.postrun_tasks();

        if !self.core.run_node.is_local() {
            if let Err(e) = self.retrieve_metrics(false) {
                warn!(error_kind = e.kind(), error = %e, "metrics retrieval failed");
            }
            let mut kinds = vec![ArtifactKind::Log];
            if self.enable_pcap {
                kinds.push(ArtifactKind::Pcap);
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
