//! EPC (core network) process wrapper
//!
//! Owns the HSS subscriber list: append-only during suite setup, frozen once
//! the configuration is generated. Every subscriber's QoS class is derived
//! from the configured DRB mode right before the final overlay, so the
//! computed records always win.

use std::fs;

use serde_yaml::Value;
use tracing::{debug, info};

use super::{active_path, local_path, overlay_artifact_paths, parse_script_list, remote_path};
use crate::binprep;
use crate::config::{self, tables};
use crate::errors::{HarnessError, Result};
use crate::lifecycle::{ControlledProcess, ProcessCore, ProcessState};
use crate::paths::{ArtifactKind, RemoteLayout, RunPaths};
use crate::process::{LocalProcess, ProcessHandle, RemoteProcess};
use crate::remote::{RemoteHost, RunNode};
use crate::resource::{Subscriber, SubscriberSpec};
use crate::testenv::TestEnv;

pub struct EpcNode {
    core: ProcessCore,
    inst: Option<std::path::PathBuf>,
    gen_conf: Option<Value>,
    subscribers: Vec<Subscriber>,
    enable_pcap: bool,
}

impl EpcNode {
    pub const REMOTE_DIR: &'static str = "/lte-harness-srsepc";
    pub const BINFILE: &'static str = "srsepc";
    pub const CFGFILE: &'static str = "srsepc.conf";
    pub const DBFILE: &'static str = "srsepc_user_db.csv";
    pub const PCAPFILE: &'static str = "srsepc.pcap";
    pub const LOGFILE: &'static str = "srsepc.log";

    const MANIFEST: &'static [(ArtifactKind, &'static str)] = &[
        (ArtifactKind::Config, Self::CFGFILE),
        (ArtifactKind::Db, Self::DBFILE),
        (ArtifactKind::Log, Self::LOGFILE),
        (ArtifactKind::Pcap, Self::PCAPFILE),
    ];

    pub fn new(run_node: RunNode) -> Self {
        let name = format!("srsepc_{}", run_node.addr());
        EpcNode {
            core: ProcessCore::new(&name, run_node),
            inst: None,
            gen_conf: None,
            subscribers: Vec::new(),
            enable_pcap: false,
        }
    }

    pub fn addr(&self) -> &str {
        self.core.run_node.addr()
    }

    /// Address of the tunnel endpoint the core network exposes to attached
    /// subscribers.
    pub fn tun_addr(&self) -> &'static str {
        "172.16.0.1"
    }

    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }

    pub fn gen_conf(&self) -> Option<&Value> {
        self.gen_conf.as_ref()
    }

    /// Append a subscriber record; id is the list index. Mutating the list
    /// after the configuration has been generated has no effect on the
    /// already-written user db.
    pub fn subscriber_add(&mut self, env: &TestEnv, spec: SubscriberSpec) -> Result<usize> {
        let msisdn = match spec.msisdn.clone() {
            Some(msisdn) => msisdn,
            None => env.next_msisdn(),
        };
        let id = self.subscribers.len();
        let sub = Subscriber::from_spec(id, spec, msisdn)?;
        info!(
            imsi = %sub.imsi,
            msisdn = %sub.msisdn,
            subscriber_id = id,
            algo = %sub.auth_algo,
            "add subscriber"
        );
        self.subscribers.push(sub);
        Ok(id)
    }

    /// Whether a base station completed S1 setup against this core network.
    /// Match against sample line:
    /// "S1 Setup Request - eNB Name: srsenb01, eNB id: 0x19"
    pub fn enb_is_connected(&self, enb_id: u32) -> bool {
        let needle = format!("eNB id: {:#x}", enb_id);
        self.core
            .get_stdout()
            .lines()
            .any(|line| line.starts_with("S1 Setup Request") && line.ends_with(&needle))
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

            info!(target = %rem_host.target(), "staging srsepc to remote host");
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
                .and_then(|_| {
                    rem_host.scp_to(
                        "scp-db-to-remote",
                        local_path(paths, ArtifactKind::Db)?,
                        remote_path(paths, ArtifactKind::Db)?,
                    )
                })
        };
        match staged {
            Ok(()) => {
                self.core.state = ProcessState::Staged;
                Ok(())
            }
            Err(e) => {
                // Never launch a partially-staged process.
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
        binprep::setcap_net_admin(&binary, &run_dir)?;

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
            Vec::new(),
        )) as Box<dyn ProcessHandle>;
        self.core.launch_main(env.registry(), handle)
    }

    fn start_remotely(&mut self, env: &TestEnv) -> Result<()> {
        let run_dir = self.core.expect_run_dir()?.clone();
        let rem_host: RemoteHost = self.core.expect_rem_host()?.clone();
        let (remote_binary, remote_lib, remote_argv) = {
            let paths = self.core.expect_paths()?;
            let layout = paths.layout().ok_or_else(|| {
                HarnessError::Process(format!("{}: no remote layout", self.core.name))
            })?;
            let remote_inst = layout.inst_dir();
            let remote_binary = remote_inst.join("bin").join(Self::BINFILE);
            let remote_lib = remote_inst.join("lib");
            let mut remote_argv = vec![
                remote_binary.display().to_string(),
                active_path(paths, ArtifactKind::Config)?.display().to_string(),
            ];
            remote_argv.extend(self.core.additional_args.clone());
            (remote_binary, remote_lib, remote_argv)
        };

        rem_host.change_elf_rpath(&remote_binary, &remote_lib)?;
        rem_host.setcap_net_admin(&remote_binary)?;

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

impl ControlledProcess for EpcNode {
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
        let suite_conf = env.suite_config("epc");

        let remote_layout = if self.core.run_node.is_local() {
            None
        } else {
            let prefix = config::get_str(&suite_conf, &["remote_dir"])
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|| std::path::PathBuf::from(Self::REMOTE_DIR));
            self.core.rem_host = Some(RemoteHost::new(
                run_dir.clone(),
                self.core.run_node.ssh_target()?.clone(),
            ));
            Some(RemoteLayout::new(&prefix, Self::BINFILE, &inst)?)
        };

        let paths = RunPaths::resolve(&run_dir, Self::MANIFEST, remote_layout);

        // defaults -> suite config -> computed values, computed last.
        let mut values = config::empty();
        config::overlay_at(&mut values, &["epc"], env.defaults("srsepc"));
        config::overlay_at(&mut values, &["epc"], suite_conf);
        config::overlay_at(
            &mut values,
            &["epc", "run_addr"],
            Value::String(self.core.run_node.addr().to_string()),
        );
        overlay_artifact_paths(
            &mut values,
            "epc",
            &paths,
            &[ArtifactKind::Db, ArtifactKind::Log, ArtifactKind::Pcap],
        );

        self.enable_pcap = config::get_str(&values, &["epc", "enable_pcap"])
            .map(config::str2bool)
            .unwrap_or(false);
        config::overlay_at(
            &mut values,
            &["epc", "enable_pcap"],
            Value::Bool(self.enable_pcap),
        );

        // QoS class for every subscriber: explicit qci wins, otherwise it is
        // derived from the DRB mode.
        let qci = match config::get_path(&values, &["epc", "qci"]).and_then(Value::as_u64) {
            Some(qci) => qci,
            None => {
                let mode = config::get_str(&values, &["epc", "rlc_drb_mode"]).ok_or_else(|| {
                    HarnessError::Config(
                        "epc config carries neither qci nor rlc_drb_mode".to_string(),
                    )
                })?;
                u64::from(tables::rlc_drb_mode_to_qci(mode)?)
            }
        };
        for sub in &mut self.subscribers {
            sub.qci = Some(qci);
        }
        config::overlay_at(
            &mut values,
            &["epc", "hss", "subscribers"],
            serde_yaml::to_value(&self.subscribers)?,
        );

        self.core.prerun_scripts = parse_script_list(&values["epc"], "prerun_scripts");
        self.core.postrun_scripts = parse_script_list(&values["epc"], "postrun_scripts");

        debug!(config = ?values, "srsepc config");
        let cfg_text = env.render(Self::CFGFILE, &values)?;
        fs::write(local_path(&paths, ArtifactKind::Config)?, cfg_text)?;
        let db_text = env.render(Self::DBFILE, &values)?;
        fs::write(local_path(&paths, ArtifactKind::Db)?, db_text)?;

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
        info!(process = %self.core.name, "starting srsepc");
        match self.core.state {
            ProcessState::Configured | ProcessState::Staged => {}
            other => {
                return Err(HarnessError::Process(format!(
                    "{}: start from state {:?}",
                    self.core.name, other
                )))
            }
        }

        // A failing pre-run task aborts before the main process launches.
        self.core.prerun_tasks()?;

        if self.core.run_node.is_local() {
            self.start_locally(env)
        } else {
            self.start_remotely(env)
        }
    }

    fn cleanup(&mut self, _env: &TestEnv) -> Result<()> {
        if self.core.process.is_none() {
            return Ok(());
        }
        if self.core.running() {
            self.core.stop();
        }
        self.core.postrun_tasks();

        if !self.core.run_node.is_local() {
            // Files may not exist, for instance after an early process error.
            let mut kinds = vec![ArtifactKind::Log];
            if self.enable_pcap {
                kinds.push(ArtifactKind::Pcap);
            }
            self.core.pull_artifacts(&kinds);
        }
        self.core.state = ProcessState::Terminated;
        Ok(())
    }
}
