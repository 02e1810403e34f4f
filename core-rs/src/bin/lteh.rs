//! lteh - LTE harness CLI
//!
//! Inspection and one-shot entry points into the harness core: verify a
//! metrics CSV against a threshold, print derived radio parameters, print
//! the resolved artifact manifest for a node kind, or supervise a single
//! binary with Ctrl+C teardown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;

use lte_harness::config::tables;
use lte_harness::lifecycle::TeardownRegistry;
use lte_harness::metrics::{self, Criterion, MetricsFile, Operation};
use lte_harness::paths::{ArtifactKind, RemoteLayout, RunDir, RunPaths};
use lte_harness::process::{LocalProcess, ProcessHandle};
use lte_harness::{EnbNode, EpcNode, HarnessError, UeNode};

#[derive(Parser)]
#[command(name = "lteh")]
#[command(version)]
#[command(about = "LTE harness process core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an aggregated metric from a CSV file against a threshold
    VerifyMetrics {
        /// Metrics CSV file (;-delimited, header row, cc column)
        #[arg(long)]
        file: PathBuf,
        /// Metric column name, or a +-joined sum of columns
        #[arg(long, default_value = "dl_brate")]
        metric: String,
        /// Aggregation (avg, sum, max_rolling_avg, min_rolling_avg)
        #[arg(long, default_value = "avg")]
        operation: String,
        /// Comparison (eq, gt, lt)
        #[arg(long, default_value = "gt")]
        criterion: String,
        /// Threshold value
        #[arg(long)]
        value: f64,
        /// Rolling average window size
        #[arg(long, default_value_t = 1)]
        window: usize,
    },
    /// Print derived radio parameters for a PRB count
    Bandwidth {
        /// Number of physical resource blocks
        #[arg(long)]
        num_prb: u16,
    },
    /// Print the resolved artifact path manifest for a node kind
    Paths {
        /// Node kind (epc, enb, ue)
        kind: String,
        /// Run directory root
        #[arg(long, default_value = ".")]
        run_dir: PathBuf,
        /// Resolve remote paths against this installation directory
        #[arg(long)]
        remote_inst: Option<PathBuf>,
    },
    /// Supervise one local binary until it exits or Ctrl+C unwinds it
    Run {
        /// Process name (used for the run subdirectory)
        #[arg(long)]
        name: String,
        /// Run directory root
        #[arg(long, default_value = ".")]
        run_dir: PathBuf,
        /// Binary and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        argv: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::VerifyMetrics {
            file,
            metric,
            operation,
            criterion,
            value,
            window,
        } => cmd_verify_metrics(&file, &metric, &operation, &criterion, value, window),
        Commands::Bandwidth { num_prb } => cmd_bandwidth(num_prb),
        Commands::Paths {
            kind,
            run_dir,
            remote_inst,
        } => cmd_paths(&kind, &run_dir, remote_inst.as_deref()),
        Commands::Run { name, run_dir, argv } => cmd_run(&name, &run_dir, argv),
    }
}

fn cmd_verify_metrics(
    file: &std::path::Path,
    metric: &str,
    operation: &str,
    criterion: &str,
    value: f64,
    window: usize,
) -> anyhow::Result<()> {
    let operation: Operation = operation.parse()?;
    let criterion: Criterion = criterion.parse()?;
    let data = MetricsFile::from_path(file)?;

    match metrics::verify(&data, value, operation, metric, criterion, window) {
        Ok(msg) => {
            println!("{} {}", "PASS".green().bold(), msg);
            Ok(())
        }
        Err(HarnessError::MetricThreshold { msg, .. }) => {
            println!("{} {}", "FAIL".red().bold(), msg);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_bandwidth(num_prb: u16) -> anyhow::Result<()> {
    let symbol_size = tables::num_prb_to_symbol_size(num_prb)?;
    let base_srate = tables::num_prb_to_base_srate(num_prb)?;
    let bandwidth = tables::num_prb_to_bandwidth_mhz(num_prb)?;
    println!("num_prb:     {}", num_prb);
    println!("symbol_size: {}", symbol_size);
    println!("base_srate:  {} Hz", base_srate);
    println!("bandwidth:   {} MHz", bandwidth);
    Ok(())
}

fn cmd_paths(
    kind: &str,
    run_dir: &std::path::Path,
    remote_inst: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let (manifest, remote_prefix, instance): (Vec<(ArtifactKind, &str)>, &str, String) = match kind
    {
        "epc" => (
            vec![
                (ArtifactKind::Config, EpcNode::CFGFILE),
                (ArtifactKind::Db, EpcNode::DBFILE),
                (ArtifactKind::Log, EpcNode::LOGFILE),
                (ArtifactKind::Pcap, EpcNode::PCAPFILE),
            ],
            EpcNode::REMOTE_DIR,
            EpcNode::BINFILE.to_string(),
        ),
        "enb" => (
            vec![
                (ArtifactKind::Config, EnbNode::CFGFILE),
                (ArtifactKind::ConfigSib, EnbNode::CFGFILE_SIB),
                (ArtifactKind::ConfigRr, EnbNode::CFGFILE_RR),
                (ArtifactKind::ConfigRb, EnbNode::CFGFILE_RB),
                (ArtifactKind::Log, EnbNode::LOGFILE),
                (ArtifactKind::Pcap, EnbNode::PCAPFILE),
                (ArtifactKind::S1apPcap, EnbNode::S1AP_PCAPFILE),
                (ArtifactKind::Metrics, EnbNode::METRICSFILE),
                (ArtifactKind::Tracing, EnbNode::TRACINGFILE),
                (ArtifactKind::Interceptor, EnbNode::INTERCEPTORFILE),
            ],
            EnbNode::REMOTE_DIR,
            format!("{}_local", EnbNode::BINFILE),
        ),
        "ue" => (
            vec![
                (ArtifactKind::Config, UeNode::CFGFILE),
                (ArtifactKind::Log, UeNode::LOGFILE),
                (ArtifactKind::Pcap, UeNode::PCAPFILE),
                (ArtifactKind::Metrics, UeNode::METRICSFILE),
            ],
            UeNode::REMOTE_DIR,
            UeNode::BINFILE.to_string(),
        ),
        other => bail!("unknown node kind {other}; expected epc, enb or ue"),
    };

    let run_dir = RunDir::new(run_dir).context("creating run dir")?;
    let layout = match remote_inst {
        Some(inst) => Some(RemoteLayout::new(
            std::path::Path::new(remote_prefix),
            &instance,
            inst,
        )?),
        None => None,
    };
    let paths = RunPaths::resolve(&run_dir, &manifest, layout);

    let mut out = serde_json::Map::new();
    for (artifact_kind, path) in paths.iter() {
        let mut entry = serde_json::Map::new();
        entry.insert(
            "local".to_string(),
            serde_json::Value::String(path.local.display().to_string()),
        );
        if let Some(remote) = &path.remote {
            entry.insert(
                "remote".to_string(),
                serde_json::Value::String(remote.display().to_string()),
            );
        }
        entry.insert(
            "active".to_string(),
            serde_json::Value::String(path.active().display().to_string()),
        );
        out.insert(
            artifact_kind.key().to_string(),
            serde_json::Value::Object(entry),
        );
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_run(name: &str, run_dir: &std::path::Path, argv: Vec<String>) -> anyhow::Result<()> {
    let root = RunDir::timestamped(run_dir, name).context("creating run dir")?;
    let registry = Arc::new(TeardownRegistry::new());

    let mut proc = LocalProcess::new(name, root.path(), argv, Vec::new());
    proc.launch()?;
    let shared: lte_harness::lifecycle::SharedProcess =
        Arc::new(std::sync::Mutex::new(Box::new(proc) as Box<dyn ProcessHandle>));
    registry.remember_to_stop(shared.clone());

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        let registry = registry.clone();
        ctrlc::set_handler(move || {
            eprintln!("interrupt: unwinding teardown stack");
            interrupted.store(true, Ordering::SeqCst);
            registry.unwind();
        })
        .context("installing Ctrl+C handler")?;
    }

    loop {
        {
            let mut guard = shared.lock().unwrap_or_else(|p| p.into_inner());
            if guard.terminated() {
                let code = guard.exit_code().unwrap_or(-1);
                drop(guard);
                if interrupted.load(Ordering::SeqCst) {
                    println!("{} {}", "STOPPED".yellow().bold(), name);
                    return Ok(());
                }
                println!("exit code: {}", code);
                if code != 0 {
                    std::process::exit(code);
                }
                return Ok(());
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}
