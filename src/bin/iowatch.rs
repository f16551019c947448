//! iowatch: watch disk utilization and latency, and take an iotracing
//! capture whenever a device stays over its threshold.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use iotracing::config::{DEFAULT_BPF_OBJECT, DEFAULT_SERVER_ADDRESS};
use iotracing::diskstats::ProcDiskStats;
use iotracing::process::ProcFs;
use iotracing::storage::{DocumentSink, LocalFileSink, StdoutSink};
use iotracing::tally::OutlierTally;
use iotracing::{
    init_logging, BpfCaptureLauncher, CancelToken, CaptureConfig, OutputFormat, ThresholdWatcher,
    WatchConfig, WatchOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "iowatch")]
#[command(about = "Trigger iotracing captures when disks are saturated")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// JSON watcher configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Polling interval in seconds, overrides the config file
    #[arg(long)]
    interval: Option<u64>,
    /// Utilization threshold in percent, overrides the config file
    #[arg(long)]
    util_threshold: Option<u64>,
    /// Read/write wait threshold in ms, overrides the config file
    #[arg(long)]
    await_threshold: Option<u64>,
    /// Append reports to this file instead of printing them
    #[arg(short, long)]
    output_file: Option<PathBuf>,
    /// Container metadata server address
    #[arg(long, default_value = DEFAULT_SERVER_ADDRESS)]
    server_address: String,
    /// Don't query the metadata server for container names
    #[arg(long)]
    no_containers: bool,
    /// Compiled iotracing BPF object
    #[arg(long, default_value = DEFAULT_BPF_OBJECT)]
    bpf_object: PathBuf,
}

impl Cli {
    fn watch_config(&self) -> Result<WatchConfig> {
        let mut config = match &self.config {
            Some(path) => WatchConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => WatchConfig::default(),
        };
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if let Some(util) = self.util_threshold {
            config.thresholds.util = util;
        }
        if let Some(await_ms) = self.await_threshold {
            config.thresholds.await_ms = await_ms;
        }
        config.validate()?;
        Ok(config)
    }

    fn capture_config(&self, watch: &WatchConfig) -> CaptureConfig {
        CaptureConfig {
            duration_secs: watch.capture_duration_secs,
            output: OutputFormat::Json,
            bpf_object: self.bpf_object.clone(),
            server_address: (!self.no_containers).then(|| self.server_address.clone()),
            verbosity: self.verbose,
            ..Default::default()
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let watch = cli.watch_config()?;
    let capture = cli.capture_config(&watch);
    capture.validate()?;

    let sink: Box<dyn DocumentSink> = match &cli.output_file {
        Some(path) => Box::new(
            LocalFileSink::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(StdoutSink),
    };

    let cancel = CancelToken::new();
    let stop = cancel.clone();
    ctrlc::set_handler(move || stop.cancel()).context("Error setting Ctrl-C handler")?;

    let tally = Arc::new(OutlierTally::new());
    let launcher = Arc::new(BpfCaptureLauncher::new(capture, Some(tally.clone()))?);
    let mut watcher = ThresholdWatcher::new(
        watch,
        Box::new(ProcDiskStats::new(ProcFs::default())),
        launcher,
        sink,
    )
    .with_tally(tally);

    info!("watching /proc/diskstats");
    loop {
        match watcher.run(&cancel)? {
            WatchOutcome::Reported(report) => info!(
                "stored report for {} processes",
                report.process_data.len()
            ),
            WatchOutcome::Cancelled => {
                info!("Stopping...");
                return Ok(());
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("iowatch error: {e:#}");
        process::exit(1);
    }
}
