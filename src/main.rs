use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use iotracing::config::{DEFAULT_BPF_OBJECT, DEFAULT_SERVER_ADDRESS};
use iotracing::tally::OutlierTally;
use iotracing::{init_logging, parse_device_filter, run_bpf_capture, CancelToken, CaptureConfig, OutputFormat};

/// Trace which processes and files are behind the block I/O on this host.
#[derive(Debug, Parser)]
#[command(name = "iotracing")]
#[command(version)]
struct Command {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Tracing duration in seconds
    #[arg(long, default_value_t = 8)]
    dur: u64,
    /// Only trace these devices, major:minor[,major:minor...]
    #[arg(long, default_value = "")]
    device: String,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
    /// Maximum number of io_schedule() stacks to keep
    #[arg(long, default_value_t = 10)]
    max_stack_number: usize,
    /// Number of processes to report
    #[arg(long, default_value_t = 10)]
    top_process_count: usize,
    /// Number of files to show per process
    #[arg(long, default_value_t = 5)]
    top_files_per_process: usize,
    /// io_schedule() latency in ms above which a stack is kept
    #[arg(long, default_value_t = 100)]
    io_schedule_threshold: u64,
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

impl Command {
    fn to_config(&self) -> Result<CaptureConfig> {
        Ok(CaptureConfig {
            duration_secs: self.dur,
            device_filter: parse_device_filter(&self.device).context("parse device numbers")?,
            output: if self.json {
                OutputFormat::Json
            } else {
                OutputFormat::Table
            },
            max_stack_number: self.max_stack_number,
            top_process_count: self.top_process_count,
            top_files_per_process: self.top_files_per_process,
            io_schedule_threshold_ms: self.io_schedule_threshold,
            bpf_object: self.bpf_object.clone(),
            server_address: (!self.no_containers).then(|| self.server_address.clone()),
            verbosity: self.verbose,
        })
    }
}

fn run(opts: Command) -> Result<()> {
    let config = opts.to_config()?;
    config.validate()?;

    let cancel = CancelToken::new();
    let stop = cancel.clone();
    ctrlc::set_handler(move || stop.cancel()).context("Error setting Ctrl-C handler")?;

    let tally = OutlierTally::new();
    let report = run_bpf_capture(&config, &cancel, Some(&tally))?;
    let outliers = tally.snapshot();
    info!(
        "{} outlier stacks kept, {} from containers",
        outliers.host,
        outliers.containers.values().sum::<u64>()
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    report
        .write(&mut out, config.output)
        .context("failed to write report")?;
    out.flush()?;
    Ok(())
}

fn main() {
    let opts = Command::parse();
    init_logging(opts.verbose);

    if let Err(e) = run(opts) {
        eprintln!("iotracing error: {e:#}");
        process::exit(1);
    }
}
