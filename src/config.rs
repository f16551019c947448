use std::path::PathBuf;
use std::time::Duration;

use crate::decode::{encode_dev, DEV_MAJOR_MAX, DEV_MINOR_MAX};
use crate::error::{Error, Result};

/// The kernel side has room for this many filtered devices.
pub const MAX_FILTER_DEVICES: usize = 16;

pub const DEFAULT_BPF_OBJECT: &str = "/usr/share/iotracing/iotracing.bpf.o";
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:19704";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Runtime options for one capture run, separated from the CLI parsing so
/// the watcher can build one without going through clap.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Length of the capture window in seconds, must be > 0
    pub duration_secs: u64,
    /// Encoded device numbers to restrict the capture to, empty = all
    pub device_filter: Vec<u32>,
    pub output: OutputFormat,
    /// How many outlier stacks to keep
    pub max_stack_number: usize,
    /// How many processes end up in the report
    pub top_process_count: usize,
    /// How many file lines are rendered per process
    pub top_files_per_process: usize,
    /// io_schedule() latency in milliseconds above which a stack is kept
    pub io_schedule_threshold_ms: u64,
    /// Compiled BPF object to load
    pub bpf_object: PathBuf,
    /// Container metadata server, None disables container correlation
    pub server_address: Option<String>,
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    pub verbosity: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            duration_secs: 8,
            device_filter: Vec::new(),
            output: OutputFormat::Table,
            max_stack_number: 10,
            top_process_count: 10,
            top_files_per_process: 5,
            io_schedule_threshold_ms: 100,
            bpf_object: PathBuf::from(DEFAULT_BPF_OBJECT),
            server_address: Some(DEFAULT_SERVER_ADDRESS.to_string()),
            verbosity: 0,
        }
    }
}

impl CaptureConfig {
    /// Reject anything that would make the run meaningless before we go near
    /// the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.duration_secs == 0 {
            return Err(Error::Config("capture duration must be > 0".into()));
        }
        if self.io_schedule_threshold_ms == 0 {
            return Err(Error::Config("io schedule threshold must be > 0".into()));
        }
        if self.device_filter.len() > MAX_FILTER_DEVICES {
            return Err(Error::Config(format!(
                "too many devices specified (max {MAX_FILTER_DEVICES}), got {}",
                self.device_filter.len()
            )));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn threshold_ns(&self) -> u64 {
        self.io_schedule_threshold_ms.saturating_mul(1_000_000)
    }
}

/// Parse `major:minor[,major:minor...]` into kernel encoded device numbers.
///
/// An empty string means no filter. Empty segments, anything other than
/// exactly one `:` per entry, and more than [`MAX_FILTER_DEVICES`] entries are
/// configuration errors.
pub fn parse_device_filter(devices: &str) -> Result<Vec<u32>> {
    if devices.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut devs = Vec::new();
    for entry in devices.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(Error::Config(format!(
                "empty device entry in '{devices}', expected major:minor"
            )));
        }

        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 2 {
            return Err(Error::Config(format!(
                "invalid device format: {entry}, expected major:minor"
            )));
        }

        let major = parse_dev_part(parts[0], "major", DEV_MAJOR_MAX)?;
        let minor = parse_dev_part(parts[1], "minor", DEV_MINOR_MAX)?;
        devs.push(encode_dev(major, minor));
    }

    if devs.len() > MAX_FILTER_DEVICES {
        return Err(Error::Config(format!(
            "too many devices specified (max {MAX_FILTER_DEVICES}), got {}",
            devs.len()
        )));
    }
    Ok(devs)
}

fn parse_dev_part(part: &str, what: &str, max: u32) -> Result<u32> {
    let num = part
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Config(format!("invalid {what} number: {part}")))?;
    if num > max {
        return Err(Error::Config(format!(
            "{what} number {num} out of range (max {max})"
        )));
    }
    Ok(num)
}
