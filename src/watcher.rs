//! Threshold watcher: poll `/proc/diskstats`, wait until one device stays
//! over a threshold for two samples in a row, then run one capture and store
//! its report together with the reason it was taken.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::diskstats::{DiskStatsSource, DiskStatus, Diskstats};
use crate::error::{Error, Result};
use crate::report::IoReport;
use crate::shutdown::CancelToken;
use crate::storage::{Document, DocumentSink};
use crate::tally::OutlierTally;

pub const TRACER_NAME: &str = "iotracing";

const MIB: u64 = 1024 * 1024;
const COMPLETION_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// percent
    pub util: u64,
    /// ms
    pub await_ms: u64,
    /// MiB/s, only consulted for nvme devices
    pub read_mbps: u64,
    pub write_mbps: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            util: 90,
            await_ms: 100,
            read_mbps: 1500,
            write_mbps: 1500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachReason {
    IoUtil,
    ReadBps,
    WriteBps,
    ReadAwait,
    WriteAwait,
}

impl BreachReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachReason::IoUtil => "ioutil",
            BreachReason::ReadBps => "read_bps",
            BreachReason::WriteBps => "write_bps",
            BreachReason::ReadAwait => "read_await",
            BreachReason::WriteAwait => "write_await",
        }
    }
}

impl fmt::Display for BreachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both samples must be over the limit.
fn sustained(prev: u64, curr: u64, limit: u64) -> bool {
    prev > limit && curr > limit
}

/// First match wins: utilization, then read wait, then write wait. On nvme a
/// busy device only counts if it is also moving a lot of data, and if it
/// isn't we still go on to check the wait times.
pub fn evaluate(
    prev: &DiskStatus,
    curr: &DiskStatus,
    t: &Thresholds,
    nvme: bool,
) -> Option<BreachReason> {
    if sustained(prev.io_util, curr.io_util, t.util) {
        if !nvme {
            return Some(BreachReason::IoUtil);
        }
        if sustained(prev.read_bps, curr.read_bps, t.read_mbps.saturating_mul(MIB)) {
            return Some(BreachReason::ReadBps);
        }
        if sustained(prev.write_bps, curr.write_bps, t.write_mbps.saturating_mul(MIB)) {
            return Some(BreachReason::WriteBps);
        }
    }
    if sustained(prev.read_await, curr.read_await, t.await_ms) {
        return Some(BreachReason::ReadAwait);
    }
    if sustained(prev.write_await, curr.write_await, t.await_ms) {
        return Some(BreachReason::WriteAwait);
    }
    None
}

/// Why a capture was taken, attached to its report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonSnapshot {
    #[serde(rename = "type")]
    pub kind: String,
    pub device: String,
    pub iostatus: DiskStatus,
}

/// Turns successive diskstats readings into metrics and watches them.
pub struct DiskPoller {
    thresholds: Thresholds,
    interval_secs: u64,
    last_raw: HashMap<String, Diskstats>,
    last_metrics: HashMap<String, DiskStatus>,
}

impl DiskPoller {
    pub fn new(thresholds: Thresholds, interval_secs: u64) -> Self {
        DiskPoller {
            thresholds,
            interval_secs,
            last_raw: HashMap::new(),
            last_metrics: HashMap::new(),
        }
    }

    /// Feed one reading. Returns the first device that breached.
    pub fn sample(&mut self, stats: Vec<Diskstats>) -> Option<ReasonSnapshot> {
        for curr in stats {
            // md arrays just repeat what their members already show
            if curr.name.starts_with("md") {
                continue;
            }

            if let Some(prev) = self.last_raw.get(&curr.name) {
                let metric = DiskStatus::from_delta(prev, &curr, self.interval_secs);
                debug!(
                    "{} util={}% avgqu-sz={} rkB/s={} wkB/s={} r/s={} w/s={} r_await={} w_await={}",
                    curr.name,
                    metric.io_util,
                    metric.queue_size,
                    metric.read_bps / 1024,
                    metric.write_bps / 1024,
                    metric.read_iops,
                    metric.write_iops,
                    metric.read_await,
                    metric.write_await
                );

                // A device seen for the first time compares against all zeros,
                // which never breaches.
                let last = self.last_metrics.get(&curr.name).copied().unwrap_or_default();
                let nvme = curr.name.starts_with("nvme");
                if let Some(reason) = evaluate(&last, &metric, &self.thresholds, nvme) {
                    return Some(ReasonSnapshot {
                        kind: reason.as_str().to_string(),
                        device: curr.name,
                        iostatus: metric,
                    });
                }
                self.last_metrics.insert(curr.name.clone(), metric);
            }
            self.last_raw.insert(curr.name.clone(), curr);
        }
        None
    }
}

/// Starts one capture run. Called on its own thread.
pub trait CaptureLauncher: Send + Sync {
    fn launch(&self, cancel: CancelToken) -> Result<IoReport>;
}

fn default_interval() -> u64 {
    5
}

fn default_capture_timeout() -> u64 {
    40
}

fn default_capture_duration() -> u64 {
    8
}

/// Watcher settings, loadable from a JSON file. Missing keys keep their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: u64,
    #[serde(default = "default_capture_duration")]
    pub capture_duration_secs: u64,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            interval_secs: default_interval(),
            capture_timeout_secs: default_capture_timeout(),
            capture_duration_secs: default_capture_duration(),
            region: String::new(),
            thresholds: Thresholds::default(),
        }
    }
}

impl WatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let config: WatchConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::Config("polling interval must be > 0".into()));
        }
        if self.capture_duration_secs == 0 {
            return Err(Error::Config("capture duration must be > 0".into()));
        }
        if self.capture_timeout_secs <= self.capture_duration_secs {
            return Err(Error::Config(format!(
                "capture timeout ({}s) must be longer than the capture duration ({}s)",
                self.capture_timeout_secs, self.capture_duration_secs
            )));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }
}

#[derive(Debug)]
pub enum WatchOutcome {
    Reported(Box<IoReport>),
    Cancelled,
}

pub struct ThresholdWatcher {
    config: WatchConfig,
    source: Box<dyn DiskStatsSource>,
    launcher: Arc<dyn CaptureLauncher>,
    sink: Box<dyn DocumentSink>,
    tally: Option<Arc<OutlierTally>>,
}

impl ThresholdWatcher {
    pub fn new(
        config: WatchConfig,
        source: Box<dyn DiskStatsSource>,
        launcher: Arc<dyn CaptureLauncher>,
        sink: Box<dyn DocumentSink>,
    ) -> Self {
        ThresholdWatcher {
            config,
            source,
            launcher,
            sink,
            tally: None,
        }
    }

    /// Log cumulative outlier counts from this tally after every capture.
    pub fn with_tally(mut self, tally: Arc<OutlierTally>) -> Self {
        self.tally = Some(tally);
        self
    }

    fn wait_for_breach(&self, cancel: &CancelToken) -> Result<Option<ReasonSnapshot>> {
        let mut poller = DiskPoller::new(self.config.thresholds, self.config.interval_secs);
        loop {
            if !cancel.sleep(self.config.interval()) {
                return Ok(None);
            }
            if let Some(reason) = poller.sample(self.source.read()?) {
                return Ok(Some(reason));
            }
        }
    }

    /// One full cycle: poll until a breach, capture, store the report.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<WatchOutcome> {
        let Some(reason) = self.wait_for_breach(cancel)? else {
            return Ok(WatchOutcome::Cancelled);
        };
        info!(
            "{} over threshold ({}), starting capture",
            reason.device, reason.kind
        );

        // The deadline stops the capture's own stream if it overruns, the
        // timeout below is what we report.
        let capture_cancel = cancel.with_timeout(self.config.capture_timeout());
        let launcher = self.launcher.clone();
        let handle = thread::Builder::new()
            .name("iotracing-capture".to_string())
            .spawn(move || launcher.launch(capture_cancel))?;

        let started = Instant::now();
        let result = loop {
            if !cancel.sleep(COMPLETION_POLL) {
                return Ok(WatchOutcome::Cancelled);
            }
            if handle.is_finished() {
                break handle
                    .join()
                    .map_err(|_| Error::Capture("capture thread panicked".into()))?;
            }
            if started.elapsed() >= self.config.capture_timeout() {
                return Err(Error::Capture(format!(
                    "capture did not finish within {}s",
                    self.config.capture_timeout_secs
                )));
            }
        };

        let mut report = result?;
        report.reason = Some(reason);

        let doc = Document::new(
            TRACER_NAME,
            &self.config.region,
            Local::now(),
            serde_json::to_value(&report)?,
        );
        self.sink.write(&doc)?;

        if let Some(tally) = &self.tally {
            let snap = tally.snapshot();
            info!(
                "outliers so far: {} host-wide, {} containers",
                snap.host,
                snap.containers.len()
            );
        }
        if report.process_data.is_empty() {
            warn!("capture finished without any I/O sources");
        }
        Ok(WatchOutcome::Reported(Box::new(report)))
    }
}
