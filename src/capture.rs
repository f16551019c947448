//! One capture run, start to finish:
//!
//! 1. resolve the attach plan and attach
//! 2. stream delay events until the capture duration is up (or Ctrl-C),
//!    keeping a bounded number of outlier stacks
//! 3. close the stream, detach
//! 4. dump `io_source_map`, decode all of it, rank it and build the report
//!
//! Aggregation waits for the dump because the map holds the cumulative state
//! at the end of the window.

use std::sync::{Arc, Mutex, PoisonError};

use log::{info, warn};

use crate::aggregate::IoAggregator;
use crate::attach::{resolve_attach_plan, KernelFeatures, SysKernelFeatures};
use crate::bpf::LibbpfDataPlane;
use crate::config::CaptureConfig;
use crate::consumer::{consume_events, StackCollector, StackSample, StreamSummary};
use crate::correlate::{ContainerCorrelator, ContainerLookup, NoContainers};
use crate::dataplane::{DataPlane, IODELAY_EVENTS_MAP, IO_SOURCE_MAP};
use crate::decode::IoSourceRecord;
use crate::error::Result;
use crate::process::ProcFs;
use crate::report::{IoReport, IoStack};
use crate::shutdown::CancelToken;
use crate::symbolize::{KernelSymbolizer, StackSymbolizer};
use crate::tally::OutlierTally;
use crate::watcher::CaptureLauncher;

/// Everything a capture run talks to besides its configuration.
pub struct CaptureEnv<'a> {
    pub plane: &'a mut dyn DataPlane,
    pub features: &'a dyn KernelFeatures,
    pub containers: &'a dyn ContainerLookup,
    pub symbolizer: &'a mut dyn StackSymbolizer,
    pub procfs: &'a ProcFs,
    pub tally: Option<&'a OutlierTally>,
}

fn stream_outliers(
    plane: &dyn DataPlane,
    config: &CaptureConfig,
    cancel: &CancelToken,
) -> Result<(Vec<StackSample>, StreamSummary)> {
    let mut stream = plane.event_stream(IODELAY_EVENTS_MAP, cancel)?;
    let mut collector = StackCollector::new(config.threshold_ns(), config.max_stack_number);
    let summary = consume_events(stream.as_mut(), &mut collector)?;
    Ok((collector.into_samples(), summary))
}

pub fn run_capture(
    config: &CaptureConfig,
    env: CaptureEnv<'_>,
    cancel: &CancelToken,
) -> Result<IoReport> {
    config.validate()?;

    let plan = resolve_attach_plan(&env.plane.programs(), env.features)?;
    env.plane.set_device_filter(&config.device_filter)?;
    env.plane.attach(&plan)?;
    info!(
        "tracing I/O for {}s, io_schedule threshold {}ms",
        config.duration_secs, config.io_schedule_threshold_ms
    );

    // Deadline and Ctrl-C look the same from here on.
    let window = cancel.with_timeout(config.duration());
    let streamed = stream_outliers(&*env.plane, config, &window);
    let detached = env.plane.detach();
    let (samples, summary) = streamed?;
    if let Err(e) = detached {
        warn!("{e}");
    }
    info!(
        "received {} iodelay events, {} outliers",
        summary.received, summary.outliers
    );

    let mut aggregator = IoAggregator::new(config.duration_secs)?;
    let entries = env.plane.dump_map(IO_SOURCE_MAP)?;
    for entry in &entries {
        aggregator.add(IoSourceRecord::decode(&entry.value)?);
    }
    info!(
        "{} io sources from {} processes",
        entries.len(),
        aggregator.ranks().len()
    );

    let process_data = aggregator.summarize(
        config.top_process_count,
        config.top_files_per_process,
        env.containers,
        env.procfs,
    );

    let io_stack = samples
        .into_iter()
        .map(|sample| {
            let container_hostname = env
                .containers
                .by_pid(sample.pid)
                .map(|c| c.hostname.unwrap_or(c.id))
                .unwrap_or_default();
            if let Some(tally) = env.tally {
                tally.record((!container_hostname.is_empty()).then_some(container_hostname.as_str()));
            }
            IoStack {
                pid: sample.pid,
                comm: sample.comm,
                container_hostname,
                latency_us: sample.latency_us,
                stack: env.symbolizer.symbolize(&sample.stack),
            }
        })
        .collect();

    Ok(IoReport {
        reason: None,
        process_data,
        io_stack,
    })
}

fn container_lookup(config: &CaptureConfig) -> Result<Arc<dyn ContainerLookup + Send + Sync>> {
    let containers: Arc<dyn ContainerLookup + Send + Sync> = match &config.server_address {
        Some(addr) => Arc::new(ContainerCorrelator::with_server(addr)?),
        None => Arc::new(NoContainers),
    };
    Ok(containers)
}

/// Capture against the real kernel: loads the BPF object, talks to tracefs,
/// `/proc` and the container metadata server.
pub fn run_bpf_capture(
    config: &CaptureConfig,
    cancel: &CancelToken,
    tally: Option<&OutlierTally>,
) -> Result<IoReport> {
    config.validate()?;
    let containers = container_lookup(config)?;
    run_bpf_capture_with(config, &*containers, cancel, tally)
}

fn run_bpf_capture_with(
    config: &CaptureConfig,
    containers: &dyn ContainerLookup,
    cancel: &CancelToken,
    tally: Option<&OutlierTally>,
) -> Result<IoReport> {
    let procfs = ProcFs::default();
    let features = SysKernelFeatures::default();
    let mut plane = LibbpfDataPlane::open(&config.bpf_object, config.verbosity >= 2)?;
    let mut symbolizer = KernelSymbolizer::new();

    run_capture(
        config,
        CaptureEnv {
            plane: &mut plane,
            features: &features,
            containers,
            symbolizer: &mut symbolizer,
            procfs: &procfs,
            tally,
        },
        cancel,
    )
}

/// Runs BPF captures for the watcher. Captures never overlap, and all of
/// them share one container snapshot so repeated triggers don't refetch it.
pub struct BpfCaptureLauncher {
    config: CaptureConfig,
    containers: Arc<dyn ContainerLookup + Send + Sync>,
    tally: Option<Arc<OutlierTally>>,
    running: Mutex<()>,
}

impl BpfCaptureLauncher {
    pub fn new(config: CaptureConfig, tally: Option<Arc<OutlierTally>>) -> Result<Self> {
        let containers = container_lookup(&config)?;
        Ok(Self::with_containers(config, containers, tally))
    }

    pub fn with_containers(
        config: CaptureConfig,
        containers: Arc<dyn ContainerLookup + Send + Sync>,
        tally: Option<Arc<OutlierTally>>,
    ) -> Self {
        BpfCaptureLauncher {
            config,
            containers,
            tally,
            running: Mutex::new(()),
        }
    }
}

impl CaptureLauncher for BpfCaptureLauncher {
    fn launch(&self, cancel: CancelToken) -> Result<IoReport> {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        run_bpf_capture_with(&self.config, &*self.containers, &cancel, self.tally.as_deref())
    }
}
