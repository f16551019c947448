use log::{debug, info, trace, warn};

use crate::dataplane::{EventStream, StreamError};
use crate::decode::IoDelayEvent;
use crate::error::{Error, Result};

/// One retained `io_schedule()` outlier, still unsymbolized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSample {
    pub pid: u32,
    pub tid: u32,
    pub comm: String,
    pub latency_us: u64,
    pub stack: Vec<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Every buffer pulled off the stream
    pub received: u64,
    /// Events above the threshold, kept or not
    pub outliers: u64,
    /// Outliers that arrived after the cap was reached
    pub dropped: u64,
    /// Samples the kernel lost before we could read them
    pub lost: u64,
}

/// Keeps at most `max` outlier samples. Once full, further outliers are only
/// counted so the caller can keep draining the ring.
#[derive(Debug)]
pub struct StackCollector {
    threshold_ns: u64,
    max: usize,
    samples: Vec<StackSample>,
    outliers: u64,
    dropped: u64,
}

impl StackCollector {
    pub fn new(threshold_ns: u64, max: usize) -> Self {
        StackCollector {
            threshold_ns,
            max,
            samples: Vec::with_capacity(max.min(64)),
            outliers: 0,
            dropped: 0,
        }
    }

    pub fn is_outlier(&self, event: &IoDelayEvent) -> bool {
        event.cost > self.threshold_ns
    }

    /// Returns true if the event was kept.
    pub fn observe(&mut self, event: &IoDelayEvent) -> bool {
        if !self.is_outlier(event) {
            return false;
        }
        self.outliers += 1;
        if self.samples.len() >= self.max {
            self.dropped += 1;
            return false;
        }
        self.samples.push(StackSample {
            pid: event.pid,
            tid: event.tid,
            comm: event.comm(),
            latency_us: event.cost / 1000,
            stack: event.frames(),
        });
        true
    }

    pub fn samples(&self) -> &[StackSample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<StackSample> {
        self.samples
    }
}

/// Drain `stream` into `collector` until the stream is cancelled.
///
/// Cancellation is the normal way out and returns Ok. Any other read failure
/// and any undecodable buffer end the run.
pub fn consume_events(
    stream: &mut dyn EventStream,
    collector: &mut StackCollector,
) -> Result<StreamSummary> {
    let mut summary = StreamSummary::default();
    loop {
        let data = match stream.next_event() {
            Ok(data) => data,
            Err(StreamError::Cancelled) => break,
            Err(StreamError::Failed(e)) => return Err(Error::Stream(e)),
        };
        summary.received += 1;

        let event = IoDelayEvent::decode(&data)?;
        trace!(
            "iodelay pid={} tid={} cpu={} cost={}ns",
            event.pid,
            event.tid,
            event.cpu,
            event.cost
        );
        if collector.observe(&event) {
            debug!(
                "kept outlier stack for {} ({}) at {}us",
                event.pid,
                event.comm(),
                event.cost / 1000
            );
        }
    }

    summary.outliers = collector.outliers;
    summary.dropped = collector.dropped;
    summary.lost = stream.lost_events();

    if summary.dropped > 0 {
        info!(
            "dropped {} outlier stacks over the limit of {}",
            summary.dropped, collector.max
        );
    }
    if summary.lost > 0 {
        warn!("kernel lost {} iodelay samples", summary.lost);
    }
    Ok(summary)
}
