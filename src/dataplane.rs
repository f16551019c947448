//! The seam between the capture pipeline and whatever actually runs the BPF
//! programs. [`crate::bpf::LibbpfDataPlane`] is the real thing, tests plug in
//! an in-memory version.

use crate::attach::{AttachPoint, ProgramInfo};
use crate::error::Result;
use crate::shutdown::CancelToken;

/// Perf event array carrying [`crate::decode::IoDelayEvent`] samples.
pub const IODELAY_EVENTS_MAP: &str = "iodelay_perf_events";
/// Hash map holding one [`crate::decode::IoSourceRecord`] per source.
pub const IO_SOURCE_MAP: &str = "io_source_map";
/// Hash map of encoded device numbers to restrict the capture to.
pub const FILTER_DEVS_MAP: &str = "filter_devs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The deadline passed or someone hit Ctrl-C.
    Cancelled,
    Failed(String),
}

/// A blocking source of raw event buffers.
pub trait EventStream {
    /// Block until the next buffer arrives or the stream is cancelled.
    fn next_event(&mut self) -> std::result::Result<Vec<u8>, StreamError>;

    /// Samples the kernel had to throw away because we weren't fast enough.
    fn lost_events(&self) -> u64 {
        0
    }
}

pub trait DataPlane {
    /// Every program in the loaded object.
    fn programs(&self) -> Vec<ProgramInfo>;

    fn set_device_filter(&mut self, devs: &[u32]) -> Result<()>;

    /// Attach every point in order. On error nothing stays attached.
    fn attach(&mut self, plan: &[AttachPoint]) -> Result<()>;

    fn event_stream<'a>(
        &'a self,
        map: &str,
        cancel: &CancelToken,
    ) -> Result<Box<dyn EventStream + 'a>>;

    fn detach(&mut self) -> Result<()>;

    fn dump_map(&self, map: &str) -> Result<Vec<MapEntry>>;
}
