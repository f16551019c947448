//! Common test utilities for iotracing integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use iotracing::attach::{AttachPoint, KernelFeatures, ProgramInfo};
use iotracing::correlate::{Container, ContainerSource};
use iotracing::dataplane::{DataPlane, EventStream, MapEntry, StreamError};
use iotracing::decode::{encode_dev, fill_cstr, IoDelayEvent, IoSourceRecord};
use iotracing::{CancelToken, Error, Result};

/// A kernel with the new rq_qos names, ext4 and no xfs.
pub struct FakeKernel;

impl KernelFeatures for FakeKernel {
    fn has_filter_function(&self, name: &str) -> bool {
        name.starts_with("__rq_qos")
    }

    fn supports_filesystem(&self, fs: &str) -> io::Result<bool> {
        Ok(fs == "ext4")
    }
}

pub fn iotracing_programs() -> Vec<ProgramInfo> {
    vec![
        ProgramInfo::new("bpf_io_schedule", "kprobe/io_schedule"),
        ProgramInfo::new("bpf_io_schedule_ret", "kretprobe/io_schedule"),
        ProgramInfo::new("bpf_rq_qos_issue", "kprobe/rq_qos_issue"),
        ProgramInfo::new("bpf_rq_qos_done", "kprobe/rq_qos_done"),
        ProgramInfo::new("bpf_ext4_file_read_iter", "kprobe/ext4_file_read_iter"),
        ProgramInfo::new("bpf_xfs_file_read_iter", "kprobe/xfs_file_read_iter"),
        ProgramInfo::new("bpf_vfs_write", "kprobe/vfs_write"),
    ]
}

/// In-memory data plane. Replays `events` once, then behaves as if the
/// capture window closed.
#[derive(Default)]
pub struct FakeDataPlane {
    pub programs: Vec<ProgramInfo>,
    pub events: Vec<Vec<u8>>,
    pub stream_failure: Option<String>,
    pub fail_attach: bool,
    pub entries: Vec<MapEntry>,
    pub filter: Vec<u32>,
    pub attached: Vec<AttachPoint>,
    pub calls: RefCell<Vec<&'static str>>,
}

impl FakeDataPlane {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }

    fn called(&self, what: &'static str) {
        self.calls.borrow_mut().push(what);
    }
}

struct FakeStream {
    events: VecDeque<Vec<u8>>,
    failure: Option<String>,
    cancel: CancelToken,
}

impl EventStream for FakeStream {
    fn next_event(&mut self) -> std::result::Result<Vec<u8>, StreamError> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        match self.failure.take() {
            Some(msg) => Err(StreamError::Failed(msg)),
            None => Err(StreamError::Cancelled),
        }
    }
}

impl DataPlane for FakeDataPlane {
    fn programs(&self) -> Vec<ProgramInfo> {
        self.called("programs");
        self.programs.clone()
    }

    fn set_device_filter(&mut self, devs: &[u32]) -> Result<()> {
        self.called("filter");
        self.filter = devs.to_vec();
        Ok(())
    }

    fn attach(&mut self, plan: &[AttachPoint]) -> Result<()> {
        self.called("attach");
        if self.fail_attach {
            return Err(Error::DataPlane("attach failed".into()));
        }
        self.attached = plan.to_vec();
        Ok(())
    }

    fn event_stream<'a>(
        &'a self,
        _map: &str,
        cancel: &CancelToken,
    ) -> Result<Box<dyn EventStream + 'a>> {
        self.called("stream");
        Ok(Box::new(FakeStream {
            events: self.events.iter().cloned().collect(),
            failure: self.stream_failure.clone(),
            cancel: cancel.clone(),
        }))
    }

    fn detach(&mut self) -> Result<()> {
        self.called("detach");
        Ok(())
    }

    fn dump_map(&self, _map: &str) -> Result<Vec<MapEntry>> {
        self.called("dump");
        Ok(self.entries.clone())
    }
}

pub fn delay_event(pid: u32, cost_ms: u64, comm: &str) -> Vec<u8> {
    let mut event = IoDelayEvent {
        pid,
        tid: pid,
        cost: cost_ms * 1_000_000,
        stack_size: 3,
        ..Default::default()
    };
    event.stack[0] = 0xffff_ffff_8110_0000;
    event.stack[1] = 0xffff_ffff_8120_0000;
    event.stack[2] = 0xffff_ffff_8130_0000;
    fill_cstr(&mut event.comm, comm);
    unsafe { plain::as_bytes(&event) }.to_vec()
}

pub struct FileIo<'a> {
    pub pid: u32,
    pub comm: &'a str,
    pub inode: u64,
    pub file: &'a str,
    pub fs_read: u64,
    pub block_read: u64,
    pub block_write: u64,
}

pub fn source_entry(io: FileIo<'_>) -> MapEntry {
    let mut record = IoSourceRecord {
        tgid: io.pid,
        pid: io.pid,
        dev: encode_dev(8, 0),
        inode: io.inode,
        fs_read_bytes: io.fs_read,
        block_read_bytes: io.block_read,
        block_write_bytes: io.block_write,
        ..Default::default()
    };
    fill_cstr(&mut record.comm, io.comm);
    fill_cstr(&mut record.file_name, io.file);
    MapEntry {
        key: io.inode.to_ne_bytes().to_vec(),
        value: unsafe { plain::as_bytes(&record) }.to_vec(),
    }
}

/// A metadata server that always lists the same containers and counts how
/// often it was asked.
#[derive(Clone, Default)]
pub struct CountingSource {
    pub containers: Vec<Container>,
    pub calls: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContainerSource for CountingSource {
    fn containers(&self) -> Result<Vec<Container>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.containers.clone())
    }
}
