//! Layouts of the records the kernel side hands us and the helpers to turn
//! them into something printable.
//!
//! Both records are plain `#[repr(C)]` structs in host byte order, decoded
//! with [`plain`] the same way the ringbuf events are. A buffer shorter than
//! the struct is a hard error: once one record is off, the whole dump is
//! suspect.

use std::ffi::CStr;
use std::mem;

use plain::Plain;

use crate::error::{Error, Result};

/// Number of kernel frames carried by every delay event.
pub const STACK_MIN_DEPTH: usize = 20;
pub const TASK_COMM_LEN: usize = 16;
pub const DNAME_LEN: usize = 64;

/// `IOCB_DIRECT` from `include/linux/fs.h`, copied into the record flags.
pub const IOCB_DIRECT: u32 = 1 << 2;

/// Shown instead of a path when the I/O never went through a file.
pub const DIRECT_IO_MARKER: &str = "[direct IO]";

const MINOR_BITS: u32 = 20;
const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;
const MAJOR_MASK: u32 = 0xfff;

/// Largest major number that fits the encoding.
pub const DEV_MAJOR_MAX: u32 = MAJOR_MASK;
/// Largest minor number that fits the encoding.
pub const DEV_MINOR_MAX: u32 = MINOR_MASK;

/// Pack a device number the way the kernel's `MKDEV()` does. Callers keep
/// `major` and `minor` within [`DEV_MAJOR_MAX`] and [`DEV_MINOR_MAX`].
pub const fn encode_dev(major: u32, minor: u32) -> u32 {
    ((major & MAJOR_MASK) << MINOR_BITS) | (minor & MINOR_MASK)
}

pub const fn dev_major(dev: u32) -> u32 {
    (dev >> MINOR_BITS) & MAJOR_MASK
}

pub const fn dev_minor(dev: u32) -> u32 {
    dev & MINOR_MASK
}

pub const fn decompose_dev(dev: u32) -> (u32, u32) {
    (dev_major(dev), dev_minor(dev))
}

/// Text up to the first NUL, or the whole buffer if there is none.
pub fn cstr(bytes: &[u8]) -> String {
    match CStr::from_bytes_until_nul(bytes) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Per-record block latency counters, all in nanoseconds.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyInfo {
    pub count: u64,
    pub max_d2c: u64,
    pub sum_d2c: u64,
    pub max_q2c: u64,
    pub sum_q2c: u64,
}

impl LatencyInfo {
    /// Average queue-to-completion time in microseconds.
    pub fn avg_q2c_us(&self) -> u64 {
        average_us(self.sum_q2c, self.count)
    }

    /// Average dispatch-to-completion time in microseconds.
    pub fn avg_d2c_us(&self) -> u64 {
        average_us(self.sum_d2c, self.count)
    }
}

fn average_us(sum_ns: u64, count: u64) -> u64 {
    if count == 0 {
        return 0;
    }
    sum_ns / count.saturating_mul(1000)
}

/// Value of one `io_source_map` entry: everything one (process, file or
/// block target) pair did during the capture window.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IoSourceRecord {
    pub tgid: u32,
    pub pid: u32,
    pub dev: u32,
    pub flags: u32,
    pub fs_write_bytes: u64,
    pub fs_read_bytes: u64,
    pub block_write_bytes: u64,
    pub block_read_bytes: u64,
    pub inode: u64,
    pub blkcg: u64,
    pub latency: LatencyInfo,
    pub comm: [u8; TASK_COMM_LEN],
    pub file_name: [u8; DNAME_LEN],
    pub dentry1_name: [u8; DNAME_LEN],
    pub dentry2_name: [u8; DNAME_LEN],
    pub dentry3_name: [u8; DNAME_LEN],
}

unsafe impl Plain for IoSourceRecord {}

impl Default for IoSourceRecord {
    fn default() -> Self {
        IoSourceRecord {
            tgid: 0,
            pid: 0,
            dev: 0,
            flags: 0,
            fs_write_bytes: 0,
            fs_read_bytes: 0,
            block_write_bytes: 0,
            block_read_bytes: 0,
            inode: 0,
            blkcg: 0,
            latency: LatencyInfo::default(),
            comm: [0; TASK_COMM_LEN],
            file_name: [0; DNAME_LEN],
            dentry1_name: [0; DNAME_LEN],
            dentry2_name: [0; DNAME_LEN],
            dentry3_name: [0; DNAME_LEN],
        }
    }
}

impl IoSourceRecord {
    pub fn decode(data: &[u8]) -> Result<Self> {
        decode_record("io_source record", data)
    }

    pub fn comm(&self) -> String {
        cstr(&self.comm)
    }

    /// Bytes that actually reached the block device, the ranking key.
    pub fn device_bytes(&self) -> u64 {
        self.block_read_bytes.saturating_add(self.block_write_bytes)
    }

    pub fn is_direct(&self) -> bool {
        self.flags & IOCB_DIRECT == IOCB_DIRECT
    }

    /// Up to three parent directories plus the file name, without a leading
    /// `/`. Block-layer-only records (inode 0) have no path at all.
    pub fn file_path(&self) -> String {
        let mut path = if self.inode == 0 {
            DIRECT_IO_MARKER.to_string()
        } else {
            format!(
                "{}/{}/{}/{}",
                cstr(&self.dentry3_name),
                cstr(&self.dentry2_name),
                cstr(&self.dentry1_name),
                cstr(&self.file_name)
            )
            .trim_start_matches('/')
            .to_string()
        };
        if self.is_direct() {
            path.push(' ');
            path.push_str(DIRECT_IO_MARKER);
        }
        path
    }
}

/// One `iodelay_perf_events` sample: a task that sat in `io_schedule()`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IoDelayEvent {
    pub stack: [u64; STACK_MIN_DEPTH],
    pub ts: u64,
    pub cost: u64,
    pub stack_size: u32,
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

unsafe impl Plain for IoDelayEvent {}

impl Default for IoDelayEvent {
    fn default() -> Self {
        IoDelayEvent {
            stack: [0; STACK_MIN_DEPTH],
            ts: 0,
            cost: 0,
            stack_size: 0,
            pid: 0,
            tid: 0,
            cpu: 0,
            comm: [0; TASK_COMM_LEN],
        }
    }
}

impl IoDelayEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        decode_record("iodelay event", data)
    }

    pub fn comm(&self) -> String {
        cstr(&self.comm)
    }

    /// Non-zero return addresses, innermost frame first.
    pub fn frames(&self) -> Vec<u64> {
        self.stack.iter().copied().filter(|addr| *addr > 0).collect()
    }
}

fn decode_record<T: Plain + Default>(what: &'static str, data: &[u8]) -> Result<T> {
    let expected = mem::size_of::<T>();
    if data.len() < expected {
        return Err(Error::Decode {
            what,
            expected,
            got: data.len(),
        });
    }
    let mut record = T::default();
    plain::copy_from_bytes(&mut record, data).map_err(|_| Error::Decode {
        what,
        expected,
        got: data.len(),
    })?;
    Ok(record)
}

/// Copy `s` into a fixed NUL padded kernel string field.
pub fn fill_cstr<const N: usize>(dst: &mut [u8; N], s: &str) {
    *dst = [0; N];
    let len = s.len().min(N);
    dst[..len].copy_from_slice(&s.as_bytes()[..len]);
}
