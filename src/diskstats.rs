use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process::ProcFs;

const SECTOR_SIZE: u64 = 512;

/// One line of `/proc/diskstats`, the counters we use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diskstats {
    pub major: u32,
    pub minor: u32,
    pub name: String,
    pub read_ios: u64,
    pub read_sectors: u64,
    /// ms spent reading
    pub read_ticks: u64,
    pub write_ios: u64,
    pub write_sectors: u64,
    /// ms spent writing
    pub write_ticks: u64,
    /// ms the device had I/O in flight
    pub io_ticks: u64,
    /// in-flight count weighted ms
    pub weighted_io_ticks: u64,
}

impl Diskstats {
    fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            return None;
        }
        let num = |i: usize| fields[i].parse::<u64>().ok();
        Some(Diskstats {
            major: fields[0].parse().ok()?,
            minor: fields[1].parse().ok()?,
            name: fields[2].to_string(),
            read_ios: num(3)?,
            read_sectors: num(5)?,
            read_ticks: num(6)?,
            write_ios: num(7)?,
            write_sectors: num(9)?,
            write_ticks: num(10)?,
            io_ticks: num(12)?,
            weighted_io_ticks: num(13)?,
        })
    }
}

/// Parse the whole file. Lines we can't make sense of are skipped.
pub fn parse_diskstats(content: &str) -> Vec<Diskstats> {
    content
        .lines()
        .filter_map(|line| {
            let stats = Diskstats::parse_line(line);
            if stats.is_none() && !line.trim().is_empty() {
                trace!("skipping diskstats line: {line}");
            }
            stats
        })
        .collect()
}

pub trait DiskStatsSource: Send {
    fn read(&self) -> Result<Vec<Diskstats>>;
}

pub struct ProcDiskStats {
    procfs: ProcFs,
}

impl ProcDiskStats {
    pub fn new(procfs: ProcFs) -> Self {
        ProcDiskStats { procfs }
    }
}

impl DiskStatsSource for ProcDiskStats {
    fn read(&self) -> Result<Vec<Diskstats>> {
        Ok(parse_diskstats(&self.procfs.diskstats()?))
    }
}

/// Per-device rates over one polling interval, iostat style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStatus {
    /// percent
    pub io_util: u64,
    pub queue_size: u64,
    pub read_bps: u64,
    pub write_bps: u64,
    pub read_iops: u64,
    pub write_iops: u64,
    /// ms, zero when nothing was read
    pub read_await: u64,
    /// ms, zero when nothing was written
    pub write_await: u64,
}

impl DiskStatus {
    /// Counters that went backwards (device reset, wraparound) count as zero.
    pub fn from_delta(prev: &Diskstats, curr: &Diskstats, interval_secs: u64) -> Self {
        let interval_secs = interval_secs.max(1);
        let delta_read_ios = curr.read_ios.saturating_sub(prev.read_ios);
        let delta_write_ios = curr.write_ios.saturating_sub(prev.write_ios);

        let mut status = DiskStatus {
            io_util: curr.io_ticks.saturating_sub(prev.io_ticks) / (interval_secs * 10),
            queue_size: curr.weighted_io_ticks.saturating_sub(prev.weighted_io_ticks)
                / (interval_secs * 1000),
            read_bps: curr.read_sectors.saturating_sub(prev.read_sectors) * SECTOR_SIZE
                / interval_secs,
            write_bps: curr.write_sectors.saturating_sub(prev.write_sectors) * SECTOR_SIZE
                / interval_secs,
            read_iops: delta_read_ios / interval_secs,
            write_iops: delta_write_ios / interval_secs,
            read_await: 0,
            write_await: 0,
        };
        if delta_read_ios > 0 {
            status.read_await = curr.read_ticks.saturating_sub(prev.read_ticks) / delta_read_ios;
        }
        if delta_write_ios > 0 {
            status.write_await = curr.write_ticks.saturating_sub(prev.write_ticks) / delta_write_ios;
        }
        status
    }
}
