//! Ranking of the `io_source_map` dump.
//!
//! Every record is added to a [`RankTable`] keyed by pid (summing the bytes
//! that reached the block device) and to that pid's [`VolumeHeap`]. The top
//! processes then have their heaps drained in full: all records feed the
//! process totals, only the first few become detail lines.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use log::debug;

use crate::correlate::ContainerLookup;
use crate::decode::{decompose_dev, IoSourceRecord};
use crate::error::{Error, Result};
use crate::process::ProcFs;
use crate::report::ProcessReport;

/// Running per-pid byte sums. One entry per pid, ever.
#[derive(Debug, Default)]
pub struct RankTable {
    sums: HashMap<u32, u64>,
}

impl RankTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pid: u32, delta: u64) {
        let sum = self.sums.entry(pid).or_insert(0);
        *sum = sum.saturating_add(delta);
    }

    pub fn get(&self, pid: u32) -> Option<u64> {
        self.sums.get(&pid).copied()
    }

    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// The `n` largest sums, descending. Equal sums come out lowest pid first
    /// so the order never depends on hash iteration.
    pub fn top_n(&self, n: usize) -> Vec<(u32, u64)> {
        let mut ranked: Vec<(u32, u64)> = self.sums.iter().map(|(p, s)| (*p, *s)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }
}

struct HeapEntry<T> {
    volume: u64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    // Bigger volume wins, on a tie the earlier insert does.
    fn cmp(&self, other: &Self) -> Ordering {
        self.volume
            .cmp(&other.volume)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Unbounded max-heap ordered by whatever `volume` extracts from an item.
pub struct VolumeHeap<T> {
    heap: BinaryHeap<HeapEntry<T>>,
    volume: fn(&T) -> u64,
    next_seq: u64,
}

impl<T> VolumeHeap<T> {
    pub fn new(volume: fn(&T) -> u64) -> Self {
        VolumeHeap {
            heap: BinaryHeap::new(),
            volume,
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, item: T) {
        let volume = (self.volume)(&item);
        self.heap.push(HeapEntry {
            volume,
            seq: self.next_seq,
            item,
        });
        self.next_seq += 1;
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop everything, largest volume first.
    pub fn drain_descending(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.heap.pop().map(|entry| entry.item))
    }
}

/// Per-second view of one record, rendered as one detail line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u32,
    pub fs_read_bps: u64,
    pub fs_write_bps: u64,
    pub disk_read_bps: u64,
    pub disk_write_bps: u64,
    pub q2c_us: u64,
    pub d2c_us: u64,
    pub inode: u64,
    pub path: String,
    /// `, container=..` / `, containerID=..` for block-layer-only records
    pub container_suffix: Option<String>,
}

impl FileStat {
    pub fn from_record(record: &IoSourceRecord, duration_secs: u64) -> Self {
        FileStat {
            dev: record.dev,
            fs_read_bps: record.fs_read_bytes / duration_secs,
            fs_write_bps: record.fs_write_bytes / duration_secs,
            disk_read_bps: record.block_read_bytes / duration_secs,
            disk_write_bps: record.block_write_bytes / duration_secs,
            q2c_us: record.latency.avg_q2c_us(),
            d2c_us: record.latency.avg_d2c_us(),
            inode: record.inode,
            path: record.file_path(),
            container_suffix: None,
        }
    }
}

impl fmt::Display for FileStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor) = decompose_dev(self.dev);
        write!(
            f,
            "[{major}:{minor}], fs_read={}b/s, fs_write={}b/s, disk_read={}b/s, disk_write={}b/s, q2c={}us, d2c={}us, inode={}, {}",
            self.fs_read_bps,
            self.fs_write_bps,
            self.disk_read_bps,
            self.disk_write_bps,
            self.q2c_us,
            self.d2c_us,
            self.inode,
            self.path
        )?;
        if let Some(suffix) = &self.container_suffix {
            f.write_str(suffix)?;
        }
        Ok(())
    }
}

/// The kernel only saw this I/O at the block layer, so the cgroup is the
/// one thing that still says who did it.
fn is_block_layer_only(record: &IoSourceRecord) -> bool {
    record.tgid == 0 && record.blkcg != 0
}

/// Owns the rank table and the per-process heaps for one capture run.
pub struct IoAggregator {
    duration_secs: u64,
    ranks: RankTable,
    files: HashMap<u32, VolumeHeap<IoSourceRecord>>,
}

impl IoAggregator {
    pub fn new(duration_secs: u64) -> Result<Self> {
        if duration_secs == 0 {
            return Err(Error::Config("capture duration must be > 0".into()));
        }
        Ok(IoAggregator {
            duration_secs,
            ranks: RankTable::new(),
            files: HashMap::new(),
        })
    }

    pub fn add(&mut self, record: IoSourceRecord) {
        self.ranks.add(record.pid, record.device_bytes());
        self.files
            .entry(record.pid)
            .or_insert_with(|| VolumeHeap::new(IoSourceRecord::device_bytes))
            .insert(record);
    }

    pub fn ranks(&self) -> &RankTable {
        &self.ranks
    }

    /// Build the reports for the `top_n` busiest processes, each with at most
    /// `top_k` detail lines.
    pub fn summarize(
        mut self,
        top_n: usize,
        top_k: usize,
        containers: &dyn ContainerLookup,
        procfs: &ProcFs,
    ) -> Vec<ProcessReport> {
        let mut reports = Vec::new();
        for (pid, volume) in self.ranks.top_n(top_n) {
            let Some(mut heap) = self.files.remove(&pid) else {
                continue;
            };
            debug!("pid {pid}: {volume} device bytes over {} files", heap.len());

            let mut report = ProcessReport {
                pid,
                ..Default::default()
            };
            let mut comm = None;
            for record in heap.drain_descending() {
                let mut stat = FileStat::from_record(&record, self.duration_secs);
                report.fs_read += stat.fs_read_bps;
                report.fs_write += stat.fs_write_bps;
                report.disk_read += stat.disk_read_bps;
                report.disk_write += stat.disk_write_bps;
                report.file_count += 1;

                if report.file_stat.len() >= top_k {
                    continue;
                }
                if is_block_layer_only(&record) {
                    stat.container_suffix = containers.by_cgroup(record.blkcg).map(|c| match c.name {
                        Some(name) => format!(", container={name}"),
                        None => format!(", containerID={}", c.id),
                    });
                }
                report.file_stat.push(stat.to_string());
                report.files.push(stat);
                comm.get_or_insert_with(|| record.comm());
            }

            report.comm = procfs
                .cmdline(pid)
                .or(comm)
                .unwrap_or_default();
            if let Some(container) = containers.by_pid(pid) {
                report.container_hostname = container.hostname.unwrap_or(container.id);
            }
            reports.push(report);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::ContainerRef;
    use crate::decode::{encode_dev, fill_cstr, IOCB_DIRECT};
    use tempfile::TempDir;

    #[derive(Default)]
    struct StaticContainers {
        by_cgroup: HashMap<u64, ContainerRef>,
        by_pid: HashMap<u32, ContainerRef>,
    }

    impl ContainerLookup for StaticContainers {
        fn by_cgroup(&self, css: u64) -> Option<ContainerRef> {
            self.by_cgroup.get(&css).cloned()
        }

        fn by_pid(&self, pid: u32) -> Option<ContainerRef> {
            self.by_pid.get(&pid).cloned()
        }
    }

    fn record(pid: u32, inode: u64, block_read: u64, block_write: u64) -> IoSourceRecord {
        let mut record = IoSourceRecord {
            tgid: pid,
            pid,
            dev: encode_dev(8, 0),
            inode,
            fs_read_bytes: block_read * 2,
            block_read_bytes: block_read,
            block_write_bytes: block_write,
            ..Default::default()
        };
        fill_cstr(&mut record.comm, "worker");
        fill_cstr(&mut record.file_name, &format!("file{inode}"));
        record
    }

    fn empty_procfs() -> (TempDir, ProcFs) {
        let dir = TempDir::new().unwrap();
        let procfs = ProcFs::new(dir.path());
        (dir, procfs)
    }

    #[test]
    fn test_rank_table_accumulates() {
        let mut ranks = RankTable::new();
        ranks.add(1, 100);
        ranks.add(1, 50);
        ranks.add(2, 10);
        assert_eq!(ranks.len(), 2);
        assert_eq!(ranks.get(1), Some(150));
    }

    #[test]
    fn test_rank_table_ties_deterministic() {
        let mut ranks = RankTable::new();
        ranks.add(30, 100);
        ranks.add(20, 300);
        ranks.add(10, 300);
        assert_eq!(ranks.top_n(2), vec![(10, 300), (20, 300)]);
        assert_eq!(ranks.top_n(10).len(), 3);
        assert!(ranks.top_n(0).is_empty());
    }

    #[test]
    fn test_volume_heap_descending() {
        let mut heap = VolumeHeap::new(|v: &(u64, &str)| v.0);
        for item in [(5, "a"), (50, "b"), (1, "c"), (50, "d"), (20, "e")] {
            heap.insert(item);
        }
        assert_eq!(heap.len(), 5);
        let order: Vec<&str> = heap.drain_descending().map(|v| v.1).collect();
        assert_eq!(order, vec!["b", "d", "e", "a", "c"]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_totals_cover_all_files() {
        let mut agg = IoAggregator::new(8).unwrap();
        for i in 1..=10 {
            agg.add(record(42, i, i * 800, 0));
        }
        let (_dir, procfs) = empty_procfs();
        let reports = agg.summarize(10, 5, &StaticContainers::default(), &procfs);

        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.file_count, 10);
        assert_eq!(report.file_stat.len(), 5);
        // sum(i * 800 / 8) for i in 1..=10
        assert_eq!(report.disk_read, 5500);
        assert_eq!(report.fs_read, 11000);
        assert!(report.file_stat[0].ends_with("inode=10, file10"));
        assert!(report.file_stat[4].ends_with("inode=6, file6"));
        assert_eq!(report.comm, "worker");
    }

    #[test]
    fn test_top_processes() {
        let mut agg = IoAggregator::new(1).unwrap();
        agg.add(record(1, 1, 300, 0));
        agg.add(record(2, 1, 100, 200));
        agg.add(record(3, 1, 100, 0));
        let (_dir, procfs) = empty_procfs();
        let reports = agg.summarize(2, 5, &StaticContainers::default(), &procfs);
        let pids: Vec<u32> = reports.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![1, 2]);
    }

    #[test]
    fn test_file_stat_line() {
        let mut rec = record(7, 12, 4096, 8192);
        rec.dev = encode_dev(253, 1);
        rec.flags = IOCB_DIRECT;
        rec.latency.count = 2;
        rec.latency.sum_q2c = 4_000_000;
        rec.latency.sum_d2c = 1_000_000;
        fill_cstr(&mut rec.dentry1_name, "data");
        let stat = FileStat::from_record(&rec, 4);
        assert_eq!(
            stat.to_string(),
            "[253:1], fs_read=2048b/s, fs_write=0b/s, disk_read=1024b/s, disk_write=2048b/s, q2c=2000us, d2c=500us, inode=12, data/file12 [direct IO]"
        );
    }

    #[test]
    fn test_block_layer_records_get_container() {
        let mut containers = StaticContainers::default();
        containers.by_cgroup.insert(
            0xdead,
            ContainerRef {
                id: "abc".into(),
                name: Some("nginx".into()),
                hostname: Some("nginx-0".into()),
            },
        );
        containers.by_cgroup.insert(
            0xbeef,
            ContainerRef {
                id: "def".into(),
                name: None,
                hostname: None,
            },
        );

        let mut agg = IoAggregator::new(1).unwrap();
        let mut a = record(0, 0, 300, 0);
        a.tgid = 0;
        a.blkcg = 0xdead;
        let mut b = record(0, 0, 200, 0);
        b.tgid = 0;
        b.blkcg = 0xbeef;
        let mut c = record(0, 0, 100, 0);
        c.tgid = 0;
        c.blkcg = 0x1;
        agg.add(a);
        agg.add(b);
        agg.add(c);

        let (_dir, procfs) = empty_procfs();
        let reports = agg.summarize(1, 5, &containers, &procfs);
        let lines = &reports[0].file_stat;
        assert!(lines[0].ends_with("[direct IO], container=nginx"));
        assert!(lines[1].ends_with("[direct IO], containerID=def"));
        assert!(lines[2].ends_with("[direct IO]"));
        assert_eq!(reports[0].disk_read, 600);
    }

    #[test]
    fn test_process_hostname_and_cmdline() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("5")).unwrap();
        std::fs::write(dir.path().join("5/cmdline"), b"mysqld\0--datadir=/var\0").unwrap();
        let procfs = ProcFs::new(dir.path());

        let mut containers = StaticContainers::default();
        containers.by_pid.insert(
            5,
            ContainerRef {
                id: "0123".into(),
                name: None,
                hostname: None,
            },
        );

        let mut agg = IoAggregator::new(1).unwrap();
        agg.add(record(5, 1, 10, 0));
        let reports = agg.summarize(1, 1, &containers, &procfs);
        assert_eq!(reports[0].comm, "mysqld --datadir=/var");
        assert_eq!(reports[0].container_hostname, "0123");
    }

    #[test]
    fn test_zero_duration_rejected() {
        assert!(matches!(IoAggregator::new(0), Err(Error::Config(_))));
    }
}
