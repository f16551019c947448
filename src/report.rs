//! The capture report and its two renderings: one JSON object, or the
//! human-readable tables.

use std::io::Write;

use serde::Serialize;

use crate::aggregate::FileStat;
use crate::config::OutputFormat;
use crate::decode::decompose_dev;
use crate::error::Result;
use crate::watcher::ReasonSnapshot;

const COMM_WIDTH: usize = 20;
const RULE: &str = "===========================================================================";

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessReport {
    pub pid: u32,
    pub comm: String,
    pub container_hostname: String,
    /// bytes per second
    pub fs_read: u64,
    pub fs_write: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub file_stat: Vec<String>,
    pub file_count: u32,
    /// Structured form of `file_stat`, for the table renderer
    #[serde(skip)]
    pub files: Vec<FileStat>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IoStack {
    pub pid: u32,
    pub comm: String,
    pub container_hostname: String,
    pub latency_us: u64,
    pub stack: Vec<String>,
}

/// Everything one capture run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IoReport {
    /// Set when the run was triggered by the watcher
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonSnapshot>,
    pub process_data: Vec<ProcessReport>,
    pub io_stack: Vec<IoStack>,
}

impl IoReport {
    pub fn write<W: Write>(&self, w: &mut W, format: OutputFormat) -> Result<()> {
        match format {
            OutputFormat::Json => {
                serde_json::to_writer(&mut *w, self)?;
                writeln!(w)?;
            }
            OutputFormat::Table => write_table(w, self)?,
        }
        Ok(())
    }
}

/// 1024 based, one decimal for small non-byte values.
pub fn format_bytes(nbytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if nbytes == 0 {
        return "0B".to_string();
    }

    let mut value = nbytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if value < 10.0 && unit > 0 {
        format!("{value:.1}{}", UNITS[unit])
    } else {
        format!("{value:.0}{}", UNITS[unit])
    }
}

fn short_comm(comm: &str) -> String {
    if comm.chars().count() > COMM_WIDTH {
        let head: String = comm.chars().take(COMM_WIDTH - 3).collect();
        format!("{head}...")
    } else {
        comm.to_string()
    }
}

fn write_table<W: Write>(w: &mut W, report: &IoReport) -> std::io::Result<()> {
    if let Some(reason) = &report.reason {
        writeln!(
            w,
            "TRIGGERED BY: {} on {} (util={}%, read_await={}ms, write_await={}ms)",
            reason.kind,
            reason.device,
            reason.iostatus.io_util,
            reason.iostatus.read_await,
            reason.iostatus.write_await
        )?;
        writeln!(w)?;
    }

    writeln!(w, "PID      COMMAND              FS_READ FS_WRITE DISK_READ DISK_WRITE FILES")?;
    writeln!(w, "=======  ==================== ======= ======== ========= ========== =====")?;
    for p in &report.process_data {
        writeln!(
            w,
            "{:<7}  {:<20} {:>7} {:>8} {:>9} {:>10} {:>5}",
            p.pid,
            short_comm(&p.comm),
            format_bytes(p.fs_read),
            format_bytes(p.fs_write),
            format_bytes(p.disk_read),
            format_bytes(p.disk_write),
            p.file_count
        )?;
    }
    writeln!(w)?;

    for p in &report.process_data {
        writeln!(w, "{RULE}")?;
        writeln!(
            w,
            "PID: {:<7} TOTAL_IO: R={} W={}  FILES: {}",
            p.pid,
            format_bytes(p.fs_read),
            format_bytes(p.fs_write),
            p.file_count
        )?;
        writeln!(w, "COMMAND: {}", p.comm)?;
        if !p.container_hostname.is_empty() {
            writeln!(w, "CONTAINER: {}", p.container_hostname)?;
        }
        writeln!(w, "-----------------------------------")?;
        writeln!(w, "DEVICE   FS_READ FS_WRITE DISK_READ DISK_WRITE   LATENCY(us)          FILE (INODE)")?;
        for f in &p.files {
            let (major, minor) = decompose_dev(f.dev);
            writeln!(
                w,
                "{:<8} {:>7} {:>8} {:>9} {:>10}   q2c={:<6} d2c={:<6} {}{} ({})",
                format!("{major}:{minor}"),
                format_bytes(f.fs_read_bps),
                format_bytes(f.fs_write_bps),
                format_bytes(f.disk_read_bps),
                format_bytes(f.disk_write_bps),
                f.q2c_us,
                f.d2c_us,
                f.path,
                f.container_suffix.as_deref().unwrap_or(""),
                f.inode
            )?;
        }
        writeln!(w)?;
    }

    if report.io_stack.is_empty() {
        return Ok(());
    }
    writeln!(w, "{RULE}")?;
    writeln!(w, "IO SCHEDULE OUTLIERS")?;
    for stack in &report.io_stack {
        writeln!(w, "-----------------------------------")?;
        write!(
            w,
            "PID: {:<7} COMMAND: {} LATENCY: {}us",
            stack.pid, stack.comm, stack.latency_us
        )?;
        if !stack.container_hostname.is_empty() {
            write!(w, " CONTAINER: {}", stack.container_hostname)?;
        }
        writeln!(w)?;
        for frame in &stack.stack {
            writeln!(w, "  {frame}")?;
        }
    }
    writeln!(w)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::encode_dev;
    use crate::diskstats::DiskStatus;

    fn sample_report() -> IoReport {
        let file = FileStat {
            dev: encode_dev(8, 0),
            fs_read_bps: 2048,
            fs_write_bps: 0,
            disk_read_bps: 1024,
            disk_write_bps: 0,
            q2c_us: 150,
            d2c_us: 90,
            inode: 1234,
            path: "var/lib/mysql/ibdata1".to_string(),
            container_suffix: None,
        };
        IoReport {
            reason: None,
            process_data: vec![ProcessReport {
                pid: 42,
                comm: "a-rather-long-command-line --with-flags".to_string(),
                container_hostname: "db-0".to_string(),
                fs_read: 2048,
                disk_read: 1024,
                file_stat: vec![file.to_string()],
                file_count: 1,
                files: vec![file],
                ..Default::default()
            }],
            io_stack: vec![IoStack {
                pid: 42,
                comm: "mysqld".to_string(),
                container_hostname: String::new(),
                latency_us: 150_000,
                stack: vec!["0xffffffff81000000: io_schedule+0x12".to_string()],
            }],
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1023), "1023B");
        assert_eq!(format_bytes(1024), "1.0KB");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(10 * 1024), "10KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0GB");
        assert_eq!(format_bytes(u64::MAX), "16384PB");
    }

    #[test]
    fn test_short_comm() {
        assert_eq!(short_comm("fio"), "fio");
        assert_eq!(short_comm("exactly-twenty-chars"), "exactly-twenty-chars");
        assert_eq!(short_comm("a-rather-long-command-line"), "a-rather-long-com...");
    }

    #[test]
    fn test_json_schema() {
        let mut out = Vec::new();
        sample_report().write(&mut out, OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert!(value.get("reason").is_none());
        let process = &value["process_data"][0];
        assert_eq!(process["pid"], 42);
        assert_eq!(process["container_hostname"], "db-0");
        assert_eq!(process["fs_read"], 2048);
        assert_eq!(process["file_count"], 1);
        assert!(process.get("files").is_none());
        assert!(process["file_stat"][0]
            .as_str()
            .unwrap()
            .starts_with("[8:0], fs_read=2048b/s"));
        assert_eq!(value["io_stack"][0]["latency_us"], 150_000);
        assert_eq!(value["io_stack"][0]["stack"][0], "0xffffffff81000000: io_schedule+0x12");
    }

    #[test]
    fn test_json_with_reason() {
        let mut report = sample_report();
        report.reason = Some(ReasonSnapshot {
            kind: "ioutil".to_string(),
            device: "sda".to_string(),
            iostatus: DiskStatus {
                io_util: 99,
                ..Default::default()
            },
        });
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["reason"]["type"], "ioutil");
        assert_eq!(value["reason"]["device"], "sda");
        assert_eq!(value["reason"]["iostatus"]["io_util"], 99);
    }

    #[test]
    fn test_table() {
        let mut out = Vec::new();
        sample_report().write(&mut out, OutputFormat::Table).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("42       a-rather-long-com...   2.0KB"));
        assert!(text.contains("CONTAINER: db-0"));
        assert!(text.contains("var/lib/mysql/ibdata1 (1234)"));
        assert!(text.contains("IO SCHEDULE OUTLIERS"));
        assert!(text.contains("  0xffffffff81000000: io_schedule+0x12"));
    }
}
