//! Turns the programs in the BPF object into an ordered list of kprobes.
//!
//! Most programs carry their target in the section name (`kprobe/<symbol>`),
//! a few have their symbol picked here because it depends on the running
//! kernel:
//!
//! * the block QoS hooks were renamed from `rq_qos_issue`/`rq_qos_done` to
//!   `__rq_qos_issue`/`__rq_qos_done`, so we probe for the first pair and fall
//!   back to the second.
//! * the ext4/xfs programs are dropped when the filesystem isn't registered.
//! * the `io_schedule()` entry probes go last. The entry side records the
//!   stack that the kretprobe reports, so the return side has to be live
//!   before any entry can fire.

use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::process::ProcFs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Entry,
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachPoint {
    pub program: String,
    pub symbol: String,
    pub kind: ProbeKind,
}

impl AttachPoint {
    fn new(program: &str, symbol: &str, kind: ProbeKind) -> Self {
        AttachPoint {
            program: program.to_string(),
            symbol: symbol.to_string(),
            kind,
        }
    }
}

/// A program found in the BPF object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub name: String,
    pub section: String,
}

impl ProgramInfo {
    pub fn new(name: &str, section: &str) -> Self {
        ProgramInfo {
            name: name.to_string(),
            section: section.to_string(),
        }
    }
}

/// What we need to know about the running kernel to build a plan.
pub trait KernelFeatures {
    /// Whether `name` shows up in `available_filter_functions`.
    fn has_filter_function(&self, name: &str) -> bool;
    /// Whether `fs` is a registered filesystem type.
    fn supports_filesystem(&self, fs: &str) -> io::Result<bool>;
}

/// Preferred pair first, the only fallback second.
pub const RQ_QOS_SYMBOLS: [(&str, &str); 2] = [
    ("rq_qos_issue", "rq_qos_done"),
    ("__rq_qos_issue", "__rq_qos_done"),
];

const PROG_RQ_QOS_ISSUE: &str = "bpf_rq_qos_issue";
const PROG_RQ_QOS_DONE: &str = "bpf_rq_qos_done";

/// Entry probes on the scheduling wait functions, attached after everything
/// else.
const IO_SCHEDULE_ENTRIES: [(&str, &str); 2] = [
    ("bpf_io_schedule", "io_schedule"),
    ("bpf_io_schedule_timeout", "io_schedule_timeout"),
];

const FILESYSTEM_PROGRAMS: [(&str, [&str; 3]); 2] = [
    (
        "ext4",
        [
            "bpf_ext4_file_read_iter",
            "bpf_ext4_file_write_iter",
            "bpf_ext4_page_mkwrite",
        ],
    ),
    (
        "xfs",
        [
            "bpf_xfs_file_read_iter",
            "bpf_xfs_file_write_iter",
            "bpf_xfs_filemap_page_mkwrite",
        ],
    ),
];

fn kind_from_section(section: &str) -> ProbeKind {
    if section.starts_with("kretprobe") {
        ProbeKind::Return
    } else {
        ProbeKind::Entry
    }
}

/// Returns the (issue, done) symbols this kernel exposes.
pub fn select_rq_qos_symbols(features: &dyn KernelFeatures) -> (&'static str, &'static str) {
    let (issue, done) = RQ_QOS_SYMBOLS[0];
    if features.has_filter_function(issue) {
        return (issue, done);
    }
    RQ_QOS_SYMBOLS[1]
}

/// Build the attachment list for `programs`.
///
/// Any program whose section can't be turned into a symbol fails the whole
/// plan, nothing is attached in that case.
pub fn resolve_attach_plan(
    programs: &[ProgramInfo],
    features: &dyn KernelFeatures,
) -> Result<Vec<AttachPoint>> {
    let mut excluded: Vec<&str> = Vec::new();
    for (fs, progs) in FILESYSTEM_PROGRAMS.iter() {
        let supported = features.supports_filesystem(fs).map_err(|e| {
            Error::Resolution(format!("failed to check filesystem support for {fs}: {e}"))
        })?;
        if !supported {
            info!("{fs} is not registered, skipping its programs");
            excluded.extend(progs.iter());
        }
    }

    let (issue_symbol, done_symbol) = select_rq_qos_symbols(features);
    info!("using {issue_symbol}/{done_symbol} for block request tracking");

    let mut plan = Vec::new();
    let mut deferred = Vec::new();
    for prog in programs {
        let name = prog.name.as_str();
        if excluded.contains(&name) {
            debug!("excluding program {name}");
            continue;
        }
        let kind = kind_from_section(&prog.section);

        if let Some((_, symbol)) = IO_SCHEDULE_ENTRIES.iter().find(|(p, _)| *p == name) {
            deferred.push(AttachPoint::new(name, symbol, kind));
            continue;
        }

        let point = match name {
            PROG_RQ_QOS_ISSUE => AttachPoint::new(name, issue_symbol, kind),
            PROG_RQ_QOS_DONE => AttachPoint::new(name, done_symbol, kind),
            _ => {
                let parts: Vec<&str> = prog.section.split('/').collect();
                if parts.len() != 2 || parts[1].is_empty() {
                    return Err(Error::Resolution(format!(
                        "invalid section name '{}' for program {name}",
                        prog.section
                    )));
                }
                AttachPoint::new(name, parts[1], kind)
            }
        };
        plan.push(point);
    }

    plan.extend(deferred);
    Ok(plan)
}

/// Kernel features as seen through tracefs and procfs.
#[derive(Debug, Clone)]
pub struct SysKernelFeatures {
    tracefs_dirs: Vec<PathBuf>,
    procfs: ProcFs,
}

impl Default for SysKernelFeatures {
    fn default() -> Self {
        SysKernelFeatures {
            tracefs_dirs: vec![
                PathBuf::from("/sys/kernel/debug/tracing"),
                PathBuf::from("/sys/kernel/tracing"),
            ],
            procfs: ProcFs::default(),
        }
    }
}

impl SysKernelFeatures {
    pub fn new(tracefs: impl Into<PathBuf>, procfs: ProcFs) -> Self {
        SysKernelFeatures {
            tracefs_dirs: vec![tracefs.into()],
            procfs,
        }
    }
}

impl KernelFeatures for SysKernelFeatures {
    fn has_filter_function(&self, name: &str) -> bool {
        for dir in self.tracefs_dirs.iter() {
            let Ok(funcs) = fs::read_to_string(dir.join("available_filter_functions")) else {
                continue;
            };
            // Lines look like "rq_qos_issue" or "foo [module]".
            return funcs
                .lines()
                .filter_map(|line| line.split_whitespace().next())
                .any(|func| func == name);
        }
        false
    }

    fn supports_filesystem(&self, fs: &str) -> io::Result<bool> {
        let filesystems = self.procfs.filesystems()?;
        Ok(filesystems
            .lines()
            .filter_map(|line| line.split_whitespace().last())
            .any(|name| name == fs))
    }
}
