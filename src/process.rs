use std::fs;
use std::io;
use std::path::PathBuf;

/// `/proc/<pid>/cmdline` is cut down to this many bytes for display.
const CMDLINE_MAX_LEN: usize = 128;

/// Readers for the handful of `/proc` files we care about. The root is
/// configurable so tests can point it at a scratch directory.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProcFs { root: root.into() }
    }

    fn pid_path(&self, pid: u32, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    /// The process command line with NULs turned into spaces, or None if the
    /// process is gone or is a kernel thread.
    pub fn cmdline(&self, pid: u32) -> Option<String> {
        let mut data = fs::read(self.pid_path(pid, "cmdline")).ok()?;
        data.truncate(CMDLINE_MAX_LEN);
        for b in data.iter_mut() {
            if *b == 0 {
                *b = b' ';
            }
        }
        let cmdline = String::from_utf8_lossy(&data).trim_end().to_string();
        if cmdline.is_empty() {
            None
        } else {
            Some(cmdline)
        }
    }

    pub fn cgroup(&self, pid: u32) -> io::Result<String> {
        fs::read_to_string(self.pid_path(pid, "cgroup"))
    }

    pub fn filesystems(&self) -> io::Result<String> {
        fs::read_to_string(self.root.join("filesystems"))
    }

    pub fn diskstats(&self) -> io::Result<String> {
        fs::read_to_string(self.root.join("diskstats"))
    }
}
