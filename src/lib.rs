//! iotracing library - shared by the `iotracing` capture tool and the
//! `iowatch` daemon.
//!
//! A capture run attaches kprobes around the block layer and
//! `io_schedule()`, keeps the slowest `io_schedule()` stacks while the window
//! is open, then dumps the per-file I/O map and ranks processes by how many
//! bytes they pushed to disk.
//!
//! # Modules
//!
//! - [`capture`] - one capture run from attach to report
//! - [`attach`] - which program goes on which kernel symbol, in what order
//! - [`consumer`] / [`decode`] - the event stream and the kernel record layouts
//! - [`aggregate`] - per-process ranking and per-file detail
//! - [`correlate`] - cgroup and pid to container mapping
//! - [`watcher`] - diskstats polling that triggers a capture
//!
//! # Example
//!
//! ```no_run
//! use iotracing::{run_bpf_capture, CancelToken, CaptureConfig, OutputFormat};
//!
//! let config = CaptureConfig {
//!     duration_secs: 4,
//!     ..Default::default()
//! };
//! let report = run_bpf_capture(&config, &CancelToken::new(), None)?;
//! report.write(&mut std::io::stdout(), OutputFormat::Json)?;
//! # Ok::<(), iotracing::Error>(())
//! ```

pub mod aggregate;
pub mod attach;
pub mod bpf;
pub mod capture;
pub mod config;
pub mod consumer;
pub mod correlate;
pub mod dataplane;
pub mod decode;
pub mod diskstats;
pub mod error;
pub mod process;
pub mod report;
pub mod shutdown;
pub mod storage;
pub mod symbolize;
pub mod tally;
pub mod watcher;

pub use capture::{run_bpf_capture, run_capture, BpfCaptureLauncher, CaptureEnv};
pub use config::{parse_device_filter, CaptureConfig, OutputFormat};
pub use error::{Error, Result};
pub use report::IoReport;
pub use shutdown::CancelToken;
pub use watcher::{ThresholdWatcher, WatchConfig, WatchOutcome};

/// Map a `-v` count onto a log level and install `env_logger`. `RUST_LOG`
/// still wins when it is set.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();
    // A second init (tests, embedding) keeps whatever logger is already there.
    let _ = builder.try_init();
}
