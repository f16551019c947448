use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use libbpf_rs::{Link, Map, MapCore, MapFlags, Object, ObjectBuilder, PerfBuffer, PerfBufferBuilder};
use log::{debug, info, warn};

use crate::attach::{AttachPoint, ProbeKind, ProgramInfo};
use crate::dataplane::{DataPlane, EventStream, MapEntry, StreamError, FILTER_DEVS_MAP};
use crate::error::{Error, Result};
use crate::shutdown::CancelToken;

/// Memory lock limit for BPF maps (128 MiB)
const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

/// Pages per CPU for the perf event array, matches what the kernel side expects.
const PERF_BUFFER_PAGES: usize = 8192 / 4;

/// How long one perf buffer poll may block before we look at the cancel flag.
const PERF_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Bump the memory lock rlimit for BPF programs.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        return Err(Error::DataPlane(format!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB. This is required for BPF programs.",
            MEMLOCK_RLIMIT_BYTES >> 20
        )));
    }

    Ok(())
}

fn bpf_err(what: impl AsRef<str>) -> impl FnOnce(libbpf_rs::Error) -> Error {
    let what = what.as_ref().to_string();
    move |e| Error::DataPlane(format!("{what}: {e}"))
}

/// A compiled BPF object loaded into the kernel, plus the links we created.
pub struct LibbpfDataPlane {
    object: Object,
    links: Vec<Link>,
}

impl LibbpfDataPlane {
    pub fn open(path: &Path, verbose: bool) -> Result<Self> {
        bump_memlock_rlimit()?;

        if let Some(version) = sysinfo::System::kernel_version() {
            info!("loading {} on kernel {version}", path.display());
        }

        let mut builder = ObjectBuilder::default();
        builder.debug(verbose);
        let open_object = builder.open_file(path).map_err(bpf_err(format!(
            "Failed to open BPF object {}",
            path.display()
        )))?;
        let object = open_object.load().map_err(bpf_err(
            "Failed to load BPF object into kernel. Check dmesg for BPF verifier errors",
        ))?;

        Ok(LibbpfDataPlane {
            object,
            links: Vec::new(),
        })
    }

    fn map(&self, name: &str) -> Result<Map<'_>> {
        self.object
            .maps()
            .find(|m| m.name() == OsStr::new(name))
            .ok_or_else(|| Error::DataPlane(format!("map {name} not found in BPF object")))
    }
}

impl DataPlane for LibbpfDataPlane {
    fn programs(&self) -> Vec<ProgramInfo> {
        self.object
            .progs()
            .map(|prog| ProgramInfo {
                name: prog.name().to_string_lossy().into_owned(),
                section: prog.section().to_string_lossy().into_owned(),
            })
            .collect()
    }

    fn set_device_filter(&mut self, devs: &[u32]) -> Result<()> {
        if devs.is_empty() {
            return Ok(());
        }
        let map = self.map(FILTER_DEVS_MAP)?;
        let val = (1_u8).to_ne_bytes();
        for dev in devs {
            map.update(&dev.to_ne_bytes(), &val, MapFlags::ANY)
                .map_err(bpf_err(format!("Failed to add device {dev:#x} to filter")))?;
        }
        Ok(())
    }

    fn attach(&mut self, plan: &[AttachPoint]) -> Result<()> {
        for point in plan {
            let retprobe = point.kind == ProbeKind::Return;
            let result = match self
                .object
                .progs_mut()
                .find(|p| p.name() == OsStr::new(&point.program))
            {
                Some(prog) => prog.attach_kprobe(retprobe, &point.symbol).map_err(|e| {
                    Error::DataPlane(format!(
                        "Failed to attach {} '{}' to {}: {e}. Ensure the function exists in the kernel.",
                        if retprobe { "kretprobe" } else { "kprobe" },
                        point.program,
                        point.symbol
                    ))
                }),
                None => Err(Error::Resolution(format!(
                    "program {} not found in BPF object",
                    point.program
                ))),
            };

            match result {
                Ok(link) => {
                    debug!("attached {} to {}", point.program, point.symbol);
                    self.links.push(link);
                }
                Err(e) => {
                    self.links.clear();
                    return Err(e);
                }
            }
        }
        info!("attached {} probes", self.links.len());
        Ok(())
    }

    fn event_stream<'a>(
        &'a self,
        map: &str,
        cancel: &CancelToken,
    ) -> Result<Box<dyn EventStream + 'a>> {
        let map = self.map(map)?;
        let (tx, rx) = channel();
        let lost = Arc::new(AtomicU64::new(0));
        let lost_cb = lost.clone();

        let perf = PerfBufferBuilder::new(&map)
            .pages(PERF_BUFFER_PAGES)
            .sample_cb(move |_cpu: i32, data: &[u8]| {
                // Receiver has been dropped, nothing left to do with the sample.
                let _ = tx.send(data.to_vec());
            })
            .lost_cb(move |cpu: i32, count: u64| {
                lost_cb.fetch_add(count, Ordering::Relaxed);
                debug!("cpu {cpu} lost {count} samples");
            })
            .build()
            .map_err(bpf_err("Failed to build perf buffer"))?;

        Ok(Box::new(PerfEventStream {
            perf,
            rx,
            lost,
            cancel: cancel.clone(),
        }))
    }

    fn detach(&mut self) -> Result<()> {
        let mut first_err = None;
        for link in self.links.drain(..) {
            if let Err(e) = link.detach() {
                warn!("failed to detach link: {e}");
                first_err.get_or_insert(Error::DataPlane(format!("Failed to detach: {e}")));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn dump_map(&self, name: &str) -> Result<Vec<MapEntry>> {
        let map = self.map(name)?;
        let mut entries = Vec::new();
        for key in map.keys() {
            let value = map
                .lookup(&key, MapFlags::ANY)
                .map_err(bpf_err(format!("Failed to look up entry in {name}")))?;
            // The entry can vanish between keys() and lookup().
            if let Some(value) = value {
                entries.push(MapEntry { key, value });
            }
        }
        debug!("dumped {} entries from {name}", entries.len());
        Ok(entries)
    }
}

struct PerfEventStream<'a> {
    perf: PerfBuffer<'a>,
    rx: Receiver<Vec<u8>>,
    lost: Arc<AtomicU64>,
    cancel: CancelToken,
}

impl EventStream for PerfEventStream<'_> {
    fn next_event(&mut self) -> std::result::Result<Vec<u8>, StreamError> {
        loop {
            match self.rx.try_recv() {
                Ok(data) => return Ok(data),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(StreamError::Failed("perf buffer closed".to_string()))
                }
            }

            if self.cancel.is_cancelled() {
                return Err(StreamError::Cancelled);
            }

            if let Err(e) = self.perf.poll(PERF_POLL_TIMEOUT) {
                if e.kind() == libbpf_rs::ErrorKind::Interrupted {
                    continue;
                }
                return Err(StreamError::Failed(e.to_string()));
            }
        }
    }

    fn lost_events(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}
