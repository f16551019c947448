//! Container attribution for cgroup addresses and pids.
//!
//! The correlator keeps one snapshot of the metadata server's container list
//! and serves lookups from it. The snapshot expires after a fixed TTL. A
//! lookup miss may also refresh it early, at most once per
//! [`MISS_REFRESH_INTERVAL`], so a storm of host-level records doesn't turn
//! into a storm of HTTP requests.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::process::ProcFs;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);
pub const MISS_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
pub const BLKIO_SUBSYSTEM: &str = "blkio";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// A 64 hex digit container id at the end of a kubepods or docker cgroup
/// path, with or without a systemd scope wrapper.
static CONTAINER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:kubepods|docker)[^\n]*?[/-]([0-9a-f]{64})(?:\.scope)?$")
        .expect("Invalid container id regex pattern")
});

/// One entry of the metadata server's container list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    /// cgroup subsystem name -> css address
    #[serde(default)]
    pub css: HashMap<String, u64>,
}

pub trait ContainerSource: Send + Sync {
    fn containers(&self) -> Result<Vec<Container>>;
}

/// Talks to the local metadata server, `GET /containers/json`.
pub struct HttpContainerSource {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpContainerSource {
    pub fn new(server_address: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpContainerSource {
            url: format!("http://{server_address}/containers/json"),
            client,
        })
    }
}

impl ContainerSource for HttpContainerSource {
    fn containers(&self) -> Result<Vec<Container>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .and_then(|resp| resp.error_for_status())?;
        Ok(resp.json()?)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// What a record or process gets annotated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub id: String,
    /// None when the id is known but the container itself isn't
    pub name: Option<String>,
    pub hostname: Option<String>,
}

pub trait ContainerLookup {
    fn by_cgroup(&self, css: u64) -> Option<ContainerRef>;
    fn by_pid(&self, pid: u32) -> Option<ContainerRef>;
}

/// For runs without a metadata server. Never knows anything.
pub struct NoContainers;

impl ContainerLookup for NoContainers {
    fn by_cgroup(&self, _css: u64) -> Option<ContainerRef> {
        None
    }

    fn by_pid(&self, _pid: u32) -> Option<ContainerRef> {
        None
    }
}

/// Extract the container id from the contents of `/proc/<pid>/cgroup`.
pub fn container_id_from_cgroup(cgroup: &str) -> Option<String> {
    cgroup
        .lines()
        .filter_map(|line| CONTAINER_ID_RE.captures(line.trim_end()))
        .map(|caps| caps[1].to_string())
        .next()
}

#[derive(Default)]
struct Snapshot {
    css_to_id: HashMap<u64, String>,
    containers: HashMap<String, Container>,
    /// Last refresh attempt, successful or not
    refreshed_at: Option<Instant>,
}

impl Snapshot {
    fn age(&self, now: Instant) -> Option<Duration> {
        self.refreshed_at.map(|at| now.saturating_duration_since(at))
    }

    fn container_ref(&self, id: &str) -> ContainerRef {
        match self.containers.get(id) {
            // The server sends "" for fields it doesn't know.
            Some(c) => ContainerRef {
                id: id.to_string(),
                name: (!c.name.is_empty()).then(|| c.name.clone()),
                hostname: (!c.hostname.is_empty()).then(|| c.hostname.clone()),
            },
            None => ContainerRef {
                id: id.to_string(),
                name: None,
                hostname: None,
            },
        }
    }
}

pub struct ContainerCorrelator {
    source: Box<dyn ContainerSource>,
    clock: Arc<dyn Clock>,
    procfs: ProcFs,
    ttl: Duration,
    subsystem: String,
    snapshot: RwLock<Snapshot>,
}

impl ContainerCorrelator {
    pub fn new(
        source: Box<dyn ContainerSource>,
        clock: Arc<dyn Clock>,
        procfs: ProcFs,
        ttl: Duration,
    ) -> Self {
        ContainerCorrelator {
            source,
            clock,
            procfs,
            ttl,
            subsystem: BLKIO_SUBSYSTEM.to_string(),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Correlator backed by the metadata server at `server_address`.
    pub fn with_server(server_address: &str) -> Result<Self> {
        Ok(Self::new(
            Box::new(HttpContainerSource::new(server_address)?),
            Arc::new(SystemClock),
            ProcFs::default(),
            DEFAULT_CACHE_TTL,
        ))
    }

    /// Refresh if `stale` says the snapshot of the given age needs it. The
    /// check is repeated under the write lock so concurrent callers only
    /// refresh once.
    fn refresh_if(&self, stale: impl Fn(Option<Duration>) -> bool) -> bool {
        let age = self.read().age(self.clock.now());
        if !stale(age) {
            return false;
        }

        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        if !stale(snapshot.age(now)) {
            return false;
        }
        snapshot.refreshed_at = Some(now);

        match self.source.containers() {
            Ok(containers) => {
                snapshot.css_to_id.clear();
                snapshot.containers.clear();
                for container in containers {
                    if let Some(css) = container.css.get(&self.subsystem) {
                        snapshot.css_to_id.insert(*css, container.id.clone());
                    }
                    snapshot.containers.insert(container.id.clone(), container);
                }
                debug!("refreshed {} containers", snapshot.containers.len());
            }
            Err(e) => warn!("failed to refresh containers, keeping old data: {e}"),
        }
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_fresh(&self) {
        let ttl = self.ttl;
        self.refresh_if(|age| age.map_or(true, |age| age >= ttl));
    }

    fn refresh_on_miss(&self) -> bool {
        self.refresh_if(|age| age.map_or(true, |age| age >= MISS_REFRESH_INTERVAL))
    }

    fn lookup<T>(&self, find: impl Fn(&Snapshot) -> Option<T>) -> Option<T> {
        self.ensure_fresh();
        if let Some(found) = find(&self.read()) {
            return Some(found);
        }
        if self.refresh_on_miss() {
            return find(&self.read());
        }
        None
    }
}

impl ContainerLookup for ContainerCorrelator {
    fn by_cgroup(&self, css: u64) -> Option<ContainerRef> {
        self.lookup(|snapshot| {
            snapshot
                .css_to_id
                .get(&css)
                .map(|id| snapshot.container_ref(id))
        })
    }

    fn by_pid(&self, pid: u32) -> Option<ContainerRef> {
        let cgroup = self.procfs.cgroup(pid).ok()?;
        let id = container_id_from_cgroup(&cgroup)?;
        // A container we can't find in the snapshot is still worth its id.
        self.lookup(|snapshot| {
            snapshot
                .containers
                .contains_key(&id)
                .then(|| snapshot.container_ref(&id))
        })
        .or_else(|| Some(self.read().container_ref(&id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const ID_A: &str = "7b48bb51fb200e35221bfdd256a96a49b16dbe0be9a1019f3b5e0709d9ddefe2";
    const ID_B: &str = "538594e684780c9adf15ae982a9f973accaae9c0556ab037a3cc85656b1cbac4";

    struct FakeClock {
        now: Mutex<Instant>,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(FakeClock {
                now: Mutex::new(Instant::now()),
            })
        }

        fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    #[derive(Clone, Default)]
    struct FakeSource {
        containers: Arc<Mutex<Option<Vec<Container>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn set(&self, containers: Option<Vec<Container>>) {
            *self.containers.lock().unwrap() = containers;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ContainerSource for FakeSource {
        fn containers(&self) -> Result<Vec<Container>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.containers
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::Config("server down".into()))
        }
    }

    fn container(id: &str, name: &str, blkio: u64) -> Container {
        Container {
            id: id.to_string(),
            name: name.to_string(),
            hostname: format!("{name}-host"),
            css: HashMap::from([(BLKIO_SUBSYSTEM.to_string(), blkio), ("cpu".to_string(), blkio + 1)]),
        }
    }

    fn correlator(source: &FakeSource, clock: &Arc<FakeClock>, procfs: ProcFs) -> ContainerCorrelator {
        ContainerCorrelator::new(Box::new(source.clone()), clock.clone(), procfs, Duration::from_secs(10))
    }

    #[test]
    fn test_container_id_from_cgroup() {
        let v1 = format!("12:blkio:/kubepods/burstable/pode611e7d6-0e77-11ee-a314-08c0eb65d6a2/{ID_A}\n11:devices:/\n");
        assert_eq!(container_id_from_cgroup(&v1).as_deref(), Some(ID_A));

        let docker = format!("11:cpuset:/docker/{ID_B}\n");
        assert_eq!(container_id_from_cgroup(&docker).as_deref(), Some(ID_B));

        let scope = format!("0::/system.slice/docker-{ID_B}.scope\n");
        assert_eq!(container_id_from_cgroup(&scope).as_deref(), Some(ID_B));

        assert_eq!(container_id_from_cgroup("0::/user.slice/session-1.scope\n"), None);
        assert_eq!(container_id_from_cgroup("11:cpuset:/docker/abc\n"), None);
    }

    #[test]
    fn test_by_cgroup_uses_blkio() {
        let source = FakeSource::default();
        source.set(Some(vec![container(ID_A, "nginx", 0x1000)]));
        let clock = FakeClock::new();
        let c = correlator(&source, &clock, ProcFs::default());

        let found = c.by_cgroup(0x1000).unwrap();
        assert_eq!(found.id, ID_A);
        assert_eq!(found.name.as_deref(), Some("nginx"));
        assert_eq!(found.hostname.as_deref(), Some("nginx-host"));
        assert!(c.by_cgroup(0x1001).is_none());
    }

    #[test]
    fn test_ttl_expiry_refreshes() {
        let source = FakeSource::default();
        source.set(Some(vec![container(ID_A, "nginx", 0x1000)]));
        let clock = FakeClock::new();
        let c = correlator(&source, &clock, ProcFs::default());

        assert!(c.by_cgroup(0x1000).is_some());
        assert!(c.by_cgroup(0x1000).is_some());
        assert_eq!(source.calls(), 1);

        source.set(Some(vec![container(ID_B, "redis", 0x1000)]));
        clock.advance(Duration::from_secs(5));
        assert_eq!(c.by_cgroup(0x1000).unwrap().id, ID_A);

        clock.advance(Duration::from_secs(5));
        assert_eq!(c.by_cgroup(0x1000).unwrap().id, ID_B);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_miss_refresh_rate_limited() {
        let source = FakeSource::default();
        source.set(Some(Vec::new()));
        let clock = FakeClock::new();
        let c = correlator(&source, &clock, ProcFs::default());

        for _ in 0..100 {
            assert!(c.by_cgroup(0x2000).is_none());
        }
        assert_eq!(source.calls(), 1);

        source.set(Some(vec![container(ID_A, "nginx", 0x2000)]));
        clock.advance(MISS_REFRESH_INTERVAL);
        assert!(c.by_cgroup(0x2000).is_some());
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_failed_refresh_keeps_stale_data() {
        let source = FakeSource::default();
        source.set(Some(vec![container(ID_A, "nginx", 0x1000)]));
        let clock = FakeClock::new();
        let c = correlator(&source, &clock, ProcFs::default());
        assert!(c.by_cgroup(0x1000).is_some());

        source.set(None);
        clock.advance(Duration::from_secs(11));
        assert_eq!(c.by_cgroup(0x1000).unwrap().id, ID_A);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_unreachable_server_is_a_miss() {
        let source = FakeSource::default();
        let clock = FakeClock::new();
        let c = correlator(&source, &clock, ProcFs::default());
        assert!(c.by_cgroup(0x1000).is_none());
    }

    #[test]
    fn test_by_pid() {
        let dir = TempDir::new().unwrap();
        for (pid, id) in [(10, ID_A), (11, ID_B)] {
            std::fs::create_dir_all(dir.path().join(pid.to_string())).unwrap();
            std::fs::write(
                dir.path().join(format!("{pid}/cgroup")),
                format!("11:cpuset:/docker/{id}\n"),
            )
            .unwrap();
        }
        let source = FakeSource::default();
        source.set(Some(vec![container(ID_A, "nginx", 0x1000)]));
        let clock = FakeClock::new();
        let c = correlator(&source, &clock, ProcFs::new(dir.path()));

        assert_eq!(c.by_pid(10).unwrap().hostname.as_deref(), Some("nginx-host"));

        let unknown = c.by_pid(11).unwrap();
        assert_eq!(unknown.id, ID_B);
        assert_eq!(unknown.hostname, None);

        assert!(c.by_pid(12).is_none());
    }

    #[test]
    fn test_empty_fields_are_unknown() {
        let source = FakeSource::default();
        source.set(Some(vec![Container {
            id: ID_A.to_string(),
            css: HashMap::from([(BLKIO_SUBSYSTEM.to_string(), 0x3000)]),
            ..Default::default()
        }]));
        let clock = FakeClock::new();
        let c = correlator(&source, &clock, ProcFs::default());

        let found = c.by_cgroup(0x3000).unwrap();
        assert_eq!(found.id, ID_A);
        assert_eq!(found.name, None);
        assert_eq!(found.hostname, None);
    }

    #[test]
    fn test_container_json() {
        let json = r#"[{"id":"abc","name":"web","hostname":"web-0","css":{"blkio":1234,"cpu":99},"labels":{}}]"#;
        let containers: Vec<Container> = serde_json::from_str(json).unwrap();
        assert_eq!(containers[0].css.get("blkio"), Some(&1234));
    }
}
