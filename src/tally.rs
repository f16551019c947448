use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TallySnapshot {
    pub host: u64,
    pub containers: HashMap<String, u64>,
}

/// Host-wide and per-container outlier counts. Every update is a
/// read-modify-write of both counters under the one lock.
#[derive(Debug, Default)]
pub struct OutlierTally {
    inner: Mutex<TallySnapshot>,
}

impl OutlierTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one outlier, optionally against a container too.
    pub fn record(&self, container: Option<&str>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.host += 1;
        if let Some(container) = container {
            *inner.containers.entry(container.to_string()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> TallySnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
