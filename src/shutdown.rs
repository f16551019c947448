use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Stop flag shared between Ctrl-C, a run deadline and whoever is reading
/// events. Readers only ever ask [`CancelToken::is_cancelled`], so an
/// elapsed deadline and an interrupt look exactly the same to them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// A token that also fires after `timeout`. Cancelling either the parent
    /// or the child stops both, the deadline only applies to the child.
    ///
    /// A timeout too far out to be represented adds no deadline of its own.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        CancelToken {
            flag: self.flag.clone(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Sleep for `duration` unless cancelled first. Returns false if the
    /// sleep was cut short.
    ///
    /// A duration that overflows `Instant` sleeps until cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let slice = match end {
                Some(end) => {
                    let now = Instant::now();
                    if now >= end {
                        return true;
                    }
                    SLEEP_SLICE.min(end - now)
                }
                None => SLEEP_SLICE,
            };
            thread::sleep(slice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_child() {
        let parent = CancelToken::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancel_stops_parent() {
        let parent = CancelToken::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        child.cancel();
        assert!(parent.is_cancelled());
    }

    #[test]
    fn test_deadline() {
        let parent = CancelToken::new();
        let child = parent.with_timeout(Duration::ZERO);
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_keeps_earlier_parent_deadline() {
        let parent = CancelToken::new().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn test_unrepresentable_timeout() {
        let parent = CancelToken::new();
        let child = parent.with_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(child.deadline(), None);
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());

        let bounded = CancelToken::new().with_timeout(Duration::from_secs(1));
        let child = bounded.with_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(child.deadline(), bounded.deadline());
    }

    #[test]
    fn test_unrepresentable_sleep_waits_for_cancel() {
        let token = CancelToken::new();
        let stop = token.clone();
        let handle = thread::spawn(move || token.sleep(Duration::from_secs(u64::MAX)));
        thread::sleep(Duration::from_millis(50));
        stop.cancel();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn test_sleep_interrupted() {
        let token = CancelToken::new();
        token.cancel();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(CancelToken::new().sleep(Duration::from_millis(1)));
    }
}
