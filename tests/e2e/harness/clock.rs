use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Controllable time for timeout and cleanup testing.
///
/// Passed to the peer as a time provider so the engine's deadline loops
/// and the cache's cleanup grace period run on test-controlled time.
#[derive(Clone)]
pub struct MockClock {
    current: Arc<AtomicI64>,
}

impl MockClock {
    /// Create a new mock clock starting at a fixed epoch.
    pub fn new() -> Self {
        Self {
            current: Arc::new(AtomicI64::new(1_700_000_000_000)),
        }
    }

    /// Creates a time provider function suitable for the peer.
    pub fn as_provider(&self) -> impl Fn() -> i64 + 'static {
        let current = self.current.clone();
        move || current.load(Ordering::SeqCst)
    }

    /// Get the current timestamp in milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Advance time by a duration.
    pub fn advance(&self, duration: Duration) {
        self.current
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    /// Advance time by milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.current.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}
