//! Clock abstraction so expiry logic can run against an injected time source.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tells the current time in milliseconds since the Unix epoch.
///
/// All expiry comparisons in the crate go through this trait; production code
/// uses [`SystemClock`], tests drive a [`TestClock`] forward by hand.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The wall clock as provided by `std::time::SystemTime`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A manually driven clock for tests.
///
/// Cloning shares the underlying time, so a clone handed to the system under
/// test observes every `set`/`advance` made by the test.
#[derive(Clone, Debug, Default)]
pub struct TestClock {
    now: Arc<AtomicU64>,
}

impl TestClock {
    #[must_use]
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(now_millis)),
        }
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: u64) {
        self.now.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_past_2020() {
        // 2020-01-01T00:00:00Z in milliseconds
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_clock_set_and_advance() {
        let clock = TestClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);

        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_clock_clones_share_time() {
        let clock = TestClock::new(0);
        let observer = clock.clone();
        clock.advance(2_000);
        assert_eq!(observer.now_millis(), 2_000);
    }
}
