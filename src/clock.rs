use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source used by the durability controller.
///
/// The queue only needs a monotonically non-decreasing millisecond counter to
/// decide whether the periodic flush interval has elapsed. Production code
/// uses [`SystemClock`]; tests inject a [`ManualClock`] and advance it
/// explicitly.
pub trait Clock: Send + Sync + Debug {
    /// Current time in milliseconds since some fixed epoch.
    fn now_millis(&self) -> u64;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::ZERO)
            .as_millis() as u64
    }
}

/// A clock that only moves when told to. Intended for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}
