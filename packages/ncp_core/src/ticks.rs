use std::fmt;
use std::time::Instant;

/// A monotonic tick counter, used to measure how long packets wait in destination queues.
///
/// The unit is up to the implementation; statistics are reported in the same unit.
pub trait TickSource: Send + Sync {
    /// The current tick count. Must never decrease.
    fn now(&self) -> u64;
}

/// Milliseconds elapsed since the tick source was created.
pub struct MonotonicTicks {
    origin: Instant,
}

impl MonotonicTicks {
    /// Creates a tick source starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl fmt::Debug for MonotonicTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonotonicTicks")
            .field("now", &self.now())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[cfg_attr(miri, ignore)]
    #[test]
    fn ticks_advance_in_milliseconds() {
        let ticks = MonotonicTicks::new();
        let before = ticks.now();

        thread::sleep(Duration::from_millis(20));

        assert!(ticks.now() >= before + 20);
    }
}
