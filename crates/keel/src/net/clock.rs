use std::time::{Duration, Instant};

/// Milliseconds on a peer's local clock.
pub type TimeMs = u64;

/// Monotonic millisecond clock anchored at peer creation.
///
/// Every timer, ping sample and wire timestamp of a peer reads this clock, so
/// the application thread and the network thread agree on "now".
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> TimeMs {
        self.origin.elapsed().as_millis() as TimeMs
    }

    pub fn to_instant(&self, time: TimeMs) -> Instant {
        self.origin + Duration::from_millis(time)
    }
}
