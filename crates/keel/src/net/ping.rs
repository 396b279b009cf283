use super::clock::TimeMs;

pub const PING_SAMPLES: usize = 5;
pub const PING_INTERVAL_MS: u64 = 5_000;
/// Retry interval while no round trip has been measured yet.
pub const FIRST_PING_RETRY_MS: u64 = 250;

const OUTLIER_FACTOR: u32 = 3;
const OUTLIER_FLOOR_MS: u32 = 1_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSample {
    pub rtt_ms: u32,
    /// `remote - local` at the moment the pong was sent.
    pub clock_differential: i64,
}

/// Rolling window of the last five round trips for one connection.
#[derive(Debug, Clone, Default)]
pub struct PingTracker {
    samples: [Option<PingSample>; PING_SAMPLES],
    next_index: usize,
    last: Option<PingSample>,
    lowest_ping: Option<u32>,
    next_ping_at: TimeMs,
    last_sent_at: Option<TimeMs>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pings are due every five seconds, and every [`FIRST_PING_RETRY_MS`]
    /// until a first round trip has been measured.
    pub fn should_ping(&self, now: TimeMs) -> bool {
        match (self.lowest_ping, self.last_sent_at) {
            (None, Some(sent_at)) => now >= sent_at + FIRST_PING_RETRY_MS,
            (None, None) => true,
            (Some(_), _) => now >= self.next_ping_at,
        }
    }

    pub fn on_ping_sent(&mut self, now: TimeMs) {
        self.last_sent_at = Some(now);
        self.next_ping_at = now + PING_INTERVAL_MS;
    }

    /// Records a pong. Returns `false` when the sample was rejected as a
    /// congestion outlier.
    pub fn record(&mut self, ping_sent_at: TimeMs, remote_pong_time: TimeMs, now: TimeMs) -> bool {
        let rtt_ms = now.saturating_sub(ping_sent_at).min(u32::MAX as u64) as u32;

        if let Some(previous) = self.last {
            if rtt_ms >= previous.rtt_ms.saturating_mul(OUTLIER_FACTOR) && rtt_ms >= OUTLIER_FLOOR_MS
            {
                log::trace!("discarding ping outlier {}ms (previous {}ms)", rtt_ms, previous.rtt_ms);
                return false;
            }
        }

        let midpoint = (ping_sent_at + now) / 2;
        let sample = PingSample {
            rtt_ms,
            clock_differential: remote_pong_time as i64 - midpoint as i64,
        };

        self.samples[self.next_index] = Some(sample);
        self.next_index = (self.next_index + 1) % PING_SAMPLES;
        self.last = Some(sample);
        self.lowest_ping = Some(self.lowest_ping.map_or(rtt_ms, |low| low.min(rtt_ms)));
        true
    }

    pub fn average_ping(&self) -> Option<u32> {
        let (sum, count) = self
            .samples
            .iter()
            .flatten()
            .fold((0u64, 0u64), |(sum, count), s| (sum + s.rtt_ms as u64, count + 1));
        (count > 0).then(|| (sum / count) as u32)
    }

    /// Lowest round trip ever observed on this connection.
    pub fn lowest_ping(&self) -> Option<u32> {
        self.lowest_ping
    }

    pub fn last_ping(&self) -> Option<u32> {
        self.last.map(|s| s.rtt_ms)
    }

    /// Differential paired with the lowest round trip in the window; a faster
    /// round trip brackets the remote clock more tightly.
    pub fn clock_differential(&self) -> i64 {
        self.samples
            .iter()
            .flatten()
            .min_by_key(|s| s.rtt_ms)
            .map_or(0, |s| s.clock_differential)
    }

    pub fn samples(&self) -> impl Iterator<Item = &PingSample> {
        self.samples.iter().flatten()
    }
}
