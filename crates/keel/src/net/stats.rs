use rand::Rng;
use serde::{Deserialize, Serialize};

/// Artificial loss and latency applied to outgoing datagrams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Fraction in `0.0..=1.0`.
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() < self.loss_percent
    }

    pub fn delay_ms(&self) -> u32 {
        if !self.enabled || self.max_latency_ms == 0 {
            return 0;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            (rand_percent() * self.jitter_ms as f32) as u32
        } else {
            0
        };
        base + (rand_percent() * range as f32) as u32 + jitter
    }
}

/// Per-connection counters reported by a reliability layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_resent: u64,
    pub duplicate_messages_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub acks_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_waiting: usize,
    pub messages_unacked: usize,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
    pub packet_loss_percent: f32,
}

pub fn rand_percent() -> f32 {
    rand::thread_rng().r#gen::<f32>()
}
