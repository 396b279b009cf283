use std::collections::{HashSet, VecDeque};

use crate::net::clock::TimeMs;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// How far past the lowest undelivered number a reliable message may be.
pub const MESSAGE_WINDOW: u32 = 16_384;

const MIN_RTO_MS: f32 = 100.0;
const MAX_RTO_MS: f32 = 2_000.0;

pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone)]
pub struct PendingDatagram {
    pub sequence: u32,
    pub sent_at: TimeMs,
    /// Reliable message numbers carried by this datagram.
    pub messages: Vec<u32>,
    pub acked: bool,
}

/// Outgoing datagrams awaiting acknowledgement, plus the smoothed RTT they yield.
#[derive(Debug)]
pub struct AckTracker {
    pending: VecDeque<PendingDatagram>,
    max_pending: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(max_pending),
            max_pending,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    /// Datagrams evicted here lose their ack path; their messages fall back
    /// to the resend timer.
    pub fn track_datagram(&mut self, sequence: u32, messages: Vec<u32>, now: TimeMs) {
        while self.pending.len() >= self.max_pending {
            self.pending.pop_front();
        }

        self.pending.push_back(PendingDatagram {
            sequence,
            sent_at: now,
            messages,
            acked: false,
        });
    }

    /// Returns the message numbers newly acknowledged by `ack`/`ack_bitfield`.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: TimeMs) -> Vec<u32> {
        let mut acked_messages = Vec::new();
        let mut rtt_samples = Vec::new();

        for pending in &mut self.pending {
            if pending.acked {
                continue;
            }

            let is_acked = if pending.sequence == ack {
                true
            } else if sequence_greater_than(ack, pending.sequence) {
                let diff = ack.wrapping_sub(pending.sequence);
                diff <= 32 && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if is_acked {
                pending.acked = true;
                acked_messages.append(&mut pending.messages);
                rtt_samples.push(now.saturating_sub(pending.sent_at) as f32);
            }
        }

        for rtt in rtt_samples {
            self.update_rtt(rtt);
        }

        while self.pending.front().is_some_and(|p| p.acked) {
            self.pending.pop_front();
        }

        acked_messages
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    /// Retransmission timeout in milliseconds.
    pub fn rto_ms(&self) -> u64 {
        (self.srtt + 4.0 * self.rtt_var).clamp(MIN_RTO_MS, MAX_RTO_MS) as u64
    }

    pub fn unacked_count(&self) -> usize {
        self.pending.iter().filter(|p| !p.acked).count()
    }
}

/// Incoming datagram sequence numbers, summarised as ack + 32-bit bitfield.
#[derive(Debug)]
pub struct ReceiveTracker {
    has_received: bool,
    last_received: u32,
    received_bitfield: u32,
    recent_sequences: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            has_received: false,
            last_received: 0,
            received_bitfield: 0,
            recent_sequences: VecDeque::with_capacity(128),
            max_recent: 128,
        }
    }

    /// Returns `false` for a datagram seen recently.
    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }

        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        if !self.has_received {
            self.has_received = true;
            self.last_received = sequence;
            self.received_bitfield = 0;
        } else if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                self.received_bitfield = (self.received_bitfield << (diff - 1) << 1) | (1 << (diff - 1));
            } else {
                self.received_bitfield = 0;
            }
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bitfield |= 1 << (diff - 1);
            }
        }

        true
    }

    pub fn has_received(&self) -> bool {
        self.has_received
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bitfield)
    }
}

/// Reliable message numbers already delivered, for dropping resent duplicates.
///
/// Everything below `base` has been seen; `above` holds the sparse tail.
#[derive(Debug, Default)]
pub struct ReceivedWindow {
    base: u32,
    above: HashSet<u32>,
}

impl ReceivedWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, number: u32) -> bool {
        sequence_greater_than(self.base, number) || self.above.contains(&number)
    }

    /// False for a number too far ahead of the delivered prefix to track.
    pub fn admits(&self, number: u32) -> bool {
        !sequence_greater_than(number, self.base)
            || number.wrapping_sub(self.base) < MESSAGE_WINDOW
    }

    /// Returns `true` the first time `number` is seen.
    pub fn insert(&mut self, number: u32) -> bool {
        if self.contains(number) || !self.admits(number) {
            return false;
        }
        self.above.insert(number);
        while self.above.remove(&self.base) {
            self.base = self.base.wrapping_add(1);
        }
        true
    }

    pub fn gap_len(&self) -> usize {
        self.above.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wrapping() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_receive_tracker_bitfield() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(1);
        tracker.record_received(2);
        tracker.record_received(3);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn test_first_datagram_zero() {
        let mut tracker = ReceiveTracker::new();
        assert!(!tracker.has_received());
        assert!(tracker.record_received(0));
        assert!(tracker.has_received());
        assert_eq!(tracker.ack_data(), (0, 0));

        tracker.record_received(1);
        assert_eq!(tracker.ack_data(), (1, 0b1));
    }

    #[test]
    fn test_gap_of_32() {
        let mut tracker = ReceiveTracker::new();
        tracker.record_received(0);
        tracker.record_received(32);
        assert_eq!(tracker.ack_data(), (32, 1 << 31));
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
    }

    #[test]
    fn test_ack_tracker_rtt() {
        let mut tracker = AckTracker::new(32);

        tracker.track_datagram(1, vec![7, 8], 1_000);
        let acked = tracker.process_ack(1, 0, 1_040);

        assert_eq!(acked, vec![7, 8]);
        assert!(tracker.srtt() < 100.0);
        assert_eq!(tracker.unacked_count(), 0);
    }

    #[test]
    fn test_ack_tracker_bitfield() {
        let mut tracker = AckTracker::new(32);
        tracker.track_datagram(5, vec![1], 0);
        tracker.track_datagram(6, vec![2], 0);
        tracker.track_datagram(7, vec![3], 0);

        // 7 acked directly, 5 via bit 1, 6 lost
        let acked = tracker.process_ack(7, 0b10, 10);
        assert_eq!(acked, vec![1, 3]);
        assert_eq!(tracker.unacked_count(), 1);
    }

    #[test]
    fn test_rto_clamped() {
        let tracker = AckTracker::new(8);
        assert_eq!(tracker.rto_ms(), 300);

        let mut fast = AckTracker::new(8);
        for i in 0..64 {
            fast.track_datagram(i, Vec::new(), 0);
            fast.process_ack(i, 0, 1);
        }
        assert_eq!(fast.rto_ms(), 100);
    }

    #[test]
    fn test_received_window() {
        let mut window = ReceivedWindow::new();
        assert!(window.insert(0));
        assert!(window.insert(2));
        assert!(!window.insert(2));
        assert_eq!(window.gap_len(), 1);

        assert!(window.insert(1));
        assert_eq!(window.gap_len(), 0);
        assert!(!window.insert(0));
        assert!(!window.insert(1));
    }

    #[test]
    fn test_received_window_refuses_far_ahead() {
        let mut window = ReceivedWindow::new();
        assert!(window.admits(MESSAGE_WINDOW - 1));
        assert!(!window.admits(MESSAGE_WINDOW));
        assert!(!window.insert(MESSAGE_WINDOW + 10));
        assert_eq!(window.gap_len(), 0);

        // stale numbers stay admissible so duplicates are recognised
        assert!(window.insert(0));
        assert!(window.admits(0));
        assert!(window.contains(0));
        assert!(window.admits(MESSAGE_WINDOW));
    }
}
