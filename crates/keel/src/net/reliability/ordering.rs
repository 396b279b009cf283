use std::collections::HashMap;

use bytes::Bytes;

use super::ORDERING_CHANNELS;
use super::tracking::sequence_greater_than;

/// How far past the next expected index an ordered message may be held.
pub const ORDERING_WINDOW: u32 = 2_048;

/// Next ordering and sequencing index per outgoing channel.
#[derive(Debug, Default)]
pub struct OutboundChannels {
    ordered: [u32; ORDERING_CHANNELS as usize],
    sequenced: [u32; ORDERING_CHANNELS as usize],
}

impl OutboundChannels {
    pub fn next_ordered(&mut self, channel: u8) -> u32 {
        let slot = &mut self.ordered[channel as usize];
        let index = *slot;
        *slot = slot.wrapping_add(1);
        index
    }

    pub fn next_sequenced(&mut self, channel: u8) -> u32 {
        let slot = &mut self.sequenced[channel as usize];
        let index = *slot;
        *slot = slot.wrapping_add(1);
        index
    }
}

/// Holds back ordered messages that arrive ahead of a gap.
#[derive(Debug, Default)]
struct OrderingChannel {
    expected: u32,
    held: HashMap<u32, Bytes>,
}

impl OrderingChannel {
    fn admits(&self, index: u32) -> bool {
        !sequence_greater_than(index, self.expected)
            || index.wrapping_sub(self.expected) < ORDERING_WINDOW
    }

    fn accept(&mut self, index: u32, payload: Bytes, out: &mut Vec<Bytes>) {
        if index == self.expected {
            out.push(payload);
            self.expected = self.expected.wrapping_add(1);
            while let Some(next) = self.held.remove(&self.expected) {
                out.push(next);
                self.expected = self.expected.wrapping_add(1);
            }
        } else if sequence_greater_than(index, self.expected) && self.admits(index) {
            self.held.entry(index).or_insert(payload);
        }
    }
}

#[derive(Debug, Default)]
pub struct InboundChannels {
    ordered: Vec<OrderingChannel>,
    /// Highest sequenced index delivered per channel.
    sequenced: Vec<Option<u32>>,
}

impl InboundChannels {
    pub fn new() -> Self {
        Self {
            ordered: (0..ORDERING_CHANNELS).map(|_| OrderingChannel::default()).collect(),
            sequenced: vec![None; ORDERING_CHANNELS as usize],
        }
    }

    /// False for an index the channel would refuse to hold.
    pub fn admits_ordered(&self, channel: u8, index: u32) -> bool {
        self.ordered
            .get(channel as usize)
            .is_some_and(|ordering| ordering.admits(index))
    }

    /// Appends whatever `payload` releases, in delivery order.
    pub fn accept_ordered(&mut self, channel: u8, index: u32, payload: Bytes, out: &mut Vec<Bytes>) {
        if let Some(ordering) = self.ordered.get_mut(channel as usize) {
            ordering.accept(index, payload, out);
        }
    }

    /// Returns `false` for a sequenced message older than one already delivered.
    pub fn accept_sequenced(&mut self, channel: u8, index: u32) -> bool {
        let Some(highest) = self.sequenced.get_mut(channel as usize) else {
            return false;
        };
        match *highest {
            Some(seen) if !sequence_greater_than(index, seen) => false,
            _ => {
                *highest = Some(index);
                true
            }
        }
    }

    pub fn held_count(&self) -> usize {
        self.ordered.iter().map(|c| c.held.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn ordered_waits_for_gap() {
        let mut inbound = InboundChannels::new();
        let mut out = Vec::new();

        inbound.accept_ordered(0, 1, b("b"), &mut out);
        inbound.accept_ordered(0, 2, b("c"), &mut out);
        assert!(out.is_empty());
        assert_eq!(inbound.held_count(), 2);

        inbound.accept_ordered(0, 0, b("a"), &mut out);
        assert_eq!(out, vec![b("a"), b("b"), b("c")]);
        assert_eq!(inbound.held_count(), 0);

        // stale index is dropped
        inbound.accept_ordered(0, 1, b("b"), &mut out);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn ordered_refuses_far_ahead() {
        let mut inbound = InboundChannels::new();
        let mut out = Vec::new();

        assert!(inbound.admits_ordered(0, ORDERING_WINDOW - 1));
        assert!(!inbound.admits_ordered(0, ORDERING_WINDOW));
        assert!(!inbound.admits_ordered(ORDERING_CHANNELS, 0));

        inbound.accept_ordered(0, ORDERING_WINDOW + 5, b("far"), &mut out);
        assert_eq!(inbound.held_count(), 0);

        inbound.accept_ordered(0, 0, b("a"), &mut out);
        assert!(inbound.admits_ordered(0, ORDERING_WINDOW));
        // behind the window is stale, not refused
        assert!(inbound.admits_ordered(0, 0));
    }

    #[test]
    fn channels_are_independent() {
        let mut inbound = InboundChannels::new();
        let mut out = Vec::new();

        inbound.accept_ordered(1, 1, b("late"), &mut out);
        inbound.accept_ordered(2, 0, b("other"), &mut out);
        assert_eq!(out, vec![b("other")]);
    }

    #[test]
    fn sequenced_drops_stale() {
        let mut inbound = InboundChannels::new();
        assert!(inbound.accept_sequenced(0, 5));
        assert!(!inbound.accept_sequenced(0, 3));
        assert!(!inbound.accept_sequenced(0, 5));
        assert!(inbound.accept_sequenced(0, 6));
        assert!(inbound.accept_sequenced(1, 0));
    }

    #[test]
    fn outbound_counters_per_channel() {
        let mut outbound = OutboundChannels::default();
        assert_eq!(outbound.next_ordered(0), 0);
        assert_eq!(outbound.next_ordered(0), 1);
        assert_eq!(outbound.next_ordered(4), 0);
        assert_eq!(outbound.next_sequenced(0), 0);
    }
}
