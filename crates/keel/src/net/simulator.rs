use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use super::address::PeerAddress;
use super::stats::PacketLossSimulation;

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Instant,
    /// Tie-breaker so equal release times keep send order.
    order: u64,
    datagram: Vec<u8>,
    addr: PeerAddress,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time && self.order == other.order
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed for a min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Drops and delays outgoing datagrams to imitate a bad network.
#[derive(Debug, Default)]
pub struct NetworkSimulator {
    global: Option<PacketLossSimulation>,
    configs: HashMap<PeerAddress, PacketLossSimulation>,
    outbound_queue: BinaryHeap<DelayedDatagram>,
    next_order: u64,
    dropped: u64,
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies to every destination without its own override.
    pub fn set_global(&mut self, config: Option<PacketLossSimulation>) {
        self.global = config.filter(|c| c.enabled);
    }

    pub fn set_config(&mut self, addr: PeerAddress, config: PacketLossSimulation) {
        if config.enabled {
            self.configs.insert(addr, config);
        } else {
            self.configs.remove(&addr);
        }
    }

    pub fn get_config(&self, addr: &PeerAddress) -> Option<&PacketLossSimulation> {
        self.configs.get(addr).or(self.global.as_ref())
    }

    pub fn is_active(&self) -> bool {
        self.global.is_some() || !self.configs.is_empty() || !self.outbound_queue.is_empty()
    }

    pub fn should_drop(&self, addr: &PeerAddress) -> bool {
        self.get_config(addr).is_some_and(|sim| sim.should_drop())
    }

    pub fn delay_for(&self, addr: &PeerAddress) -> Duration {
        self.get_config(addr).map_or(Duration::ZERO, |sim| {
            Duration::from_millis(sim.delay_ms() as u64)
        })
    }

    /// Returns `false` if the datagram was dropped.
    pub fn enqueue_outbound(&mut self, datagram: &[u8], addr: PeerAddress) -> bool {
        if self.should_drop(&addr) {
            self.dropped += 1;
            return false;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.outbound_queue.push(DelayedDatagram {
            release_time: Instant::now() + self.delay_for(&addr),
            order,
            datagram: datagram.to_vec(),
            addr,
        });
        true
    }

    pub fn take_outbound(&mut self) -> Vec<(Vec<u8>, PeerAddress)> {
        let mut datagrams = Vec::new();
        let now = Instant::now();
        while self
            .outbound_queue
            .peek()
            .is_some_and(|delayed| delayed.release_time <= now)
        {
            if let Some(delayed) = self.outbound_queue.pop() {
                datagrams.push((delayed.datagram, delayed.addr));
            }
        }
        datagrams
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
