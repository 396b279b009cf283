//! Per-connection reliability layer.
//!
//! The core drives one [`ReliabilityLayer`] per registry slot and never looks
//! inside its datagrams. [`ReliableLink`] is the implementation the peer uses.

mod cipher;
mod frame;
mod link;
mod ordering;
mod tracking;

use serde::{Deserialize, Serialize};

use super::address::PeerAddress;
use super::clock::TimeMs;
use super::security::SessionKey;
use super::stats::LinkStatistics;

pub use cipher::DatagramCipher;
pub use frame::{
    AckInfo, Datagram, DatagramFlags, LinkError, MessageFrame, SplitHeader, PLAIN_TAG, SEALED_TAG,
};
pub use link::{DEFAULT_TIMEOUT_MS, ReliableLink};
pub use tracking::{AckTracker, ReceiveTracker, sequence_greater_than};

/// Independent sequencing spaces per connection.
pub const ORDERING_CHANNELS: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    #[default]
    ReliableOrdered = 3,
    ReliableSequenced = 4,
}

impl Reliability {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::Reliable | Self::ReliableOrdered | Self::ReliableSequenced
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Self::ReliableOrdered)
    }

    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }

    pub fn uses_channel(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    /// Split messages must all arrive, so unreliable types are promoted.
    pub fn upgraded_for_split(self) -> Self {
        match self {
            Self::Unreliable => Self::Reliable,
            Self::UnreliableSequenced => Self::ReliableSequenced,
            other => other,
        }
    }
}

impl TryFrom<u8> for Reliability {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Unreliable,
            1 => Self::UnreliableSequenced,
            2 => Self::Reliable,
            3 => Self::ReliableOrdered,
            4 => Self::ReliableSequenced,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Immediate = 0,
    #[default]
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Where a reliability layer hands finished datagrams.
pub trait DatagramSink {
    fn send_datagram(&mut self, datagram: &[u8], to: PeerAddress);
}

impl DatagramSink for Vec<(Vec<u8>, PeerAddress)> {
    fn send_datagram(&mut self, datagram: &[u8], to: PeerAddress) {
        self.push((datagram.to_vec(), to));
    }
}

/// Framing, acknowledgement, ordering and encryption for one connection.
pub trait ReliabilityLayer: Send {
    /// Queues `data`, taking ownership of it. Returns `false` if it can never be sent.
    fn send(
        &mut self,
        data: Vec<u8>,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        now: TimeMs,
    ) -> bool;

    /// Emits due sends, resends and acks.
    fn update(&mut self, sink: &mut dyn DatagramSink, peer: PeerAddress, mtu: usize, now: TimeMs);

    /// Dequeues one reassembled message, in order where the reliability type demands it.
    fn receive(&mut self) -> Option<Vec<u8>>;

    /// Returns `false` when the datagram fails framing or authentication, or
    /// when plaintext frames would push inbound state past the link's limits.
    fn handle_incoming_datagram(&mut self, datagram: &[u8], now: TimeMs) -> bool;

    fn is_dead_connection(&self) -> bool;

    fn is_data_waiting(&self) -> bool;

    fn are_acks_waiting(&self) -> bool;

    fn set_encryption_key(&mut self, key: Option<SessionKey>);

    fn is_encrypted(&self) -> bool;

    fn set_timeout_time(&mut self, timeout_ms: u64);

    fn statistics(&self) -> LinkStatistics;
}
