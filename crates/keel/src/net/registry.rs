use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::address::PeerAddress;
use super::clock::TimeMs;
use super::ping::PingTracker;
use super::reliability::{Priority, Reliability, ReliabilityLayer};
use super::security::SessionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectMode {
    UnverifiedSender,
    HandlingConnectionRequest,
    RequestedConnection,
    SetEncryptionOnMultiple16BytePacket,
    Connected,
    DisconnectAsap,
    DisconnectAsapSilently,
    DisconnectOnNoAck,
}

impl ConnectMode {
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            Self::UnverifiedSender
                | Self::HandlingConnectionRequest
                | Self::RequestedConnection
                | Self::SetEncryptionOnMultiple16BytePacket
        )
    }

    pub fn is_disconnecting(self) -> bool {
        matches!(
            self,
            Self::DisconnectAsap | Self::DisconnectAsapSilently | Self::DisconnectOnNoAck
        )
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// The fixed transition graph. A disconnecting slot never comes back; it
    /// has to be released first.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectMode::*;
        matches!(
            (self, next),
            (UnverifiedSender, HandlingConnectionRequest)
                | (UnverifiedSender, DisconnectAsapSilently)
                | (HandlingConnectionRequest, SetEncryptionOnMultiple16BytePacket)
                | (HandlingConnectionRequest, Connected)
                | (RequestedConnection, Connected)
                | (RequestedConnection, HandlingConnectionRequest)
                | (SetEncryptionOnMultiple16BytePacket, Connected)
                | (Connected, DisconnectAsap)
                | (Connected, DisconnectAsapSilently)
                | (Connected, DisconnectOnNoAck)
        ) || (self.is_handshaking() && next == DisconnectAsapSilently)
    }
}

/// Everything the network thread knows about one remote peer.
pub struct RemoteSystem {
    pub address: PeerAddress,
    pub mode: ConnectMode,
    pub we_initiated: bool,
    /// Our token when we dialed, used to break simultaneous-dial ties.
    pub dial_token: u64,
    pub session_token: u64,
    pub session_key: Option<SessionKey>,
    /// Literal identifier to the index the remote announced for it.
    pub rpc_indices: HashMap<String, u16>,
    pub ping: PingTracker,
    pub handshake_started_at: TimeMs,
    pub connected_at: Option<TimeMs>,
    pub last_reliable_send_at: TimeMs,
    pub static_data: Vec<u8>,
    /// Our address as the remote reported seeing it.
    pub external_address: PeerAddress,
    /// Application messages that arrived while the handshake was finishing.
    pub pending_messages: Vec<Vec<u8>>,
    pub link: Box<dyn ReliabilityLayer>,
}

impl RemoteSystem {
    fn new(
        address: PeerAddress,
        mode: ConnectMode,
        link: Box<dyn ReliabilityLayer>,
        now: TimeMs,
    ) -> Self {
        Self {
            address,
            mode,
            we_initiated: mode == ConnectMode::RequestedConnection,
            dial_token: 0,
            session_token: 0,
            session_key: None,
            rpc_indices: HashMap::new(),
            ping: PingTracker::new(),
            handshake_started_at: now,
            connected_at: None,
            last_reliable_send_at: now,
            static_data: Vec::new(),
            external_address: PeerAddress::UNASSIGNED,
            pending_messages: Vec::new(),
            link,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.mode.is_connected()
    }

    /// Queues `data` on the link, stamping the keep-alive clock for reliable sends.
    pub fn send(
        &mut self,
        data: Vec<u8>,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        now: TimeMs,
    ) -> bool {
        if reliability.is_reliable() {
            self.last_reliable_send_at = now;
        }
        self.link.send(data, priority, reliability, channel, now)
    }
}

impl std::fmt::Debug for RemoteSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSystem")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("we_initiated", &self.we_initiated)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity slot table plus address lookup. Owned by the network thread.
#[derive(Debug)]
pub struct ConnectionRegistry {
    slots: Vec<Option<RemoteSystem>>,
    by_address: HashMap<PeerAddress, usize>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            by_address: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn find_slot(&self, addr: PeerAddress) -> Option<usize> {
        self.by_address.get(&addr).copied()
    }

    /// Fails when the table is full or `addr` already holds a slot.
    pub fn allocate_slot(
        &mut self,
        addr: PeerAddress,
        mode: ConnectMode,
        link: Box<dyn ReliabilityLayer>,
        now: TimeMs,
    ) -> Option<usize> {
        if self.by_address.contains_key(&addr) {
            return None;
        }
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(RemoteSystem::new(addr, mode, link, now));
        self.by_address.insert(addr, index);
        log::debug!("allocated slot {} for {} as {:?}", index, addr, mode);
        Some(index)
    }

    pub fn release_slot(&mut self, index: usize) -> Option<RemoteSystem> {
        let remote = self.slots.get_mut(index)?.take()?;
        self.by_address.remove(&remote.address);
        log::debug!("released slot {} ({})", index, remote.address);
        Some(remote)
    }

    /// Moves a slot along the transition graph. Illegal moves are refused.
    pub fn set_mode(&mut self, index: usize, next: ConnectMode) -> bool {
        let Some(remote) = self.get_mut(index) else {
            return false;
        };
        if !remote.mode.can_transition_to(next) {
            log::warn!(
                "refusing transition {:?} -> {:?} for {}",
                remote.mode,
                next,
                remote.address
            );
            return false;
        }
        log::debug!("{}: {:?} -> {:?}", remote.address, remote.mode, next);
        remote.mode = next;
        true
    }

    pub fn get(&self, index: usize) -> Option<&RemoteSystem> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RemoteSystem> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn by_address(&self, addr: PeerAddress) -> Option<&RemoteSystem> {
        self.find_slot(addr).and_then(|index| self.get(index))
    }

    pub fn by_address_mut(&mut self, addr: PeerAddress) -> Option<&mut RemoteSystem> {
        let index = self.find_slot(addr)?;
        self.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &RemoteSystem)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (i, r)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut RemoteSystem)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|r| (i, r)))
    }

    pub fn occupied(&self) -> Vec<usize> {
        self.iter().map(|(i, _)| i).collect()
    }

    /// Slots the remote opened, which count against the incoming limit.
    pub fn incoming_count(&self) -> usize {
        self.iter().filter(|(_, r)| !r.we_initiated).count()
    }

    pub fn connected_count(&self) -> usize {
        self.iter().filter(|(_, r)| r.is_connected()).count()
    }
}
