//! Structures shared between application threads and the network thread.
//!
//! Application threads only ever push commands, push dial intents, or read
//! the published connection view. Registry state itself never leaves the
//! network thread.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};

use super::address::PeerAddress;
use super::bans::BanList;
use super::clock::{Clock, TimeMs};
use super::error::RpcError;
use super::packet::PacketPool;
use super::registry::ConnectMode;
use super::reliability::{Priority, Reliability};
use super::rpc::ObjectId;
use super::stats::{LinkStatistics, PacketLossSimulation};

pub const DIAL_RETRY_INTERVAL_MS: u64 = 1_000;
pub const DIAL_ATTEMPTS: u32 = 6;

/// Who a send or RPC goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Single(PeerAddress),
    /// Every connected peer, optionally skipping one.
    Broadcast { except: Option<PeerAddress> },
}

impl Target {
    pub fn broadcast() -> Self {
        Self::Broadcast { except: None }
    }

    pub fn includes(&self, addr: PeerAddress) -> bool {
        match self {
            Self::Single(target) => *target == addr,
            Self::Broadcast { except } => *except != Some(addr),
        }
    }
}

impl From<PeerAddress> for Target {
    fn from(addr: PeerAddress) -> Self {
        Self::Single(addr)
    }
}

pub type CallResult = Result<Vec<u8>, RpcError>;

#[derive(Debug)]
pub struct RpcCommand {
    pub identifier: String,
    pub args: Vec<u8>,
    pub object: Option<ObjectId>,
    /// Present for blocking calls; the network thread completes it.
    pub reply: Option<(u32, Sender<CallResult>)>,
}

/// Work queued by application threads. Payloads are owned copies.
#[derive(Debug)]
pub enum Command {
    Send {
        payload: Vec<u8>,
        target: Target,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
    },
    Close {
        target: PeerAddress,
        notify: bool,
    },
    CloseAll,
    Ping(PeerAddress),
    PingUnconnected {
        target: PeerAddress,
        only_if_accepting: bool,
    },
    Rpc {
        call: RpcCommand,
        target: Target,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
    },
    SetSimulation(Option<PacketLossSimulation>),
    SetTimeout(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedConnection {
    pub target: PeerAddress,
    pub next_retry_at: TimeMs,
    pub retries_made: u32,
    pub password: Vec<u8>,
}

/// Outstanding dials. Retried by the network thread every second.
#[derive(Debug, Default)]
pub struct RequestedConnections {
    queue: Mutex<VecDeque<RequestedConnection>>,
}

impl RequestedConnections {
    /// Returns `false` if `target` is already being dialed.
    pub fn push(&self, target: PeerAddress, password: Vec<u8>, now: TimeMs) -> bool {
        let mut queue = self.queue.lock();
        if queue.iter().any(|r| r.target == target) {
            return false;
        }
        queue.push_back(RequestedConnection {
            target,
            next_retry_at: now,
            retries_made: 0,
            password,
        });
        true
    }

    pub fn contains(&self, target: PeerAddress) -> bool {
        self.queue.lock().iter().any(|r| r.target == target)
    }

    /// Removes the entry for `target`, leaving the others in order.
    pub fn take(&self, target: PeerAddress) -> Option<RequestedConnection> {
        let mut queue = self.queue.lock();
        let position = queue.iter().position(|r| r.target == target)?;
        queue.remove(position)
    }

    /// Returns the targets due for another open request, and removes the
    /// entries that have used up every attempt.
    pub fn poll(&self, now: TimeMs) -> (Vec<PeerAddress>, Vec<RequestedConnection>) {
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        queue.retain_mut(|request| {
            if now < request.next_retry_at {
                return true;
            }
            if request.retries_made >= DIAL_ATTEMPTS {
                exhausted.push(request.clone());
                return false;
            }
            request.retries_made += 1;
            request.next_retry_at = now + DIAL_RETRY_INTERVAL_MS;
            due.push(request.target);
            true
        });

        (due, exhausted)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

/// Snapshot of one registry slot, republished every network tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionView {
    pub address: PeerAddress,
    pub slot_index: usize,
    pub mode: ConnectMode,
    pub we_initiated: bool,
    pub connected_at: Option<TimeMs>,
    pub external_address: PeerAddress,
    pub average_ping: Option<u32>,
    pub lowest_ping: Option<u32>,
    pub last_ping: Option<u32>,
    pub clock_differential: i64,
    pub static_data: Vec<u8>,
    pub statistics: LinkStatistics,
}

impl ConnectionView {
    pub fn is_connected(&self) -> bool {
        self.mode.is_connected()
    }
}

/// State both sides of the thread boundary touch.
#[derive(Debug)]
pub struct Shared {
    pub running: AtomicBool,
    pub clock: Clock,
    pub max_incoming: AtomicUsize,
    pub incoming_password: RwLock<Vec<u8>>,
    pub static_data: RwLock<Vec<u8>>,
    pub offline_ping_response: RwLock<Vec<u8>>,
    pub bans: Mutex<BanList>,
    pub requested: RequestedConnections,
    pub view: RwLock<BTreeMap<PeerAddress, ConnectionView>>,
    pub pool: Mutex<PacketPool>,
}

impl Shared {
    pub fn new(clock: Clock) -> Self {
        Self {
            running: AtomicBool::new(false),
            clock,
            max_incoming: AtomicUsize::new(0),
            incoming_password: RwLock::new(Vec::new()),
            static_data: RwLock::new(Vec::new()),
            offline_ping_response: RwLock::new(Vec::new()),
            bans: Mutex::new(BanList::new()),
            requested: RequestedConnections::default(),
            view: RwLock::new(BTreeMap::new()),
            pool: Mutex::new(PacketPool::new()),
        }
    }

    pub fn is_banned(&self, addr: PeerAddress, now: TimeMs) -> bool {
        let mut bans = self.bans.lock();
        !bans.is_empty() && bans.is_banned(&addr.ip_string(), now)
    }

    pub fn connection(&self, addr: PeerAddress) -> Option<ConnectionView> {
        self.view.read().get(&addr).cloned()
    }

    pub fn is_connected(&self, addr: PeerAddress) -> bool {
        self.view.read().get(&addr).is_some_and(ConnectionView::is_connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new(0x7F00_0001, port)
    }

    #[test]
    fn dial_retries_then_exhausts() {
        let requested = RequestedConnections::default();
        assert!(requested.push(addr(1), b"pw".to_vec(), 0));
        assert!(!requested.push(addr(1), Vec::new(), 0));

        let mut sent = 0;
        let mut now = 0;
        loop {
            let (due, exhausted) = requested.poll(now);
            sent += due.len();
            if !exhausted.is_empty() {
                assert_eq!(exhausted[0].password, b"pw");
                break;
            }
            now += DIAL_RETRY_INTERVAL_MS;
        }
        assert_eq!(sent, DIAL_ATTEMPTS as usize);
        assert_eq!(now, DIAL_ATTEMPTS as u64 * DIAL_RETRY_INTERVAL_MS);
        assert!(requested.is_empty());
    }

    #[test]
    fn take_preserves_order_of_others() {
        let requested = RequestedConnections::default();
        for port in 1..=3 {
            requested.push(addr(port), Vec::new(), 0);
        }
        assert_eq!(requested.take(addr(2)).map(|r| r.target), Some(addr(2)));
        assert!(requested.take(addr(2)).is_none());

        let (due, _) = requested.poll(0);
        assert_eq!(due, vec![addr(1), addr(3)]);
    }

    #[test]
    fn not_due_until_interval() {
        let requested = RequestedConnections::default();
        requested.push(addr(1), Vec::new(), 0);
        assert_eq!(requested.poll(0).0.len(), 1);
        assert!(requested.poll(DIAL_RETRY_INTERVAL_MS - 1).0.is_empty());
        assert_eq!(requested.poll(DIAL_RETRY_INTERVAL_MS).0.len(), 1);
    }

    #[test]
    fn broadcast_target_exclusion() {
        let target = Target::Broadcast {
            except: Some(addr(1)),
        };
        assert!(!target.includes(addr(1)));
        assert!(target.includes(addr(2)));
        assert!(Target::from(addr(3)).includes(addr(3)));
    }
}
