use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};

use super::address::PeerAddress;
use super::clock::Clock;
use super::config::PeerConfig;
use super::error::{PeerError, RpcError};
use super::packet::Packet;
use super::protocol::{MAXIMUM_MTU, MINIMUM_MTU, MessageId};
use super::queues::{Command, ConnectionView, RpcCommand, Shared, Target};
use super::registry::ConnectMode;
use super::reliability::{Priority, Reliability};
use super::rpc::{
    CallOptions, MAX_IDENTIFIER_LEN, ObjectArena, ObjectId, RpcCall, RpcContext, RpcHandler,
    RpcIdentifier, RpcInvocation, RpcRegistry, encode_mapping, encode_reply,
};
use super::security::{self, KEY_LEN, SecurityConfig};
use super::stats::{LinkStatistics, PacketLossSimulation};
use super::transport::UdpTransport;
use super::update::NetworkLoop;

/// How often a blocking call wakes to service inbound traffic.
const BLOCKING_POLL: Duration = Duration::from_millis(10);
/// Unreliable blocking calls wait this long when no round trip is known yet.
const DEFAULT_UNRELIABLE_CALL_MS: u64 = 1_000;
const MIN_UNRELIABLE_CALL_MS: u64 = 100;
const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

struct Runtime {
    commands: Sender<Command>,
    inbound: Receiver<Packet>,
    thread: Option<JoinHandle<()>>,
    local_address: PeerAddress,
    max_connections: usize,
}

/// One endpoint: a UDP socket, a connection table and a network thread.
///
/// Every method takes `&self`; a `Peer` can be shared between application
/// threads behind an `Arc`. Configuration marked inactive-only is rejected
/// once [`initialize`](Self::initialize) has started the network thread.
pub struct Peer {
    shared: Arc<Shared>,
    config: Mutex<PeerConfig>,
    rpc: RwLock<RpcRegistry>,
    objects: Mutex<ObjectArena>,
    runtime: Mutex<Option<Runtime>>,
    /// Packets set aside while a blocking call waited.
    held: Mutex<VecDeque<Packet>>,
    next_call_id: AtomicU32,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let shared = Shared::new(Clock::new());
        shared
            .max_incoming
            .store(config.max_incoming_connections, Ordering::Relaxed);
        *shared.incoming_password.write() = config.incoming_password.clone();
        *shared.static_data.write() = config.static_data.clone();
        *shared.offline_ping_response.write() = config.offline_ping_response.clone();

        Self {
            shared: Arc::new(shared),
            config: Mutex::new(config),
            rpc: RwLock::new(RpcRegistry::new()),
            objects: Mutex::new(ObjectArena::new()),
            runtime: Mutex::new(None),
            held: Mutex::new(VecDeque::new()),
            next_call_id: AtomicU32::new(1),
        }
    }

    /// Binds `listen_port` (0 for any) and starts the network thread, which
    /// sleeps `thread_sleep_ms` between ticks.
    pub fn initialize(
        &self,
        max_connections: usize,
        listen_port: u16,
        thread_sleep_ms: u64,
    ) -> Result<(), PeerError> {
        if max_connections == 0 {
            return Err(PeerError::InvalidMaxConnections);
        }
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(PeerError::AlreadyActive);
        }

        let transport = UdpTransport::bind(listen_port)?;
        let local_address = transport.local_address();
        let (commands, command_rx) = unbounded();
        let (inbound_tx, inbound) = unbounded();

        let config = self.config.lock().clone();
        let network = NetworkLoop::new(
            self.shared.clone(),
            transport,
            max_connections,
            command_rx,
            inbound_tx,
            &config,
            Duration::from_millis(thread_sleep_ms),
        );

        self.shared.running.store(true, Ordering::Release);
        let thread = std::thread::Builder::new()
            .name("keel-network".into())
            .spawn(move || network.run())
            .inspect_err(|_| self.shared.running.store(false, Ordering::Release))?;

        *runtime = Some(Runtime {
            commands,
            inbound,
            thread: Some(thread),
            local_address,
            max_connections,
        });
        log::info!(
            "peer listening on {} ({} slots)",
            local_address,
            max_connections
        );
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Queues a dial. The outcome arrives later as a packet event.
    pub fn connect(&self, host: &str, port: u16, password: &[u8]) -> Result<(), PeerError> {
        let max_connections = self
            .runtime
            .lock()
            .as_ref()
            .map(|runtime| runtime.max_connections)
            .ok_or(PeerError::NotActive)?;
        let target = PeerAddress::resolve(host, port)
            .ok_or_else(|| PeerError::Resolve(format!("{}:{}", host, port)))?;

        let in_use = {
            let view = self.shared.view.read();
            if view.contains_key(&target) {
                return Err(PeerError::AlreadyConnected(target));
            }
            view.len()
        };
        if in_use + self.shared.requested.len() >= max_connections {
            return Err(PeerError::NoFreeSlot);
        }

        let now = self.shared.clock.now_ms();
        if !self.shared.requested.push(target, password.to_vec(), now) {
            return Err(PeerError::AlreadyConnected(target));
        }
        log::debug!("dialing {}", target);
        Ok(())
    }

    /// Queues `data` for every connected peer `target` covers. Returns
    /// `false` when there is no such peer.
    pub fn send(
        &self,
        data: &[u8],
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        target: impl Into<Target>,
    ) -> bool {
        let target = target.into();
        if data.is_empty() || !self.has_connected_target(target) {
            return false;
        }
        let payload = self.shared.pool.lock().copy_of(data);
        self.command(Command::Send {
            payload,
            target,
            priority,
            reliability,
            channel,
        })
    }

    /// Next message or event. RPC calls are dispatched here, on the calling
    /// thread, and never returned.
    pub fn receive(&self) -> Option<Packet> {
        if let Some(packet) = self.held.lock().pop_front() {
            return Some(packet);
        }
        let inbound = self.inbound()?;
        for packet in inbound.try_iter() {
            if is_rpc(&packet) {
                self.dispatch_rpc(packet);
                continue;
            }
            return Some(packet);
        }
        None
    }

    /// Returns a consumed packet's buffer to the send pool.
    pub fn deallocate_packet(&self, packet: Packet) {
        self.shared.pool.lock().recycle(packet.data);
    }

    /// Closes the connection to `target`. With `notify` the remote is told
    /// and sees a disconnection notification; without it, it times out.
    pub fn close_connection(&self, target: PeerAddress, notify: bool) -> bool {
        self.command(Command::Close { target, notify })
    }

    pub fn ping(&self, target: PeerAddress) -> bool {
        self.shared.is_connected(target) && self.command(Command::Ping(target))
    }

    /// Pings a host we are not connected to. A reply arrives as a `Pong`
    /// packet: `[Pong][u32 rtt][response]`.
    pub fn ping_unconnected(&self, host: &str, port: u16, only_if_accepting: bool) -> bool {
        let Some(target) = PeerAddress::resolve(host, port) else {
            return false;
        };
        self.command(Command::PingUnconnected {
            target,
            only_if_accepting,
        })
    }

    pub fn register_rpc(
        &self,
        identifier: &str,
        handler: RpcHandler,
        context: Option<RpcContext>,
    ) -> bool {
        if self.is_active() {
            log::warn!("cannot register rpc {} while active", identifier);
            return false;
        }
        self.rpc.write().register(identifier, handler, context)
    }

    pub fn unregister_rpc(&self, identifier: &str) -> bool {
        if self.is_active() {
            return false;
        }
        self.rpc.write().unregister(identifier)
    }

    /// Fire-and-forget call.
    pub fn call_rpc(&self, identifier: &str, args: &[u8], options: CallOptions) -> bool {
        if !valid_identifier(identifier) || !self.has_connected_target(options.target) {
            return false;
        }
        self.command(Command::Rpc {
            call: RpcCommand {
                identifier: identifier.to_owned(),
                args: args.to_vec(),
                object: options.object,
                reply: None,
            },
            target: options.target,
            priority: options.priority,
            reliability: options.reliability,
            channel: options.channel,
        })
    }

    /// Calls a single peer and waits for whatever its handler wrote back.
    ///
    /// Reliable calls return only on a reply or a disconnect. Unreliable calls
    /// also give up after three round trips. Inbound RPCs keep being served
    /// while waiting; other packets are held for [`receive`](Self::receive).
    pub fn call_rpc_blocking(
        &self,
        identifier: &str,
        args: &[u8],
        options: CallOptions,
    ) -> Result<Vec<u8>, RpcError> {
        let Target::Single(target) = options.target else {
            return Err(RpcError::InvalidTarget);
        };
        if !valid_identifier(identifier) {
            return Err(RpcError::InvalidTarget);
        }
        let Some(connection) = self.shared.connection(target).filter(|c| c.is_connected()) else {
            return Err(RpcError::NotConnected(target));
        };

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = bounded(1);
        let sent = self.command(Command::Rpc {
            call: RpcCommand {
                identifier: identifier.to_owned(),
                args: args.to_vec(),
                object: options.object,
                reply: Some((call_id, reply_tx)),
            },
            target: options.target,
            priority: options.priority,
            reliability: options.reliability,
            channel: options.channel,
        });
        if !sent {
            return Err(RpcError::ShutDown);
        }

        let deadline = (!options.reliability.is_reliable()).then(|| {
            let wait_ms = connection
                .average_ping
                .map_or(DEFAULT_UNRELIABLE_CALL_MS, |rtt| {
                    (rtt as u64 * 3).max(MIN_UNRELIABLE_CALL_MS)
                });
            Instant::now() + Duration::from_millis(wait_ms)
        });

        loop {
            match reply_rx.recv_timeout(BLOCKING_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(RpcError::ShutDown),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.service_while_blocked();
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                log::debug!("blocking rpc {} to {} timed out", identifier, target);
                return Err(RpcError::TimedOut);
            }
        }
    }

    pub fn insert_object<T: std::any::Any + Send>(&self, object: T) -> ObjectId {
        self.objects.lock().insert(object)
    }

    pub fn remove_object(&self, id: ObjectId) -> Option<Box<dyn std::any::Any + Send>> {
        self.objects.lock().remove(id)
    }

    /// Runs `f` on an arena object of type `T`.
    pub fn with_object<T, R>(&self, id: ObjectId, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: std::any::Any + Send,
    {
        let object = self.objects.lock().get(id)?;
        let mut guard = object.lock();
        guard.downcast_mut::<T>().map(f)
    }

    /// Bans an IP pattern (`"10.0.0.*"` style). `duration_ms` of zero is permanent.
    pub fn add_ban(&self, pattern: &str, duration_ms: u64) {
        let now = self.shared.clock.now_ms();
        self.shared.bans.lock().ban(pattern, duration_ms, now);
    }

    pub fn remove_ban(&self, pattern: &str) -> bool {
        self.shared.bans.lock().unban(pattern)
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        let now = self.shared.clock.now_ms();
        self.shared.bans.lock().is_banned(ip, now)
    }

    pub fn clear_bans(&self) {
        self.shared.bans.lock().clear();
    }

    pub fn average_ping(&self, target: PeerAddress) -> Option<u32> {
        self.shared.connection(target)?.average_ping
    }

    pub fn lowest_ping(&self, target: PeerAddress) -> Option<u32> {
        self.shared.connection(target)?.lowest_ping
    }

    pub fn last_ping(&self, target: PeerAddress) -> Option<u32> {
        self.shared.connection(target)?.last_ping
    }

    /// Only while inactive, and only within the supported range.
    pub fn set_mtu(&self, mtu: usize) -> bool {
        if self.is_active() || !(MINIMUM_MTU..=MAXIMUM_MTU).contains(&mtu) {
            return false;
        }
        self.config.lock().mtu = mtu;
        true
    }

    pub fn mtu(&self) -> usize {
        self.config.lock().mtu
    }

    pub fn statistics(&self, target: PeerAddress) -> Option<LinkStatistics> {
        self.shared.connection(target).map(|c| c.statistics)
    }

    pub fn set_incoming_password(&self, password: &[u8]) {
        *self.shared.incoming_password.write() = password.to_vec();
        self.config.lock().incoming_password = password.to_vec();
    }

    pub fn set_maximum_incoming_connections(&self, max: usize) {
        self.shared.max_incoming.store(max, Ordering::Relaxed);
        self.config.lock().max_incoming_connections = max;
    }

    /// Block pushed to every peer as it connects.
    pub fn set_static_data(&self, data: &[u8]) {
        *self.shared.static_data.write() = data.to_vec();
        self.config.lock().static_data = data.to_vec();
    }

    pub fn remote_static_data(&self, target: PeerAddress) -> Option<Vec<u8>> {
        self.shared.connection(target).map(|c| c.static_data)
    }

    pub fn set_offline_ping_response(&self, data: &[u8]) {
        *self.shared.offline_ping_response.write() = data.to_vec();
        self.config.lock().offline_ping_response = data.to_vec();
    }

    /// Enables secured handshakes for incoming connections and, with
    /// `expected_server_key`, pins the key outgoing connections must see.
    pub fn initialize_security(
        &self,
        private_key: Option<[u8; KEY_LEN]>,
        expected_server_key: Option<[u8; KEY_LEN]>,
    ) -> bool {
        if self.is_active() {
            return false;
        }
        self.config.lock().security = Some(SecurityConfig {
            private_key: Some(private_key.unwrap_or_else(security::generate_private_key)),
            expected_server_key,
        });
        true
    }

    pub fn security_public_key(&self) -> Option<[u8; KEY_LEN]> {
        let config = self.config.lock();
        let private_key = config.security.as_ref()?.private_key?;
        Some(security::public_key_for(&private_key))
    }

    /// Drops and delays our outgoing datagrams. `None` turns it off.
    pub fn apply_network_simulator(&self, simulation: Option<PacketLossSimulation>) {
        self.config.lock().simulation = simulation.clone();
        self.command(Command::SetSimulation(simulation));
    }

    pub fn set_timeout_time(&self, timeout_ms: u64) {
        self.config.lock().timeout_ms = timeout_ms;
        self.command(Command::SetTimeout(timeout_ms));
    }

    /// Every occupied slot, handshaking and disconnecting ones included.
    pub fn connections(&self) -> Vec<ConnectionView> {
        self.shared.view.read().values().cloned().collect()
    }

    pub fn number_of_connections(&self) -> usize {
        self.shared
            .view
            .read()
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn connection_state(&self, target: PeerAddress) -> Option<ConnectMode> {
        self.shared.connection(target).map(|c| c.mode)
    }

    /// Our address as `target` reported seeing it.
    pub fn external_address(&self, target: PeerAddress) -> Option<PeerAddress> {
        self.shared
            .connection(target)
            .map(|c| c.external_address)
            .filter(|addr| !addr.is_unassigned())
    }

    pub fn clock_differential(&self, target: PeerAddress) -> Option<i64> {
        self.shared.connection(target).map(|c| c.clock_differential)
    }

    pub fn local_address(&self) -> Option<PeerAddress> {
        self.runtime.lock().as_ref().map(|r| r.local_address)
    }

    /// Closes every connection, waits up to `block_ms` for them to drain,
    /// then stops the network thread.
    pub fn shutdown(&self, block_ms: u64) {
        let Some(mut runtime) = self.runtime.lock().take() else {
            return;
        };

        if block_ms > 0 && runtime.commands.send(Command::CloseAll).is_ok() {
            let deadline = Instant::now() + Duration::from_millis(block_ms);
            while Instant::now() < deadline && !self.shared.view.read().is_empty() {
                std::thread::sleep(SHUTDOWN_POLL);
            }
        }

        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = runtime.thread.take() {
            if thread.join().is_err() {
                log::warn!("network thread panicked");
            }
        }
        self.held.lock().clear();
        log::info!("peer on {} shut down", runtime.local_address);
    }

    fn command(&self, command: Command) -> bool {
        match self.runtime.lock().as_ref() {
            Some(runtime) => runtime.commands.send(command).is_ok(),
            None => false,
        }
    }

    fn inbound(&self) -> Option<Receiver<Packet>> {
        self.runtime.lock().as_ref().map(|r| r.inbound.clone())
    }

    fn has_connected_target(&self, target: Target) -> bool {
        match target {
            Target::Single(addr) => self.shared.is_connected(addr),
            Target::Broadcast { .. } => self
                .shared
                .view
                .read()
                .values()
                .any(|c| c.is_connected() && target.includes(c.address)),
        }
    }

    /// Serves inbound RPCs and sets every other packet aside.
    fn service_while_blocked(&self) {
        let Some(inbound) = self.inbound() else {
            return;
        };
        for packet in inbound.try_iter() {
            if is_rpc(&packet) {
                self.dispatch_rpc(packet);
            } else {
                self.held.lock().push_back(packet);
            }
        }
    }

    fn dispatch_rpc(&self, packet: Packet) {
        let sender = packet.sender;
        let call = match RpcCall::decode(&packet.data) {
            Ok(call) => call,
            Err(e) => {
                log::debug!("malformed rpc from {}: {}", sender, e);
                return;
            }
        };
        self.deallocate_packet(packet);

        let resolved = self
            .rpc
            .read()
            .resolve(&call.identifier)
            .map(|(index, registration)| (index, registration.clone()));
        let Some((index, registration)) = resolved else {
            log::debug!("unregistered rpc {:?} from {}", call.identifier, sender);
            return;
        };

        if let RpcIdentifier::Name(name) = &call.identifier {
            match encode_mapping(index, name) {
                Ok(mapping) => {
                    self.command(Command::Send {
                        payload: mapping,
                        target: Target::Single(sender),
                        priority: Priority::High,
                        reliability: Reliability::ReliableOrdered,
                        channel: 0,
                    });
                }
                Err(e) => log::debug!("could not announce rpc {}: {}", name, e),
            }
        }

        let RpcCall {
            object,
            call_id,
            args,
            ..
        } = call;
        let mut invocation = RpcInvocation {
            sender,
            identifier: registration.identifier.clone(),
            args,
            object,
            reply: Vec::new(),
            context: registration.context.clone(),
        };

        let handled = match (&registration.handler, object) {
            (RpcHandler::Static(handler), None) => {
                handler(&mut invocation);
                true
            }
            (RpcHandler::Member(handler), Some(id)) => {
                // the arena lock is released before the handler runs
                let object = self.objects.lock().get(id);
                match object {
                    Some(object) => {
                        let mut guard = object.lock();
                        handler(&mut **guard, &mut invocation)
                    }
                    None => {
                        log::debug!("rpc {} from {}: no object {}", invocation.identifier, sender, id);
                        false
                    }
                }
            }
            _ => {
                log::debug!(
                    "rpc {} from {}: object binding does not match the handler",
                    invocation.identifier,
                    sender
                );
                false
            }
        };

        if let (true, Some(call_id)) = (handled, call_id) {
            self.command(Command::Send {
                payload: encode_reply(call_id, &invocation.reply),
                target: Target::Single(sender),
                priority: Priority::High,
                reliability: Reliability::ReliableOrdered,
                channel: 0,
            });
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown(0);
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("local_address", &self.local_address())
            .field("connections", &self.number_of_connections())
            .finish_non_exhaustive()
    }
}

fn is_rpc(packet: &Packet) -> bool {
    packet.data.first() == Some(&MessageId::Rpc.as_u8())
}

fn valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty() && identifier.len() <= MAX_IDENTIFIER_LEN
}
