//! The network thread.
//!
//! One [`NetworkLoop`] owns the socket, the registry and every reliability
//! layer. Each tick drains commands, retries dials, reads the socket, updates
//! every slot and republishes the connection view.

mod connected;
mod unconnected;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::address::PeerAddress;
use super::clock::TimeMs;
use super::config::PeerConfig;
use super::error::RpcError;
use super::packet::Packet;
use super::protocol::{
    MessageId, RELIABLE_DATAGRAM_FLOOR, encode_id, encode_open_connection_request, encode_ping,
};
use super::queues::{CallResult, Command, ConnectionView, RpcCommand, Shared, Target};
use super::registry::{ConnectMode, ConnectionRegistry};
use super::reliability::{Priority, Reliability, ReliabilityLayer, ReliableLink};
use super::rpc::{RpcCall, RpcIdentifier};
use super::security::{KEY_LEN, ServerSecurity};
use super::transport::UdpTransport;

/// How long an abusive unverified sender stays banned.
pub const ABUSE_BAN_MS: u64 = 1_000;

pub(crate) struct NetworkLoop {
    shared: Arc<Shared>,
    transport: UdpTransport,
    registry: ConnectionRegistry,
    commands: Receiver<Command>,
    inbound: Sender<Packet>,
    security: Option<ServerSecurity>,
    expected_server_key: Option<[u8; KEY_LEN]>,
    /// Blocking calls waiting for a reply, by call id.
    pending_calls: HashMap<u32, (PeerAddress, Sender<CallResult>)>,
    mtu: usize,
    timeout_ms: u64,
    handshake_timeout_ms: u64,
    sleep: Duration,
}

impl NetworkLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        mut transport: UdpTransport,
        max_connections: usize,
        commands: Receiver<Command>,
        inbound: Sender<Packet>,
        config: &PeerConfig,
        sleep: Duration,
    ) -> Self {
        let now = shared.clock.now_ms();
        let security = config
            .security
            .as_ref()
            .map(|security| ServerSecurity::new(security.private_key, now));
        let expected_server_key = config
            .security
            .as_ref()
            .and_then(|security| security.expected_server_key);
        transport.set_simulation(config.simulation.clone());

        Self {
            shared,
            transport,
            registry: ConnectionRegistry::new(max_connections),
            commands,
            inbound,
            security,
            expected_server_key,
            pending_calls: HashMap::new(),
            mtu: config.mtu,
            timeout_ms: config.timeout_ms,
            handshake_timeout_ms: config.handshake_timeout_ms,
            sleep,
        }
    }

    /// Ticks until the running flag drops. Pending blocking calls see a
    /// closed reply channel once this returns.
    pub(crate) fn run(mut self) {
        log::debug!("network thread started on {}", self.transport.local_address());

        while self.shared.running.load(Ordering::Acquire) {
            self.tick();
            std::thread::sleep(self.sleep);
        }

        self.shared.view.write().clear();
        self.shared.requested.clear();
        log::debug!(
            "network thread stopped ({} connections dropped)",
            self.registry.len()
        );
    }

    pub(crate) fn tick(&mut self) {
        let now = self.shared.clock.now_ms();

        if let Some(security) = &mut self.security {
            if security.cookies_mut().rotate_if_due(now) {
                log::trace!("rotated syn-cookie secret");
            }
        }

        self.process_commands(now);
        self.process_requested_connections(now);
        self.receive_datagrams(now);
        self.update_connections(now);
        self.transport.flush_delayed();
        self.publish_view();
    }

    fn process_commands(&mut self, now: TimeMs) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command, now);
        }
    }

    fn apply_command(&mut self, command: Command, now: TimeMs) {
        match command {
            Command::Send {
                payload,
                target,
                priority,
                reliability,
                channel,
            } => {
                let targets = self.connected_targets(target);
                let Some((&last, rest)) = targets.split_last() else {
                    log::trace!("dropping send to {:?}: no connected target", target);
                    return;
                };
                for &index in rest {
                    if let Some(remote) = self.registry.get_mut(index) {
                        remote.send(payload.clone(), priority, reliability, channel, now);
                    }
                }
                if let Some(remote) = self.registry.get_mut(last) {
                    remote.send(payload, priority, reliability, channel, now);
                }
            }
            Command::Close { target, notify } => self.close(target, notify, now),
            Command::CloseAll => {
                let addresses: Vec<PeerAddress> =
                    self.registry.iter().map(|(_, r)| r.address).collect();
                for address in addresses {
                    self.close(address, true, now);
                }
                self.shared.requested.clear();
            }
            Command::Ping(target) => {
                if let Some(remote) = self.registry.by_address_mut(target) {
                    if remote.is_connected() {
                        remote.send(
                            encode_ping(MessageId::ConnectedPing, now),
                            Priority::Immediate,
                            Reliability::Unreliable,
                            0,
                            now,
                        );
                        remote.ping.on_ping_sent(now);
                    }
                }
            }
            Command::PingUnconnected {
                target,
                only_if_accepting,
            } => {
                let id = if only_if_accepting {
                    MessageId::UnconnectedPingOpenConnections
                } else {
                    MessageId::UnconnectedPing
                };
                self.transport.send_to(&encode_ping(id, now), target);
            }
            Command::Rpc {
                call,
                target,
                priority,
                reliability,
                channel,
            } => self.send_rpc(call, target, priority, reliability, channel, now),
            Command::SetSimulation(simulation) => self.transport.set_simulation(simulation),
            Command::SetTimeout(timeout_ms) => {
                self.timeout_ms = timeout_ms;
                for (_, remote) in self.registry.iter_mut() {
                    remote.link.set_timeout_time(timeout_ms);
                }
            }
        }
    }

    /// Slot indices of the connected peers `target` covers.
    fn connected_targets(&self, target: Target) -> Vec<usize> {
        match target {
            Target::Single(addr) => self
                .registry
                .find_slot(addr)
                .filter(|&index| self.registry.get(index).is_some_and(|r| r.is_connected()))
                .into_iter()
                .collect(),
            Target::Broadcast { .. } => {
                let mut targets = Vec::with_capacity(self.registry.capacity());
                targets.extend(
                    self.registry
                        .iter()
                        .filter(|(_, r)| r.is_connected() && target.includes(r.address))
                        .map(|(index, _)| index),
                );
                targets
            }
        }
    }

    fn send_rpc(
        &mut self,
        call: RpcCommand,
        target: Target,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        now: TimeMs,
    ) {
        let RpcCommand {
            identifier,
            args,
            object,
            reply,
        } = call;

        let targets = self.connected_targets(target);
        if targets.is_empty() {
            if let Some((_, reply)) = reply {
                let addr = match target {
                    Target::Single(addr) => addr,
                    Target::Broadcast { .. } => PeerAddress::UNASSIGNED,
                };
                let _ = reply.send(Err(RpcError::NotConnected(addr)));
            }
            return;
        }

        let call_id = reply.as_ref().map(|(call_id, _)| *call_id);
        for index in targets {
            let Some(remote) = self.registry.get_mut(index) else {
                continue;
            };
            let wire_identifier = match remote.rpc_indices.get(&identifier) {
                Some(&announced) => RpcIdentifier::Index(announced),
                None => RpcIdentifier::Name(identifier.clone()),
            };
            let encoded = RpcCall {
                identifier: wire_identifier,
                object,
                call_id,
                args: args.clone(),
            }
            .encode();
            match encoded {
                Ok(data) => {
                    remote.send(data, priority, reliability, channel, now);
                }
                Err(e) => log::warn!("could not encode rpc for {}: {}", remote.address, e),
            }
        }

        if let (Some((call_id, reply)), Target::Single(addr)) = (reply, target) {
            self.pending_calls.insert(call_id, (addr, reply));
        }
    }

    /// Starts a graceful or silent close. Handshaking slots go immediately.
    fn close(&mut self, target: PeerAddress, notify: bool, now: TimeMs) {
        let Some(index) = self.registry.find_slot(target) else {
            if self.shared.requested.take(target).is_some() {
                log::debug!("canceled dial to {}", target);
            }
            return;
        };
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };

        if remote.mode.is_handshaking() {
            self.release(index, None);
            return;
        }
        if !remote.is_connected() {
            return;
        }

        let next = if notify {
            remote.send(
                encode_id(MessageId::DisconnectionNotification),
                Priority::Immediate,
                Reliability::ReliableOrdered,
                0,
                now,
            );
            ConnectMode::DisconnectAsap
        } else {
            ConnectMode::DisconnectAsapSilently
        };
        self.registry.set_mode(index, next);
        self.fail_pending_calls(target, RpcError::Disconnected(target));
    }

    fn process_requested_connections(&mut self, now: TimeMs) {
        let (due, exhausted) = self.shared.requested.poll(now);

        for target in due {
            log::trace!("sending open connection request to {}", target);
            self.transport
                .send_to(&encode_open_connection_request(), target);
        }
        for request in exhausted {
            log::debug!("dial to {} gave up", request.target);
            self.emit(request.target, encode_id(MessageId::ConnectionAttemptFailed));
        }
    }

    fn receive_datagrams(&mut self, now: TimeMs) {
        let datagrams = match self.transport.receive() {
            Ok(datagrams) => datagrams,
            Err(e) => {
                log::warn!("socket receive failed: {}", e);
                return;
            }
        };

        for (data, from) in datagrams {
            let Some(&first) = data.first() else {
                continue;
            };
            if first >= RELIABLE_DATAGRAM_FLOOR {
                match self.registry.find_slot(from) {
                    Some(index) => self.handle_slot_datagram(index, &data, now),
                    None => log::trace!("dropping datagram from unknown sender {}", from),
                }
            } else {
                self.handle_unconnected(&data, from, now);
            }
        }
    }

    fn update_connections(&mut self, now: TimeMs) {
        let keep_alive_ms = self.timeout_ms / 2;

        for index in self.registry.occupied() {
            let Some(remote) = self.registry.get_mut(index) else {
                continue;
            };
            let address = remote.address;
            let mode = remote.mode;

            if mode.is_handshaking()
                && now.saturating_sub(remote.handshake_started_at) > self.handshake_timeout_ms
            {
                log::debug!("handshake with {} timed out in {:?}", address, mode);
                let event = remote
                    .we_initiated
                    .then_some(MessageId::ConnectionAttemptFailed);
                self.release(index, event);
                continue;
            }

            if mode.is_connected() {
                if now.saturating_sub(remote.last_reliable_send_at) > keep_alive_ms {
                    remote.send(
                        encode_id(MessageId::DetectLostConnections),
                        Priority::Low,
                        Reliability::Reliable,
                        0,
                        now,
                    );
                }
                if remote.ping.should_ping(now) {
                    remote.send(
                        encode_ping(MessageId::ConnectedPing, now),
                        Priority::Immediate,
                        Reliability::Unreliable,
                        0,
                        now,
                    );
                    remote.ping.on_ping_sent(now);
                }
            }

            remote.link.update(&mut self.transport, address, self.mtu, now);

            if remote.link.is_dead_connection() {
                let event = if mode.is_connected() {
                    log::info!("lost connection to {}", address);
                    Some(MessageId::ConnectionLost)
                } else if mode.is_handshaking() && remote.we_initiated {
                    Some(MessageId::ConnectionAttemptFailed)
                } else {
                    None
                };
                self.release(index, event);
                continue;
            }

            let drained = match mode {
                ConnectMode::DisconnectAsap | ConnectMode::DisconnectAsapSilently => {
                    !remote.link.is_data_waiting() && !remote.link.are_acks_waiting()
                }
                ConnectMode::DisconnectOnNoAck => !remote.link.are_acks_waiting(),
                _ => false,
            };
            if drained {
                log::debug!("closed connection to {}", address);
                self.release(index, None);
            }
        }
    }

    fn publish_view(&self) {
        let view: BTreeMap<PeerAddress, ConnectionView> = self
            .registry
            .iter()
            .map(|(slot_index, remote)| {
                let view = ConnectionView {
                    address: remote.address,
                    slot_index,
                    mode: remote.mode,
                    we_initiated: remote.we_initiated,
                    connected_at: remote.connected_at,
                    external_address: remote.external_address,
                    average_ping: remote.ping.average_ping(),
                    lowest_ping: remote.ping.lowest_ping(),
                    last_ping: remote.ping.last_ping(),
                    clock_differential: remote.ping.clock_differential(),
                    static_data: remote.static_data.clone(),
                    statistics: remote.link.statistics(),
                };
                (remote.address, view)
            })
            .collect();
        *self.shared.view.write() = view;
    }

    fn new_link(&self) -> Box<dyn ReliabilityLayer> {
        Box::new(ReliableLink::new(self.mtu, self.timeout_ms))
    }

    /// Frees a slot, optionally reporting `event` to the application, and
    /// wakes any blocking call waiting on that peer.
    fn release(&mut self, index: usize, event: Option<MessageId>) {
        let Some(remote) = self.registry.release_slot(index) else {
            return;
        };
        if let Some(id) = event {
            self.emit(remote.address, encode_id(id));
        }
        self.fail_pending_calls(remote.address, RpcError::Disconnected(remote.address));
    }

    fn fail_pending_calls(&mut self, addr: PeerAddress, error: RpcError) {
        self.pending_calls.retain(|_, (target, reply)| {
            if *target != addr {
                return true;
            }
            let _ = reply.send(Err(error.clone()));
            false
        });
    }

    /// Temporary ban for a sender that broke the handshake rules.
    fn punish(&mut self, from: PeerAddress, now: TimeMs, reason: &str) {
        log::warn!("banning {} for {}ms: {}", from, ABUSE_BAN_MS, reason);
        self.shared
            .bans
            .lock()
            .ban(&from.ip_string(), ABUSE_BAN_MS, now);
        if let Some(index) = self.registry.find_slot(from) {
            if self
                .registry
                .get(index)
                .is_some_and(|r| r.mode == ConnectMode::UnverifiedSender)
            {
                self.release(index, None);
            }
        }
    }

    fn emit(&self, sender: PeerAddress, data: Vec<u8>) {
        if self.inbound.send(Packet::new(sender, data)).is_err() {
            log::trace!("inbound queue closed, dropping event from {}", sender);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::clock::Clock;
    use crate::net::protocol::{ConnectionRequest, USER_PACKET_ENUM};
    use crate::net::reliability::{Datagram, MessageFrame, SplitHeader};
    use bytes::Bytes;
    use crossbeam_channel::unbounded;
    use std::net::{Ipv4Addr, UdpSocket};

    struct Harness {
        network: NetworkLoop,
        commands: Sender<Command>,
        inbound: Receiver<Packet>,
        shared: Arc<Shared>,
    }

    fn harness(config: PeerConfig, max_connections: usize) -> Harness {
        let shared = Arc::new(Shared::new(Clock::new()));
        shared
            .max_incoming
            .store(config.max_incoming_connections, Ordering::Relaxed);
        *shared.incoming_password.write() = config.incoming_password.clone();

        let (commands, command_rx) = unbounded();
        let (inbound_tx, inbound) = unbounded();
        let transport = UdpTransport::bind(0).unwrap();
        let network = NetworkLoop::new(
            shared.clone(),
            transport,
            max_connections,
            command_rx,
            inbound_tx,
            &config,
            Duration::from_millis(1),
        );
        Harness {
            network,
            commands,
            inbound,
            shared,
        }
    }

    fn loopback(h: &Harness) -> PeerAddress {
        PeerAddress::from_ipv4(Ipv4Addr::LOCALHOST, h.network.transport.local_address().port)
    }

    fn pump(a: &mut Harness, b: &mut Harness, ticks: usize) {
        for _ in 0..ticks {
            a.network.tick();
            b.network.tick();
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn events(h: &Harness) -> Vec<Option<MessageId>> {
        h.inbound.try_iter().map(|p| p.message_id()).collect()
    }

    /// A bound socket that never answers.
    fn silent_socket() -> (UdpSocket, PeerAddress) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, PeerAddress::from_ipv4(Ipv4Addr::LOCALHOST, port))
    }

    fn connected_pair() -> (Harness, Harness) {
        let mut server = harness(
            PeerConfig {
                max_incoming_connections: 1,
                ..Default::default()
            },
            1,
        );
        let mut client = harness(PeerConfig::default(), 1);
        let server_addr = loopback(&server);
        let now = client.shared.clock.now_ms();
        client.shared.requested.push(server_addr, Vec::new(), now);

        pump(&mut client, &mut server, 50);
        assert!(client.shared.is_connected(server_addr));
        assert_eq!(server.network.registry.connected_count(), 1);
        (server, client)
    }

    #[test]
    fn handshake_over_loopback() {
        let mut server = harness(
            PeerConfig {
                max_incoming_connections: 1,
                ..Default::default()
            },
            1,
        );
        let mut client = harness(PeerConfig::default(), 1);
        let server_addr = loopback(&server);
        let now = client.shared.clock.now_ms();
        client.shared.requested.push(server_addr, Vec::new(), now);

        pump(&mut client, &mut server, 50);

        assert!(client.shared.is_connected(server_addr));
        assert_eq!(server.network.registry.connected_count(), 1);
        assert!(events(&client).contains(&Some(MessageId::ConnectionRequestAccepted)));
        assert!(events(&server).contains(&Some(MessageId::NewIncomingConnection)));
    }

    #[test]
    fn full_server_refuses() {
        let mut server = harness(PeerConfig::default(), 4);
        let mut client = harness(PeerConfig::default(), 1);
        let server_addr = loopback(&server);
        let now = client.shared.clock.now_ms();
        client.shared.requested.push(server_addr, Vec::new(), now);

        pump(&mut client, &mut server, 30);

        assert!(server.network.registry.is_empty());
        assert!(client.network.registry.is_empty());
        assert_eq!(events(&client), vec![Some(MessageId::NoFreeIncomingConnections)]);
    }

    #[test]
    fn blocking_call_without_connection_fails_fast() {
        let mut h = harness(PeerConfig::default(), 1);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let target = PeerAddress::new(0x7F00_0001, 9);
        h.commands
            .send(Command::Rpc {
                call: RpcCommand {
                    identifier: "echo".into(),
                    args: Vec::new(),
                    object: None,
                    reply: Some((1, reply_tx)),
                },
                target: Target::Single(target),
                priority: Priority::High,
                reliability: Reliability::Reliable,
                channel: 0,
            })
            .unwrap();
        h.network.tick();
        assert_eq!(reply_rx.try_recv().unwrap(), Err(RpcError::NotConnected(target)));
    }

    #[test]
    fn garbage_bans_sender() {
        let mut h = harness(PeerConfig::default(), 1);
        let from = PeerAddress::new(0x0A00_0001, 4000);
        let now = h.shared.clock.now_ms();
        h.network.handle_unconnected(&[0x3F, 1, 2], from, now);
        assert!(h.shared.is_banned(from, now));
        assert!(!h.shared.is_banned(from, now + ABUSE_BAN_MS + 1));
    }

    #[test]
    fn split_flood_bans_unverified_sender() {
        let mut h = harness(
            PeerConfig {
                max_incoming_connections: 1,
                ..Default::default()
            },
            1,
        );
        let (_socket, from) = silent_socket();
        let now = h.shared.clock.now_ms();
        h.network
            .handle_unconnected(&encode_open_connection_request(), from, now);
        let index = h.network.registry.find_slot(from).unwrap();

        for sequence in 0..16u32 {
            let datagram = Datagram {
                acks: None,
                sequence: Some(sequence),
                frames: vec![MessageFrame {
                    reliability: Reliability::Unreliable,
                    message_number: None,
                    ordering: None,
                    split: Some(SplitHeader {
                        id: sequence as u16,
                        index: 0,
                        count: 8_192,
                    }),
                    payload: Bytes::from_static(b"x"),
                }],
            }
            .encode_plain();
            h.network.handle_slot_datagram(index, &datagram, now);
        }

        assert!(h.shared.is_banned(from, now));
        assert!(h.network.registry.is_empty());
    }

    #[test]
    fn early_message_survives_lost_new_incoming_connection() {
        let mut server = harness(
            PeerConfig {
                max_incoming_connections: 1,
                ..Default::default()
            },
            1,
        );
        let mut client = harness(PeerConfig::default(), 1);
        let server_addr = loopback(&server);
        let now = client.shared.clock.now_ms();
        client.shared.requested.push(server_addr, Vec::new(), now);

        // tick one side at a time so the client's last handshake step can be lost
        let mut ticks = 0;
        while !client
            .network
            .registry
            .by_address(server_addr)
            .is_some_and(|r| r.is_connected())
        {
            server.network.tick();
            std::thread::sleep(Duration::from_millis(2));
            client.network.tick();
            ticks += 1;
            assert!(ticks < 200, "client never connected");
        }
        std::thread::sleep(Duration::from_millis(5));
        let dropped = server.network.transport.receive().unwrap();
        assert!(!dropped.is_empty());

        let now = client.shared.clock.now_ms();
        let index = client.network.registry.find_slot(server_addr).unwrap();
        assert!(client.network.registry.get_mut(index).unwrap().send(
            vec![USER_PACKET_ENUM, 7, 7],
            Priority::High,
            Reliability::Reliable,
            0,
            now,
        ));

        let mut received = Vec::new();
        for _ in 0..1_000 {
            client.network.tick();
            std::thread::sleep(Duration::from_millis(2));
            server.network.tick();
            received.extend(server.inbound.try_iter());
            if received.iter().any(|p| p.data == [USER_PACKET_ENUM, 7, 7]) {
                break;
            }
        }

        let connected = received
            .iter()
            .position(|p| p.message_id() == Some(MessageId::NewIncomingConnection));
        let user = received.iter().position(|p| p.data == [USER_PACKET_ENUM, 7, 7]);
        assert!(connected.is_some(), "server never finished the handshake");
        assert!(user.is_some(), "early message was lost");
        assert!(connected < user);
    }

    #[test]
    fn silent_server_times_out_handshake() {
        let (_socket, server_addr) = silent_socket();
        let mut client = harness(
            PeerConfig {
                handshake_timeout_ms: 100,
                ..Default::default()
            },
            1,
        );
        let now = client.shared.clock.now_ms();
        client.shared.requested.push(server_addr, Vec::new(), now);
        client.network.tick();

        // the open reply arrives, then nothing more
        client.network.handle_unconnected(
            &encode_id(MessageId::OpenConnectionReply),
            server_addr,
            now,
        );
        assert!(client.network.registry.find_slot(server_addr).is_some());

        let mut seen = Vec::new();
        for _ in 0..200 {
            client.network.tick();
            seen.extend(events(&client));
            if seen.contains(&Some(MessageId::ConnectionAttemptFailed)) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(seen, vec![Some(MessageId::ConnectionAttemptFailed)]);
        assert!(client.network.registry.is_empty());
    }

    #[test]
    fn connection_request_at_disconnecting_slot_fails() {
        let (mut server, mut client) = connected_pair();
        let server_addr = loopback(&server);
        let client_addr = loopback(&client);

        let slot = server.network.registry.find_slot(client_addr).unwrap();
        assert!(
            server
                .network
                .registry
                .set_mode(slot, ConnectMode::DisconnectOnNoAck)
        );

        let now = client.shared.clock.now_ms();
        let request = ConnectionRequest {
            password: Vec::new(),
            dial_token: 1,
        }
        .encode()
        .unwrap();
        let index = client.network.registry.find_slot(server_addr).unwrap();
        client.network.registry.get_mut(index).unwrap().send(
            request,
            Priority::High,
            Reliability::Reliable,
            0,
            now,
        );
        client.network.tick();
        std::thread::sleep(Duration::from_millis(5));
        server.network.tick();
        std::thread::sleep(Duration::from_millis(5));

        let replies = client.network.transport.receive().unwrap();
        let failed = encode_id(MessageId::ConnectionAttemptFailed);
        assert!(
            replies
                .iter()
                .any(|(data, from)| *data == failed && *from == server_addr)
        );
    }
}
