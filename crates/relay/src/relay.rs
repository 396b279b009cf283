use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keel::{
    Peer, PeerAddress, PeerConfig, Priority, Reliability, RpcHandler, RpcInvocation,
    Target,
};

use crate::config::RelayConfig;
use crate::events::{DisconnectReason, RelayEvent};

/// Forwards every user message to all other clients and answers `echo` calls.
pub struct Relay {
    peer: Peer,
    running: Arc<AtomicBool>,
    pending_events: VecDeque<RelayEvent>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> anyhow::Result<Self> {
        let peer = Peer::new(PeerConfig {
            max_incoming_connections: config.max_clients,
            incoming_password: config.password,
            static_data: config.motd,
            timeout_ms: config.timeout_ms,
            simulation: config.global_packet_loss,
            ..Default::default()
        });

        peer.register_rpc(
            "echo",
            RpcHandler::function(|call: &mut RpcInvocation| {
                call.reply = call.args.clone();
            }),
            None,
        );

        peer.initialize(config.max_clients, config.port, config.thread_sleep_ms)?;

        Ok(Self {
            peer,
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> Option<PeerAddress> {
        self.peer.local_address()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = RelayEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for event in self.drain_events().collect::<Vec<_>>() {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections();
    }

    pub fn tick_once(&mut self) {
        while let Some(packet) = self.peer.receive() {
            let sender = packet.sender;
            if packet.is_user_message() {
                let recipients = self
                    .peer
                    .connections()
                    .iter()
                    .filter(|c| c.is_connected() && c.address != sender)
                    .count();
                if recipients > 0 {
                    self.peer.send(
                        &packet.data,
                        Priority::High,
                        Reliability::ReliableOrdered,
                        0,
                        Target::Broadcast {
                            except: Some(sender),
                        },
                    );
                }
                self.pending_events.push_back(RelayEvent::Relayed {
                    from: sender,
                    bytes: packet.data.len(),
                    recipients,
                });
            } else if let Some(event) = packet
                .message_id()
                .and_then(|id| RelayEvent::from_message(id, sender))
            {
                self.pending_events.push_back(event);
            }
            self.peer.deallocate_packet(packet);
        }
    }

    pub fn kick_client(&mut self, addr: PeerAddress) {
        if self.peer.connection_state(addr).is_none() {
            log::debug!("no client at {} to kick", addr);
            return;
        }
        if self.peer.close_connection(addr, true) {
            self.pending_events.push_back(RelayEvent::ClientDisconnected {
                addr,
                reason: DisconnectReason::Kicked,
            });
        }
    }

    pub fn shutdown_connections(&mut self) {
        for connection in self.peer.connections() {
            self.kick_client(connection.address);
        }
        self.peer.shutdown(500);
    }
}

fn log_event(event: &RelayEvent) {
    match event {
        RelayEvent::ClientConnected { addr } => log::info!("client connected from {}", addr),
        RelayEvent::ClientDisconnected { addr, reason } => {
            log::info!("client {} {}", addr, reason.as_str())
        }
        RelayEvent::ConnectionDenied { addr, reason } => {
            log::warn!("connection from {} denied: {}", addr, reason)
        }
        RelayEvent::Relayed {
            from,
            bytes,
            recipients,
        } => log::debug!("relayed {} bytes from {} to {} peers", bytes, from, recipients),
    }
}
