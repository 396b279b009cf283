use rand::Rng;
use subtle::ConstantTimeEq;

use super::{ABUSE_BAN_MS, NetworkLoop};
use crate::net::clock::TimeMs;
use crate::net::error::{ProtocolError, RpcError};
use crate::net::protocol::{
    ConnectionAccepted, ConnectionRequest, MessageId, NewIncomingConnection,
    SecuredConnectionConfirmation, SecuredConnectionResponse, USER_PACKET_ENUM, decode_connected_pong,
    decode_ping, encode_connected_pong, encode_id, encode_ping, translate_timestamp,
};
use crate::net::registry::ConnectMode;
use crate::net::reliability::{Priority, Reliability};
use crate::net::rpc::{decode_mapping, decode_reply};
use crate::net::security::{self, SecurityError};

/// Messages held for a slot that has not finished its handshake.
const MAX_PENDING_MESSAGES: usize = 256;

impl NetworkLoop {
    /// A reliability datagram from an address holding a slot.
    pub(super) fn handle_slot_datagram(&mut self, index: usize, data: &[u8], now: TimeMs) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        let from = remote.address;

        // the first sealed datagram is always a multiple of 16 bytes long
        if remote.mode == ConnectMode::SetEncryptionOnMultiple16BytePacket
            && !remote.link.is_encrypted()
            && data.len() % 16 == 0
        {
            if let Some(key) = remote.session_key.clone() {
                log::debug!("enabling encryption for {}", from);
                remote.link.set_encryption_key(Some(key));
            }
        }

        if !remote.link.handle_incoming_datagram(data, now) {
            let (mode, encrypted) = (remote.mode, remote.link.is_encrypted());
            match mode {
                ConnectMode::UnverifiedSender => {
                    self.punish(from, now, "malformed datagram during handshake");
                }
                ConnectMode::Connected if encrypted => {
                    log::warn!("datagram from {} failed authentication", from);
                    self.emit(from, encode_id(MessageId::ModifiedPacket));
                }
                mode => log::trace!("bad datagram from {} in {:?}", from, mode),
            }
            return;
        }

        loop {
            let Some(remote) = self.registry.get_mut(index) else {
                return;
            };
            if remote.address != from {
                return;
            }
            let Some(message) = remote.link.receive() else {
                return;
            };
            self.handle_message(index, message, now);
        }
    }

    fn handle_message(&mut self, index: usize, message: Vec<u8>, now: TimeMs) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        let from = remote.address;
        let mode = remote.mode;
        let Some(&first) = message.first() else {
            return;
        };

        if mode == ConnectMode::UnverifiedSender {
            if first == MessageId::ConnectionRequest.as_u8() {
                self.handle_connection_request(index, &message, now);
            } else {
                self.punish(from, now, "unexpected message before connection request");
            }
            return;
        }

        match MessageId::try_from(first) {
            Ok(MessageId::ConnectionRequest) => self.handle_connection_request(index, &message, now),
            Ok(MessageId::SecuredConnectionResponse) => {
                if mode == ConnectMode::RequestedConnection {
                    self.handle_secured_response(index, &message, now);
                }
            }
            Ok(MessageId::SecuredConnectionConfirmation) => {
                if mode == ConnectMode::HandlingConnectionRequest {
                    self.handle_secured_confirmation(index, &message, now);
                }
            }
            Ok(MessageId::ConnectionRequestAccepted) => {
                if mode == ConnectMode::RequestedConnection {
                    self.handle_connection_accepted(index, &message, now);
                }
            }
            Ok(MessageId::NewIncomingConnection) => {
                if matches!(
                    mode,
                    ConnectMode::HandlingConnectionRequest
                        | ConnectMode::SetEncryptionOnMultiple16BytePacket
                ) {
                    self.handle_new_incoming_connection(index, &message, now);
                }
            }
            Ok(MessageId::ConnectedPing) => {
                if let Ok(sent_at) = decode_ping(&message) {
                    remote.send(
                        encode_connected_pong(sent_at, now),
                        Priority::Immediate,
                        Reliability::Unreliable,
                        0,
                        now,
                    );
                }
            }
            Ok(MessageId::ConnectedPong) => {
                if let Ok((sent_at, remote_time)) = decode_connected_pong(&message) {
                    remote.ping.record(sent_at, remote_time, now);
                }
            }
            Ok(MessageId::DetectLostConnections) => {}
            Ok(MessageId::DisconnectionNotification) => {
                if mode.is_connected() {
                    log::info!("{} disconnected", from);
                    self.registry.set_mode(index, ConnectMode::DisconnectOnNoAck);
                    self.emit(from, encode_id(MessageId::DisconnectionNotification));
                    self.fail_pending_calls(from, RpcError::Disconnected(from));
                }
            }
            Ok(MessageId::StaticData) => {
                remote.static_data = message[1..].to_vec();
                let mut event = message;
                event[0] = MessageId::ReceivedStaticData.as_u8();
                self.emit(from, event);
            }
            Ok(MessageId::RpcMapping) => match decode_mapping(&message) {
                Ok((announced, name)) => {
                    log::trace!("{} maps rpc {} to {}", from, name, announced);
                    remote.rpc_indices.insert(name, announced);
                }
                Err(e) => log::debug!("bad rpc mapping from {}: {}", from, e),
            },
            Ok(MessageId::RpcReply) => {
                let Ok((call_id, payload)) = decode_reply(&message) else {
                    return;
                };
                match self.pending_calls.remove(&call_id) {
                    Some((target, reply)) if target == from => {
                        let _ = reply.send(Ok(payload.to_vec()));
                    }
                    Some(pending) => {
                        self.pending_calls.insert(call_id, pending);
                    }
                    None => log::trace!("late reply {} from {}", call_id, from),
                }
            }
            Ok(MessageId::Rpc) | Ok(MessageId::Timestamp) => self.forward(index, message),
            _ if first >= USER_PACKET_ENUM => self.forward(index, message),
            _ => log::trace!("ignoring system message {:#04x} from {}", first, from),
        }
    }

    /// Hands an application message over, translating any timestamp into our clock.
    fn forward(&mut self, index: usize, mut message: Vec<u8>) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        if !remote.is_connected() {
            let room = remote.pending_messages.len() < MAX_PENDING_MESSAGES;
            if remote.mode.is_handshaking() && room {
                remote.pending_messages.push(message);
            } else {
                log::trace!("dropping message from {} before connection", remote.address);
            }
            return;
        }
        let address = remote.address;
        translate_timestamp(&mut message, remote.ping.clock_differential());
        self.emit(address, message);
    }

    fn handle_connection_request(&mut self, index: usize, message: &[u8], now: TimeMs) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        let from = remote.address;
        let mode = remote.mode;

        let request = match ConnectionRequest::decode(message) {
            Ok(request) => request,
            Err(e) => {
                if mode == ConnectMode::UnverifiedSender {
                    self.punish(from, now, "malformed connection request");
                } else {
                    log::debug!("bad connection request from {}: {}", from, e);
                }
                return;
            }
        };

        match mode {
            ConnectMode::UnverifiedSender => {}
            ConnectMode::RequestedConnection => {
                if remote.dial_token >= request.dial_token {
                    log::debug!("{} dialed us too; keeping our dial", from);
                    return;
                }
                log::debug!("{} dialed us too; yielding", from);
                remote.we_initiated = false;
            }
            mode if mode.is_disconnecting() => {
                self.transport
                    .send_to(&encode_id(MessageId::ConnectionAttemptFailed), from);
                return;
            }
            _ => return,
        }

        let password = self.shared.incoming_password.read().clone();
        let matches: bool = password[..].ct_eq(&request.password[..]).into();
        if !matches {
            log::debug!("{} sent the wrong password", from);
            self.transport
                .send_to(&encode_id(MessageId::InvalidPassword), from);
            self.release(index, None);
            return;
        }

        self.registry
            .set_mode(index, ConnectMode::HandlingConnectionRequest);

        match self.security.as_ref().map(|security| security.respond(from)) {
            Some(response) => self.send_handshake(index, response.encode(), now),
            None => self.send_accepted(index, now),
        }
    }

    fn send_accepted(&mut self, index: usize, now: TimeMs) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        remote.session_token = rand::thread_rng().r#gen();
        let accepted = ConnectionAccepted {
            external_address: remote.address,
            slot_index: index as u16,
            session_token: remote.session_token,
        };
        self.send_handshake(index, accepted.encode(), now);
    }

    fn send_handshake(
        &mut self,
        index: usize,
        encoded: Result<Vec<u8>, ProtocolError>,
        now: TimeMs,
    ) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        match encoded {
            Ok(data) => {
                remote.send(data, Priority::High, Reliability::ReliableOrdered, 0, now);
            }
            Err(e) => {
                log::warn!("could not encode handshake for {}: {}", remote.address, e);
                self.release(index, None);
            }
        }
    }

    fn handle_secured_response(&mut self, index: usize, message: &[u8], now: TimeMs) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        let from = remote.address;
        let Ok(response) = SecuredConnectionResponse::decode(message) else {
            log::debug!("bad secured response from {}", from);
            return;
        };

        match security::confirm(&response, self.expected_server_key.as_ref()) {
            Ok((confirmation, key)) => {
                remote.session_key = Some(key);
                self.send_handshake(index, confirmation.encode(), now);
            }
            Err(SecurityError::PublicKeyMismatch) => {
                log::warn!("{} presented an unexpected public key", from);
                self.release(index, Some(MessageId::PublicKeyMismatch));
            }
            Err(e) => {
                log::warn!("secured handshake with {} failed: {}", from, e);
                self.release(index, Some(MessageId::ConnectionAttemptFailed));
            }
        }
    }

    fn handle_secured_confirmation(&mut self, index: usize, message: &[u8], now: TimeMs) {
        let Some(remote) = self.registry.get(index) else {
            return;
        };
        let from = remote.address;
        let Some(security) = &self.security else {
            return;
        };

        let accepted = SecuredConnectionConfirmation::decode(message)
            .map_err(|e| e.to_string())
            .and_then(|confirmation| {
                security
                    .accept(from, &confirmation)
                    .map_err(|e| e.to_string())
            });

        match accepted {
            Ok(key) => {
                if let Some(remote) = self.registry.get_mut(index) {
                    remote.session_key = Some(key);
                }
                self.send_accepted(index, now);
                self.registry
                    .set_mode(index, ConnectMode::SetEncryptionOnMultiple16BytePacket);
            }
            Err(reason) => {
                log::warn!("banning {} for {}ms: {}", from, ABUSE_BAN_MS, reason);
                self.shared
                    .bans
                    .lock()
                    .ban(&from.ip_string(), ABUSE_BAN_MS, now);
                self.release(index, None);
            }
        }
    }

    fn handle_connection_accepted(&mut self, index: usize, message: &[u8], now: TimeMs) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        let from = remote.address;
        let Ok(accepted) = ConnectionAccepted::decode(message) else {
            log::debug!("bad connection accepted from {}", from);
            return;
        };

        if self.expected_server_key.is_some() && remote.session_key.is_none() {
            log::warn!("{} accepted without the pinned key", from);
            self.release(index, Some(MessageId::PublicKeyMismatch));
            return;
        }
        if let Some(key) = remote.session_key.clone() {
            remote.link.set_encryption_key(Some(key));
        }
        remote.session_token = accepted.session_token;
        remote.external_address = accepted.external_address;
        remote.connected_at = Some(now);
        self.registry.set_mode(index, ConnectMode::Connected);

        self.send_handshake(
            index,
            NewIncomingConnection { reached_at: from }.encode(),
            now,
        );
        self.on_connected(index, now);
        log::info!("connected to {}", from);
        self.emit(from, encode_id(MessageId::ConnectionRequestAccepted));
        self.flush_pending(index);
    }

    fn handle_new_incoming_connection(&mut self, index: usize, message: &[u8], now: TimeMs) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        let from = remote.address;
        let Ok(incoming) = NewIncomingConnection::decode(message) else {
            log::debug!("bad new incoming connection from {}", from);
            return;
        };

        remote.external_address = incoming.reached_at;
        remote.connected_at = Some(now);
        self.registry.set_mode(index, ConnectMode::Connected);
        self.on_connected(index, now);
        log::info!("{} connected", from);
        self.emit(from, encode_id(MessageId::NewIncomingConnection));
        self.flush_pending(index);
    }

    fn flush_pending(&mut self, index: usize) {
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };
        let pending = std::mem::take(&mut remote.pending_messages);
        if !pending.is_empty() {
            log::debug!("delivering {} early messages from {}", pending.len(), remote.address);
        }
        for message in pending {
            self.forward(index, message);
        }
    }

    /// First ping and our static data, for either end of a new connection.
    fn on_connected(&mut self, index: usize, now: TimeMs) {
        let static_data = self.shared.static_data.read().clone();
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };

        remote.send(
            encode_ping(MessageId::ConnectedPing, now),
            Priority::Immediate,
            Reliability::Unreliable,
            0,
            now,
        );
        remote.ping.on_ping_sent(now);

        if !static_data.is_empty() {
            let mut data = Vec::with_capacity(1 + static_data.len());
            data.push(MessageId::StaticData.as_u8());
            data.extend_from_slice(&static_data);
            remote.send(data, Priority::High, Reliability::ReliableOrdered, 0, now);
        }
    }
}
