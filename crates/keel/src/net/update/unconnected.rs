use std::sync::atomic::Ordering;

use bytes::BufMut;
use rand::Rng;

use super::NetworkLoop;
use crate::net::address::PeerAddress;
use crate::net::clock::TimeMs;
use crate::net::protocol::{
    ConnectionRequest, MessageId, decode_ping, decode_unconnected_pong, encode_id,
    encode_unconnected_pong, is_valid_open_connection_request,
};
use crate::net::registry::ConnectMode;
use crate::net::reliability::{Priority, Reliability};

impl NetworkLoop {
    /// Traffic from addresses that have not been given a reliability layer.
    pub(super) fn handle_unconnected(&mut self, data: &[u8], from: PeerAddress, now: TimeMs) {
        let id = match MessageId::of(data) {
            Some(id) if id.is_unconnected() => id,
            _ => {
                self.punish_unless_connected(from, now, "unknown unconnected message");
                return;
            }
        };
        log::trace!("{:?} from {}", id, from);

        match id {
            MessageId::OpenConnectionRequest => self.handle_open_request(data, from, now),
            MessageId::OpenConnectionReply => self.handle_open_reply(from, now),
            MessageId::UnconnectedPing | MessageId::UnconnectedPingOpenConnections => {
                let Ok(sent_at) = decode_ping(data) else {
                    self.punish_unless_connected(from, now, "malformed ping");
                    return;
                };
                let only_if_accepting = id == MessageId::UnconnectedPingOpenConnections;
                if only_if_accepting && !self.has_incoming_capacity() {
                    return;
                }
                let response = self.shared.offline_ping_response.read().clone();
                self.transport
                    .send_to(&encode_unconnected_pong(sent_at, &response), from);
            }
            MessageId::Pong => {
                let Ok((sent_at, response)) = decode_unconnected_pong(data) else {
                    return;
                };
                let rtt = now.saturating_sub(sent_at).min(u32::MAX as u64) as u32;
                let mut event = Vec::with_capacity(5 + response.len());
                event.put_u8(MessageId::Pong.as_u8());
                event.put_u32(rtt);
                event.put_slice(response);
                self.emit(from, event);
            }
            MessageId::NoFreeIncomingConnections
            | MessageId::ConnectionAttemptFailed
            | MessageId::ConnectionBanned
            | MessageId::InvalidPassword => self.handle_refusal(id, from),
            _ => {}
        }
    }

    fn handle_open_request(&mut self, data: &[u8], from: PeerAddress, now: TimeMs) {
        if !is_valid_open_connection_request(data) {
            self.punish_unless_connected(from, now, "malformed open connection request");
            return;
        }
        if self.shared.is_banned(from, now) {
            log::debug!("refusing banned {}", from);
            self.reply(MessageId::ConnectionBanned, from);
            return;
        }

        if let Some(mode) = self.registry.by_address(from).map(|r| r.mode) {
            // a lost reply is answered again, a live connection is not reopened
            if mode.is_handshaking() {
                self.reply(MessageId::OpenConnectionReply, from);
            } else {
                self.reply(MessageId::ConnectionAttemptFailed, from);
            }
            return;
        }

        // both sides dialing: our own dial allocates the slot
        if self.shared.requested.contains(from) {
            self.reply(MessageId::OpenConnectionReply, from);
            return;
        }

        if !self.has_incoming_capacity() {
            log::debug!("no free incoming slot for {}", from);
            self.reply(MessageId::NoFreeIncomingConnections, from);
            return;
        }

        let link = self.new_link();
        match self
            .registry
            .allocate_slot(from, ConnectMode::UnverifiedSender, link, now)
        {
            Some(_) => self.reply(MessageId::OpenConnectionReply, from),
            None => self.reply(MessageId::NoFreeIncomingConnections, from),
        }
    }

    fn handle_open_reply(&mut self, from: PeerAddress, now: TimeMs) {
        let Some(request) = self.shared.requested.take(from) else {
            log::trace!("unsolicited open connection reply from {}", from);
            return;
        };
        if self.registry.find_slot(from).is_some() {
            return;
        }

        let link = self.new_link();
        let Some(index) =
            self.registry
                .allocate_slot(from, ConnectMode::RequestedConnection, link, now)
        else {
            log::debug!("no free slot to complete dial to {}", from);
            self.emit(from, encode_id(MessageId::ConnectionAttemptFailed));
            return;
        };
        let Some(remote) = self.registry.get_mut(index) else {
            return;
        };

        remote.dial_token = rand::thread_rng().r#gen();
        let request = ConnectionRequest {
            password: request.password,
            dial_token: remote.dial_token,
        };
        match request.encode() {
            Ok(data) => {
                remote.send(data, Priority::High, Reliability::ReliableOrdered, 0, now);
                log::debug!("requesting connection to {}", from);
            }
            Err(e) => {
                log::warn!("could not encode connection request: {}", e);
                self.release(index, Some(MessageId::ConnectionAttemptFailed));
            }
        }
    }

    /// A refusal cancels our dial, whether it is still queued or holds a slot.
    fn handle_refusal(&mut self, id: MessageId, from: PeerAddress) {
        if self.shared.requested.take(from).is_some() {
            log::debug!("{} refused our dial: {:?}", from, id);
            self.emit(from, encode_id(id));
            return;
        }
        let Some(index) = self.registry.find_slot(from) else {
            return;
        };
        if self
            .registry
            .get(index)
            .is_some_and(|r| r.mode == ConnectMode::RequestedConnection)
        {
            log::debug!("{} refused our connection request: {:?}", from, id);
            self.release(index, Some(id));
        }
    }

    fn punish_unless_connected(&mut self, from: PeerAddress, now: TimeMs, reason: &str) {
        let verified = self
            .registry
            .by_address(from)
            .is_some_and(|r| r.mode != ConnectMode::UnverifiedSender);
        if verified {
            log::trace!("ignoring {} from {}", reason, from);
            return;
        }
        self.punish(from, now, reason);
    }

    fn has_incoming_capacity(&self) -> bool {
        self.registry.incoming_count() < self.shared.max_incoming.load(Ordering::Relaxed)
    }

    fn reply(&mut self, id: MessageId, to: PeerAddress) {
        self.transport.send_to(&encode_id(id), to);
    }
}
