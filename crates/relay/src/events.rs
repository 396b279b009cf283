use keel::{MessageId, PeerAddress};

#[derive(Debug, Clone)]
pub enum RelayEvent {
    ClientConnected { addr: PeerAddress },
    ClientDisconnected { addr: PeerAddress, reason: DisconnectReason },
    ConnectionDenied { addr: PeerAddress, reason: &'static str },
    Relayed { from: PeerAddress, bytes: usize, recipients: usize },
}

#[derive(Debug, Clone, Copy)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
        }
    }
}

impl RelayEvent {
    /// Maps a transport event packet to a relay event, if it is one we report.
    pub fn from_message(id: MessageId, addr: PeerAddress) -> Option<Self> {
        let event = match id {
            MessageId::NewIncomingConnection => RelayEvent::ClientConnected { addr },
            MessageId::DisconnectionNotification => RelayEvent::ClientDisconnected {
                addr,
                reason: DisconnectReason::Graceful,
            },
            MessageId::ConnectionLost => RelayEvent::ClientDisconnected {
                addr,
                reason: DisconnectReason::Timeout,
            },
            MessageId::ModifiedPacket => RelayEvent::ConnectionDenied {
                addr,
                reason: "tampered datagram",
            },
            MessageId::PublicKeyMismatch => RelayEvent::ConnectionDenied {
                addr,
                reason: "key mismatch",
            },
            _ => return None,
        };
        Some(event)
    }
}
