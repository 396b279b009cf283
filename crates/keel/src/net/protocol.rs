use bytes::{Buf, BufMut};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::address::PeerAddress;
use super::clock::TimeMs;
use super::error::ProtocolError;

pub const PROTOCOL_VERSION: u16 = 3;
pub const DEFAULT_PORT: u16 = 27015;
pub const DEFAULT_MTU: usize = 1200;
pub const MINIMUM_MTU: usize = 576;
pub const MAXIMUM_MTU: usize = 1492;

/// First application-defined message id. Everything at or above passes through untouched.
pub const USER_PACKET_ENUM: u8 = 0x40;

/// Raw datagrams whose first byte is at or above this belong to a reliability layer.
pub const RELIABLE_DATAGRAM_FLOOR: u8 = 0x80;

pub const OPEN_CONNECTION_REQUEST_LEN: usize = 3;
pub const TIMESTAMP_HEADER_LEN: usize = 9;

/// Message ids below [`USER_PACKET_ENUM`]. Also used as the first byte of event packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    ConnectedPing = 0x00,
    UnconnectedPing = 0x01,
    UnconnectedPingOpenConnections = 0x02,
    ConnectedPong = 0x03,
    DetectLostConnections = 0x04,
    OpenConnectionRequest = 0x05,
    OpenConnectionReply = 0x06,
    ConnectionRequest = 0x07,
    SecuredConnectionResponse = 0x08,
    SecuredConnectionConfirmation = 0x09,
    RpcMapping = 0x0A,
    Rpc = 0x0B,
    RpcReply = 0x0C,
    StaticData = 0x0D,
    ConnectionRequestAccepted = 0x0E,
    ConnectionAttemptFailed = 0x0F,
    NewIncomingConnection = 0x10,
    NoFreeIncomingConnections = 0x11,
    DisconnectionNotification = 0x12,
    ConnectionLost = 0x13,
    PublicKeyMismatch = 0x14,
    ConnectionBanned = 0x15,
    InvalidPassword = 0x16,
    ModifiedPacket = 0x17,
    Timestamp = 0x18,
    Pong = 0x19,
    ReceivedStaticData = 0x1A,
}

impl MessageId {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn of(data: &[u8]) -> Option<Self> {
        data.first().and_then(|&byte| Self::try_from(byte).ok())
    }

    /// Ids legal on the connectionless path.
    pub fn is_unconnected(self) -> bool {
        matches!(
            self,
            Self::UnconnectedPing
                | Self::UnconnectedPingOpenConnections
                | Self::Pong
                | Self::OpenConnectionRequest
                | Self::OpenConnectionReply
                | Self::NoFreeIncomingConnections
                | Self::ConnectionAttemptFailed
                | Self::ConnectionBanned
                | Self::InvalidPassword
        )
    }
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match byte {
            0x00 => ConnectedPing,
            0x01 => UnconnectedPing,
            0x02 => UnconnectedPingOpenConnections,
            0x03 => ConnectedPong,
            0x04 => DetectLostConnections,
            0x05 => OpenConnectionRequest,
            0x06 => OpenConnectionReply,
            0x07 => ConnectionRequest,
            0x08 => SecuredConnectionResponse,
            0x09 => SecuredConnectionConfirmation,
            0x0A => RpcMapping,
            0x0B => Rpc,
            0x0C => RpcReply,
            0x0D => StaticData,
            0x0E => ConnectionRequestAccepted,
            0x0F => ConnectionAttemptFailed,
            0x10 => NewIncomingConnection,
            0x11 => NoFreeIncomingConnections,
            0x12 => DisconnectionNotification,
            0x13 => ConnectionLost,
            0x14 => PublicKeyMismatch,
            0x15 => ConnectionBanned,
            0x16 => InvalidPassword,
            0x17 => ModifiedPacket,
            0x18 => Timestamp,
            0x19 => Pong,
            0x1A => ReceivedStaticData,
            other => return Err(other),
        })
    }
}

/// Implements `encode`/`decode` for a handshake body framed as `[id][rkyv archive]`.
macro_rules! system_message {
    ($ty:ident, $id:expr) => {
        impl $ty {
            pub const ID: MessageId = $id;

            pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
                let archived =
                    rkyv::to_bytes::<rancor::Error>(self).map_err(ProtocolError::Serialize)?;
                let mut out = Vec::with_capacity(archived.len() + 1);
                out.push(Self::ID.as_u8());
                out.extend_from_slice(&archived);
                Ok(out)
            }

            pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
                let body = expect_id(data, Self::ID)?;
                // Datagram buffers carry no alignment guarantee.
                let mut aligned = AlignedVec::<16>::with_capacity(body.len());
                aligned.extend_from_slice(body);
                rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(ProtocolError::Deserialize)
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ConnectionRequest {
    pub password: Vec<u8>,
    pub dial_token: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ConnectionAccepted {
    /// The initiator's address as the acceptor sees it.
    pub external_address: PeerAddress,
    pub slot_index: u16,
    pub session_token: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct NewIncomingConnection {
    /// The acceptor's address as the initiator reached it.
    pub reached_at: PeerAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SecuredConnectionResponse {
    pub cookie: [u8; 32],
    pub public_key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SecuredConnectionConfirmation {
    pub cookie: [u8; 32],
    pub ephemeral_public: [u8; 32],
    pub sealed_pre_secret: Vec<u8>,
}

system_message!(ConnectionRequest, MessageId::ConnectionRequest);
system_message!(ConnectionAccepted, MessageId::ConnectionRequestAccepted);
system_message!(NewIncomingConnection, MessageId::NewIncomingConnection);
system_message!(SecuredConnectionResponse, MessageId::SecuredConnectionResponse);
system_message!(
    SecuredConnectionConfirmation,
    MessageId::SecuredConnectionConfirmation
);

fn expect_id(data: &[u8], id: MessageId) -> Result<&[u8], ProtocolError> {
    match data.split_first() {
        None => Err(ProtocolError::Empty),
        Some((&first, rest)) if first == id.as_u8() => Ok(rest),
        Some((&first, _)) => Err(ProtocolError::UnexpectedId(first)),
    }
}

pub fn encode_id(id: MessageId) -> Vec<u8> {
    vec![id.as_u8()]
}

pub fn encode_open_connection_request() -> Vec<u8> {
    let mut out = Vec::with_capacity(OPEN_CONNECTION_REQUEST_LEN);
    out.put_u8(MessageId::OpenConnectionRequest.as_u8());
    out.put_u16(PROTOCOL_VERSION);
    out
}

/// A well-formed request is exactly three bytes with a matching protocol version.
pub fn is_valid_open_connection_request(data: &[u8]) -> bool {
    data.len() == OPEN_CONNECTION_REQUEST_LEN
        && data[0] == MessageId::OpenConnectionRequest.as_u8()
        && u16::from_be_bytes([data[1], data[2]]) == PROTOCOL_VERSION
}

/// `[ConnectedPing | UnconnectedPing*][u64 send time]`
pub fn encode_ping(id: MessageId, sent_at: TimeMs) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.put_u8(id.as_u8());
    out.put_u64(sent_at);
    out
}

pub fn decode_ping(data: &[u8]) -> Result<TimeMs, ProtocolError> {
    let mut body = data.get(1..).ok_or(ProtocolError::Empty)?;
    if body.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    Ok(body.get_u64())
}

/// `[ConnectedPong][u64 echoed ping time][u64 responder time]`
pub fn encode_connected_pong(ping_sent_at: TimeMs, now: TimeMs) -> Vec<u8> {
    let mut out = Vec::with_capacity(17);
    out.put_u8(MessageId::ConnectedPong.as_u8());
    out.put_u64(ping_sent_at);
    out.put_u64(now);
    out
}

pub fn decode_connected_pong(data: &[u8]) -> Result<(TimeMs, TimeMs), ProtocolError> {
    let mut body = expect_id(data, MessageId::ConnectedPong)?;
    if body.remaining() < 16 {
        return Err(ProtocolError::Truncated);
    }
    Ok((body.get_u64(), body.get_u64()))
}

/// `[Pong][u64 echoed ping time][response data]`
pub fn encode_unconnected_pong(ping_sent_at: TimeMs, response: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + response.len());
    out.put_u8(MessageId::Pong.as_u8());
    out.put_u64(ping_sent_at);
    out.put_slice(response);
    out
}

pub fn decode_unconnected_pong(data: &[u8]) -> Result<(TimeMs, &[u8]), ProtocolError> {
    let mut body = expect_id(data, MessageId::Pong)?;
    if body.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    let sent_at = body.get_u64();
    Ok((sent_at, body))
}

/// Prefixes `payload` with a timestamp tag in the sender's clock base.
pub fn with_timestamp(time: TimeMs, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TIMESTAMP_HEADER_LEN + payload.len());
    out.put_u8(MessageId::Timestamp.as_u8());
    out.put_u64(time);
    out.put_slice(payload);
    out
}

/// Rewrites a leading timestamp from the remote clock base into the local one.
///
/// `differential` is `remote - local`. Messages without a timestamp tag are left alone.
pub fn translate_timestamp(data: &mut [u8], differential: i64) -> bool {
    if data.len() < TIMESTAMP_HEADER_LEN || data[0] != MessageId::Timestamp.as_u8() {
        return false;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[1..TIMESTAMP_HEADER_LEN]);
    let remote = u64::from_be_bytes(raw) as i64;
    let local = remote.wrapping_sub(differential) as u64;
    data[1..TIMESTAMP_HEADER_LEN].copy_from_slice(&local.to_be_bytes());
    true
}

/// Reads the leading timestamp of a tagged message.
pub fn read_timestamp(data: &[u8]) -> Option<TimeMs> {
    if data.len() < TIMESTAMP_HEADER_LEN || data[0] != MessageId::Timestamp.as_u8() {
        return None;
    }
    let mut body = &data[1..TIMESTAMP_HEADER_LEN];
    Some(body.get_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_round_trips_through_byte() {
        for byte in 0..USER_PACKET_ENUM {
            if let Ok(id) = MessageId::try_from(byte) {
                assert_eq!(id.as_u8(), byte);
            }
        }
        assert_eq!(MessageId::try_from(USER_PACKET_ENUM), Err(USER_PACKET_ENUM));
    }

    #[test]
    fn open_connection_request_is_three_bytes() {
        let request = encode_open_connection_request();
        assert_eq!(request.len(), OPEN_CONNECTION_REQUEST_LEN);
        assert!(is_valid_open_connection_request(&request));

        let mut wrong_version = request.clone();
        wrong_version[2] ^= 0xFF;
        assert!(!is_valid_open_connection_request(&wrong_version));
        assert!(!is_valid_open_connection_request(&request[..2]));
    }

    #[test]
    fn connection_request_serialization() {
        let request = ConnectionRequest {
            password: b"hunter2".to_vec(),
            dial_token: 0xDEAD_BEEF,
        };
        let encoded = request.encode().unwrap();
        assert_eq!(encoded[0], MessageId::ConnectionRequest.as_u8());
        assert_eq!(ConnectionRequest::decode(&encoded).unwrap(), request);
    }

    #[test]
    fn decode_rejects_wrong_id() {
        let accepted = ConnectionAccepted {
            external_address: PeerAddress::new(0x7F00_0001, 4000),
            slot_index: 3,
            session_token: 9,
        }
        .encode()
        .unwrap();
        assert!(matches!(
            ConnectionRequest::decode(&accepted),
            Err(ProtocolError::UnexpectedId(_))
        ));
        assert!(ConnectionAccepted::decode(&accepted[..accepted.len() / 2]).is_err());
    }

    #[test]
    fn timestamp_translation() {
        let mut message = with_timestamp(10_000, &[USER_PACKET_ENUM, 1, 2]);
        assert!(translate_timestamp(&mut message, 2_500));
        assert_eq!(read_timestamp(&message), Some(7_500));
        assert_eq!(&message[TIMESTAMP_HEADER_LEN..], &[USER_PACKET_ENUM, 1, 2]);

        let mut plain = vec![USER_PACKET_ENUM, 0, 0];
        assert!(!translate_timestamp(&mut plain, 5));
    }

    #[test]
    fn pong_layouts() {
        let pong = encode_connected_pong(100, 250);
        assert_eq!(decode_connected_pong(&pong).unwrap(), (100, 250));

        let offline = encode_unconnected_pong(42, b"lobby");
        let (sent, response) = decode_unconnected_pong(&offline).unwrap();
        assert_eq!(sent, 42);
        assert_eq!(response, b"lobby");
    }
}
