use super::address::PeerAddress;
use super::clock::TimeMs;
use super::protocol::{MessageId, TIMESTAMP_HEADER_LEN, USER_PACKET_ENUM, read_timestamp};

const POOL_CAPACITY: usize = 256;
const POOL_MAX_BUFFER: usize = 64 * 1024;

/// A message or event handed to the application by [`Peer::receive`](super::Peer::receive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sender: PeerAddress,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(sender: PeerAddress, data: Vec<u8>) -> Self {
        Self { sender, data }
    }

    /// The first byte after any timestamp header.
    pub fn kind(&self) -> Option<u8> {
        if self.data.first() == Some(&MessageId::Timestamp.as_u8()) {
            self.data.get(TIMESTAMP_HEADER_LEN).copied()
        } else {
            self.data.first().copied()
        }
    }

    /// System message id, or `None` for application payloads.
    pub fn message_id(&self) -> Option<MessageId> {
        self.kind().and_then(|byte| MessageId::try_from(byte).ok())
    }

    pub fn is_user_message(&self) -> bool {
        self.kind().is_some_and(|byte| byte >= USER_PACKET_ENUM)
    }

    /// Timestamp in the local clock base, if the sender attached one.
    pub fn timestamp(&self) -> Option<TimeMs> {
        read_timestamp(&self.data)
    }

    /// Bytes following the id byte (and timestamp header, if any).
    pub fn body(&self) -> &[u8] {
        let start = if self.data.first() == Some(&MessageId::Timestamp.as_u8()) {
            TIMESTAMP_HEADER_LEN + 1
        } else {
            1
        };
        self.data.get(start..).unwrap_or(&[])
    }
}

/// Recycled byte buffers for packet payloads.
#[derive(Debug, Default)]
pub struct PacketPool {
    free: Vec<Vec<u8>>,
    reused: u64,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cleared buffer holding a copy of `data`.
    pub fn copy_of(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buffer = match self.free.pop() {
            Some(buffer) => {
                self.reused += 1;
                buffer
            }
            None => Vec::with_capacity(data.len()),
        };
        buffer.extend_from_slice(data);
        buffer
    }

    pub fn recycle(&mut self, mut buffer: Vec<u8>) {
        if self.free.len() >= POOL_CAPACITY || buffer.capacity() > POOL_MAX_BUFFER {
            return;
        }
        buffer.clear();
        self.free.push(buffer);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn reused(&self) -> u64 {
        self.reused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::with_timestamp;

    #[test]
    fn kind_skips_timestamp() {
        let packet = Packet::new(
            PeerAddress::UNASSIGNED,
            with_timestamp(1_234, &[USER_PACKET_ENUM + 2, 9, 9]),
        );
        assert_eq!(packet.kind(), Some(USER_PACKET_ENUM + 2));
        assert!(packet.is_user_message());
        assert_eq!(packet.timestamp(), Some(1_234));
        assert_eq!(packet.body(), &[9, 9]);
    }

    #[test]
    fn system_events_have_ids() {
        let packet = Packet::new(
            PeerAddress::UNASSIGNED,
            vec![MessageId::ConnectionLost.as_u8()],
        );
        assert_eq!(packet.message_id(), Some(MessageId::ConnectionLost));
        assert!(!packet.is_user_message());
        assert!(packet.body().is_empty());
    }

    #[test]
    fn pool_recycles_buffers() {
        let mut pool = PacketPool::new();
        let first = pool.copy_of(b"abc");
        pool.recycle(first);
        assert_eq!(pool.available(), 1);

        let second = pool.copy_of(b"de");
        assert_eq!(second, b"de");
        assert_eq!(pool.reused(), 1);
        assert_eq!(pool.available(), 0);

        pool.recycle(Vec::with_capacity(POOL_MAX_BUFFER + 1));
        assert_eq!(pool.available(), 0);
    }
}
