use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use super::Reliability;

/// First byte of a plaintext reliability datagram.
pub const PLAIN_TAG: u8 = 0x84;
/// First byte of a sealed reliability datagram.
pub const SEALED_TAG: u8 = 0x85;

/// Tag, flags, ack block and sequence number.
pub const DATAGRAM_HEADER_MAX: usize = 1 + 1 + 8 + 4;
/// Header byte, length, message number, ordering and split header.
pub const FRAME_HEADER_MAX: usize = 1 + 2 + 4 + 5 + 10;

const SPLIT_BIT: u8 = 0x08;
const RELIABILITY_MASK: u8 = 0x07;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatagramFlags: u8 {
        const HAS_ACKS = 0x01;
        const HAS_MESSAGES = 0x02;
        /// One trailing byte keeps plaintext lengths off multiples of 16.
        const PADDED = 0x04;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unexpected datagram tag {0:#04x}")]
    BadTag(u8),
    #[error("unknown reliability {0}")]
    BadReliability(u8),
    #[error("unknown datagram flags {0:#04x}")]
    BadFlags(u8),
    #[error("malformed split header")]
    BadSplit,
    #[error("too many split messages in flight")]
    SplitLimit,
    #[error("message too far ahead of the receive window")]
    OutOfWindow,
    #[error("datagram failed authentication")]
    Authentication,
    #[error("sealed datagram without a session key")]
    NoKey,
    #[error("plaintext datagram on a sealed link")]
    Downgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub ack: u32,
    pub bitfield: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitHeader {
    pub id: u16,
    pub index: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub reliability: Reliability,
    /// Present exactly when `reliability` is reliable.
    pub message_number: Option<u32>,
    /// Channel and index for ordered or sequenced frames.
    pub ordering: Option<(u8, u32)>,
    pub split: Option<SplitHeader>,
    pub payload: Bytes,
}

impl MessageFrame {
    pub fn encoded_len(&self) -> usize {
        1 + 2
            + self.message_number.map_or(0, |_| 4)
            + self.ordering.map_or(0, |_| 5)
            + self.split.map_or(0, |_| 10)
            + self.payload.len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let mut header = self.reliability as u8;
        if self.split.is_some() {
            header |= SPLIT_BIT;
        }
        out.put_u8(header);
        out.put_u16(self.payload.len() as u16);
        if let Some(number) = self.message_number {
            out.put_u32(number);
        }
        if let Some((channel, index)) = self.ordering {
            out.put_u8(channel);
            out.put_u32(index);
        }
        if let Some(split) = self.split {
            out.put_u16(split.id);
            out.put_u32(split.index);
            out.put_u32(split.count);
        }
        out.put_slice(&self.payload);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, LinkError> {
        need(buf, 3)?;
        let header = buf.get_u8();
        let reliability = Reliability::try_from(header & RELIABILITY_MASK)
            .map_err(LinkError::BadReliability)?;
        let len = buf.get_u16() as usize;

        let message_number = if reliability.is_reliable() {
            need(buf, 4)?;
            Some(buf.get_u32())
        } else {
            None
        };
        let ordering = if reliability.uses_channel() {
            need(buf, 5)?;
            Some((buf.get_u8(), buf.get_u32()))
        } else {
            None
        };
        let split = if header & SPLIT_BIT != 0 {
            need(buf, 10)?;
            let split = SplitHeader {
                id: buf.get_u16(),
                index: buf.get_u32(),
                count: buf.get_u32(),
            };
            if split.count == 0 || split.index >= split.count {
                return Err(LinkError::BadSplit);
            }
            Some(split)
        } else {
            None
        };

        need(buf, len)?;
        let payload = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);

        Ok(Self {
            reliability,
            message_number,
            ordering,
            split,
            payload,
        })
    }
}

/// Decoded contents of one reliability datagram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datagram {
    pub acks: Option<AckInfo>,
    /// Present exactly when `frames` is non-empty.
    pub sequence: Option<u32>,
    pub frames: Vec<MessageFrame>,
}

impl Datagram {
    /// Everything after the tag byte.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut flags = DatagramFlags::empty();
        flags.set(DatagramFlags::HAS_ACKS, self.acks.is_some());
        flags.set(DatagramFlags::HAS_MESSAGES, self.sequence.is_some());

        let mut out = Vec::with_capacity(
            DATAGRAM_HEADER_MAX + self.frames.iter().map(MessageFrame::encoded_len).sum::<usize>(),
        );
        out.put_u8(flags.bits());
        if let Some(acks) = self.acks {
            out.put_u32(acks.ack);
            out.put_u32(acks.bitfield);
        }
        if let Some(sequence) = self.sequence {
            out.put_u32(sequence);
            for frame in &self.frames {
                frame.encode(&mut out);
            }
        }
        out
    }

    pub fn encode_plain(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut out = Vec::with_capacity(body.len() + 2);
        out.put_u8(PLAIN_TAG);
        out.extend_from_slice(&body);
        if out.len() % 16 == 0 {
            out[1] |= DatagramFlags::PADDED.bits();
            out.put_u8(0);
        }
        out
    }

    pub fn decode_plain(data: &[u8]) -> Result<Self, LinkError> {
        match data.first() {
            Some(&PLAIN_TAG) => Self::decode_body(&data[1..]),
            Some(&other) => Err(LinkError::BadTag(other)),
            None => Err(LinkError::Truncated),
        }
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, LinkError> {
        let mut buf = body;
        need(&buf, 1)?;
        let raw = buf.get_u8();
        let flags = DatagramFlags::from_bits(raw).ok_or(LinkError::BadFlags(raw))?;

        if flags.contains(DatagramFlags::PADDED) {
            need(&buf, 1)?;
            buf = &buf[..buf.len() - 1];
        }

        let acks = if flags.contains(DatagramFlags::HAS_ACKS) {
            need(&buf, 8)?;
            Some(AckInfo {
                ack: buf.get_u32(),
                bitfield: buf.get_u32(),
            })
        } else {
            None
        };

        let mut datagram = Self {
            acks,
            sequence: None,
            frames: Vec::new(),
        };

        if flags.contains(DatagramFlags::HAS_MESSAGES) {
            need(&buf, 4)?;
            datagram.sequence = Some(buf.get_u32());
            while buf.has_remaining() {
                datagram.frames.push(MessageFrame::decode(&mut buf)?);
            }
            if datagram.frames.is_empty() {
                return Err(LinkError::Truncated);
            }
        } else if buf.has_remaining() {
            return Err(LinkError::Truncated);
        }

        Ok(datagram)
    }
}

fn need(buf: &&[u8], len: usize) -> Result<(), LinkError> {
    if buf.remaining() < len {
        Err(LinkError::Truncated)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(reliability: Reliability, payload: &'static [u8]) -> MessageFrame {
        MessageFrame {
            reliability,
            message_number: reliability.is_reliable().then_some(9),
            ordering: reliability.uses_channel().then_some((3, 41)),
            split: None,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn datagram_with_acks_and_frames() {
        let mut split = frame(Reliability::ReliableOrdered, b"part");
        split.split = Some(SplitHeader {
            id: 2,
            index: 1,
            count: 3,
        });
        let datagram = Datagram {
            acks: Some(AckInfo {
                ack: 10,
                bitfield: 0xF0,
            }),
            sequence: Some(77),
            frames: vec![
                frame(Reliability::Unreliable, b"hello"),
                frame(Reliability::ReliableSequenced, b"seq"),
                split,
            ],
        };

        let encoded = datagram.encode_plain();
        assert_eq!(encoded[0], PLAIN_TAG);
        assert_ne!(encoded.len() % 16, 0);
        assert_eq!(Datagram::decode_plain(&encoded).unwrap(), datagram);
    }

    #[test]
    fn plaintext_never_multiple_of_16() {
        for len in 0..64 {
            let datagram = Datagram {
                acks: None,
                sequence: Some(1),
                frames: vec![MessageFrame {
                    reliability: Reliability::Unreliable,
                    message_number: None,
                    ordering: None,
                    split: None,
                    payload: Bytes::from(vec![0xAB; len]),
                }],
            };
            let encoded = datagram.encode_plain();
            assert_ne!(encoded.len() % 16, 0);
            assert_eq!(Datagram::decode_plain(&encoded).unwrap(), datagram);
        }
    }

    #[test]
    fn ack_only_datagram() {
        let datagram = Datagram {
            acks: Some(AckInfo { ack: 1, bitfield: 0 }),
            ..Default::default()
        };
        let encoded = datagram.encode_plain();
        assert_eq!(encoded.len(), 10);
        assert_eq!(Datagram::decode_plain(&encoded).unwrap(), datagram);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(Datagram::decode_plain(&[]), Err(LinkError::Truncated));
        assert_eq!(Datagram::decode_plain(&[0x01]), Err(LinkError::BadTag(0x01)));
        assert_eq!(
            Datagram::decode_plain(&[PLAIN_TAG, 0x80]),
            Err(LinkError::BadFlags(0x80))
        );
        // frame claims 200 payload bytes
        assert_eq!(
            Datagram::decode_plain(&[PLAIN_TAG, 0x02, 0, 0, 0, 1, 0x00, 0, 200, 1]),
            Err(LinkError::Truncated)
        );
        // split index past count
        let bad_split = [
            PLAIN_TAG, 0x02, 0, 0, 0, 1, 0x0A, 0, 0, 0, 0, 0, 1, 0, 1, 0, 0, 0, 5, 0, 0, 0, 2,
        ];
        assert_eq!(Datagram::decode_plain(&bad_split), Err(LinkError::BadSplit));
    }
}
