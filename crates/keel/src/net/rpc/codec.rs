use bitflags::bitflags;
use bytes::{Buf, BufMut};

use super::ObjectId;
use crate::net::error::ProtocolError;
use crate::net::protocol::MessageId;

pub const MAX_IDENTIFIER_LEN: usize = u8::MAX as usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RpcFlags: u8 {
        const BY_INDEX = 0x01;
        const HAS_OBJECT = 0x02;
        const WANT_REPLY = 0x04;
    }
}

/// How a call names its handler on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcIdentifier {
    /// Index the callee announced for this identifier.
    Index(u16),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub identifier: RpcIdentifier,
    pub object: Option<ObjectId>,
    pub call_id: Option<u32>,
    pub args: Vec<u8>,
}

impl RpcCall {
    /// `[Rpc][flags][u16 index | u8 len + name][u32 object?][u32 call_id?][args]`
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut flags = RpcFlags::empty();
        flags.set(RpcFlags::BY_INDEX, matches!(self.identifier, RpcIdentifier::Index(_)));
        flags.set(RpcFlags::HAS_OBJECT, self.object.is_some());
        flags.set(RpcFlags::WANT_REPLY, self.call_id.is_some());

        let mut out = Vec::with_capacity(16 + self.args.len());
        out.put_u8(MessageId::Rpc.as_u8());
        out.put_u8(flags.bits());
        match &self.identifier {
            RpcIdentifier::Index(index) => out.put_u16(*index),
            RpcIdentifier::Name(name) => put_name(&mut out, name)?,
        }
        if let Some(object) = self.object {
            out.put_u32(object.0);
        }
        if let Some(call_id) = self.call_id {
            out.put_u32(call_id);
        }
        out.put_slice(&self.args);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = body_of(data, MessageId::Rpc)?;
        if !buf.has_remaining() {
            return Err(ProtocolError::Truncated);
        }
        let raw = buf.get_u8();
        let flags = RpcFlags::from_bits(raw).ok_or(ProtocolError::UnexpectedId(raw))?;

        let identifier = if flags.contains(RpcFlags::BY_INDEX) {
            need(&buf, 2)?;
            RpcIdentifier::Index(buf.get_u16())
        } else {
            RpcIdentifier::Name(get_name(&mut buf)?)
        };
        let object = if flags.contains(RpcFlags::HAS_OBJECT) {
            need(&buf, 4)?;
            Some(ObjectId(buf.get_u32()))
        } else {
            None
        };
        let call_id = if flags.contains(RpcFlags::WANT_REPLY) {
            need(&buf, 4)?;
            Some(buf.get_u32())
        } else {
            None
        };

        Ok(Self {
            identifier,
            object,
            call_id,
            args: buf.to_vec(),
        })
    }
}

/// `[RpcMapping][u16 index][u8 len][name]`
pub fn encode_mapping(index: u16, name: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(4 + name.len());
    out.put_u8(MessageId::RpcMapping.as_u8());
    out.put_u16(index);
    put_name(&mut out, name)?;
    Ok(out)
}

pub fn decode_mapping(data: &[u8]) -> Result<(u16, String), ProtocolError> {
    let mut buf = body_of(data, MessageId::RpcMapping)?;
    need(&buf, 2)?;
    let index = buf.get_u16();
    let name = get_name(&mut buf)?;
    Ok((index, name))
}

/// `[RpcReply][u32 call_id][payload]`
pub fn encode_reply(call_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.put_u8(MessageId::RpcReply.as_u8());
    out.put_u32(call_id);
    out.put_slice(payload);
    out
}

pub fn decode_reply(data: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    let mut buf = body_of(data, MessageId::RpcReply)?;
    need(&buf, 4)?;
    let call_id = buf.get_u32();
    Ok((call_id, buf))
}

fn body_of(data: &[u8], id: MessageId) -> Result<&[u8], ProtocolError> {
    match data.split_first() {
        None => Err(ProtocolError::Empty),
        Some((&first, rest)) if first == id.as_u8() => Ok(rest),
        Some((&first, _)) => Err(ProtocolError::UnexpectedId(first)),
    }
}

fn need(buf: &&[u8], len: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        Err(ProtocolError::Truncated)
    } else {
        Ok(())
    }
}

fn put_name(out: &mut Vec<u8>, name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return Err(ProtocolError::BadIdentifier);
    }
    out.put_u8(name.len() as u8);
    out.put_slice(name.as_bytes());
    Ok(())
}

fn get_name(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    if len == 0 {
        return Err(ProtocolError::BadIdentifier);
    }
    need(buf, len)?;
    let name = std::str::from_utf8(&buf[..len])
        .map_err(|_| ProtocolError::BadIdentifier)?
        .to_owned();
    buf.advance(len);
    Ok(name)
}
