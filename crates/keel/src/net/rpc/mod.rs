//! Remote procedure calls keyed by string identifier.
//!
//! A caller names a handler by its literal identifier until the callee
//! announces the compact index it registered it under; after that the index
//! travels instead. Handlers either stand alone or bind to an object in the
//! callee's [`ObjectArena`].

mod arena;
mod codec;
mod registry;

pub use arena::{ObjectArena, SharedObject};
pub use codec::{
    MAX_IDENTIFIER_LEN, RpcCall, RpcFlags, RpcIdentifier, decode_mapping, decode_reply,
    encode_mapping, encode_reply,
};
pub use registry::{
    MemberHandler, RpcContext, RpcHandler, RpcInvocation, RpcRegistration, RpcRegistry,
    StaticHandler,
};

use super::address::PeerAddress;
use super::queues::Target;
use super::reliability::{Priority, Reliability};

/// Handle to an object registered with a peer's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Delivery settings for an outgoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub priority: Priority,
    pub reliability: Reliability,
    pub channel: u8,
    pub target: Target,
    /// Object on the remote side to bind a member handler to.
    pub object: Option<ObjectId>,
}

impl CallOptions {
    pub fn to(addr: PeerAddress) -> Self {
        Self {
            priority: Priority::High,
            reliability: Reliability::ReliableOrdered,
            channel: 0,
            target: Target::Single(addr),
            object: None,
        }
    }

    pub fn broadcast() -> Self {
        Self {
            target: Target::broadcast(),
            ..Self::to(PeerAddress::UNASSIGNED)
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn reliability(mut self, reliability: Reliability) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn object(mut self, object: ObjectId) -> Self {
        self.object = Some(object);
        self
    }
}
