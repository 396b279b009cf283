use std::io;

use thiserror::Error;

use super::address::PeerAddress;

/// Failures surfaced directly to the caller of the [`Peer`](super::Peer) API.
///
/// Everything the network thread detects travels as a packet event instead.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer is already active")]
    AlreadyActive,
    #[error("peer is not active")]
    NotActive,
    #[error("max connections must be at least 1")]
    InvalidMaxConnections,
    #[error("no free connection slot")]
    NoFreeSlot,
    #[error("already connected or connecting to {0}")]
    AlreadyConnected(PeerAddress),
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a blocking RPC call that did not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("no connection to {0}")]
    NotConnected(PeerAddress),
    #[error("{0} disconnected before replying")]
    Disconnected(PeerAddress),
    #[error("call timed out")]
    TimedOut,
    #[error("peer shut down")]
    ShutDown,
    #[error("blocking calls need a single target")]
    InvalidTarget,
}

/// Wire decode failures. Never leaves the network thread.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("unexpected message id {0:#04x}")]
    UnexpectedId(u8),
    #[error("message truncated")]
    Truncated,
    #[error("identifier is not valid utf-8")]
    BadIdentifier,
    #[error("serialization failed: {0}")]
    Serialize(rkyv::rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rkyv::rancor::Error),
}
