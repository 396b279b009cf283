pub mod address;
pub mod bans;
pub mod clock;
pub mod config;
pub mod error;
pub mod packet;
mod peer;
pub mod ping;
pub mod protocol;
pub mod queues;
pub mod registry;
pub mod reliability;
pub mod rpc;
pub mod security;
pub mod simulator;
pub mod stats;
pub mod transport;
mod update;

pub use address::PeerAddress;
pub use bans::BanList;
pub use clock::{Clock, TimeMs};
pub use config::{DEFAULT_HANDSHAKE_TIMEOUT_MS, PeerConfig};
pub use error::{PeerError, ProtocolError, RpcError};
pub use packet::{Packet, PacketPool};
pub use peer::Peer;
pub use ping::{PING_INTERVAL_MS, PingTracker};
pub use protocol::{
    DEFAULT_MTU, DEFAULT_PORT, MAXIMUM_MTU, MINIMUM_MTU, MessageId, PROTOCOL_VERSION,
    USER_PACKET_ENUM, with_timestamp,
};
pub use queues::{ConnectionView, Target};
pub use registry::ConnectMode;
pub use reliability::{Priority, Reliability, ReliabilityLayer, ReliableLink};
pub use rpc::{CallOptions, ObjectId, RpcContext, RpcHandler, RpcInvocation};
pub use security::{KEY_LEN, SecurityConfig};
pub use stats::{LinkStatistics, PacketLossSimulation};
pub use update::ABUSE_BAN_MS;
