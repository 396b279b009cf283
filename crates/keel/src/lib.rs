pub mod net;

pub use net::{
    ABUSE_BAN_MS, BanList, CallOptions, ConnectMode, ConnectionView, DEFAULT_MTU, DEFAULT_PORT,
    KEY_LEN, LinkStatistics, MessageId, ObjectId, Packet, PacketLossSimulation, Peer,
    PeerAddress, PeerConfig, PeerError, Priority, Reliability, ReliabilityLayer, ReliableLink,
    RpcContext, RpcError, RpcHandler, RpcInvocation, SecurityConfig, Target, USER_PACKET_ENUM,
    with_timestamp,
};
