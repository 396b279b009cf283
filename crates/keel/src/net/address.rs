use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// IPv4 endpoint of a remote system. Ordered by `(ip, port)`; the registry key.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[rkyv(derive(Debug))]
pub struct PeerAddress {
    pub ip: u32,
    pub port: u16,
}

impl PeerAddress {
    pub const UNASSIGNED: PeerAddress = PeerAddress { ip: 0, port: 0 };

    pub const fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn from_ipv4(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: u32::from(ip),
            port,
        }
    }

    /// Resolves `host:port`, keeping the first IPv4 result.
    pub fn resolve(host: &str, port: u16) -> Option<Self> {
        (host, port)
            .to_socket_addrs()
            .ok()?
            .find_map(|addr| Self::try_from(addr).ok())
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    pub fn is_unassigned(&self) -> bool {
        *self == Self::UNASSIGNED
    }

    /// Dotted-quad form used by the ban list.
    pub fn ip_string(&self) -> String {
        self.ipv4().to_string()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ipv4(), self.port)
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::from_ipv4(*addr.ip(), addr.port())
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(addr: PeerAddress) -> Self {
        SocketAddr::V4(SocketAddrV4::new(addr.ipv4(), addr.port))
    }
}

impl TryFrom<SocketAddr> for PeerAddress {
    type Error = SocketAddr;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Ok(Self::from_ipv4(ip, v6.port())),
                None => Err(addr),
            },
        }
    }
}
