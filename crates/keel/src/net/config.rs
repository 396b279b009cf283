use serde::{Deserialize, Serialize};

use super::protocol::DEFAULT_MTU;
use super::reliability::DEFAULT_TIMEOUT_MS;
use super::security::SecurityConfig;
use super::stats::PacketLossSimulation;

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub mtu: usize,
    /// Unacknowledged reliable data older than this marks a connection dead.
    pub timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub incoming_password: Vec<u8>,
    /// Incoming slots on offer. Zero refuses every dial.
    pub max_incoming_connections: usize,
    pub static_data: Vec<u8>,
    pub offline_ping_response: Vec<u8>,
    pub security: Option<SecurityConfig>,
    pub simulation: Option<PacketLossSimulation>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            incoming_password: Vec::new(),
            max_incoming_connections: 0,
            static_data: Vec::new(),
            offline_ping_response: Vec::new(),
            security: None,
            simulation: None,
        }
    }
}
