use keel::{DEFAULT_PORT, PacketLossSimulation};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub max_clients: usize,
    pub password: Vec<u8>,
    pub motd: Vec<u8>,
    pub thread_sleep_ms: u64,
    pub timeout_ms: u64,
    pub global_packet_loss: Option<PacketLossSimulation>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_clients: 32,
            password: Vec::new(),
            motd: Vec::new(),
            thread_sleep_ms: 1,
            timeout_ms: 10_000,
            global_packet_loss: None,
        }
    }
}
