use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use super::address::PeerAddress;
use super::reliability::DatagramSink;
use super::simulator::NetworkSimulator;
use super::stats::PacketLossSimulation;

const RECV_BUFFER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
}

/// Non-blocking IPv4 UDP socket owned by the network thread.
pub struct UdpTransport {
    socket: UdpSocket,
    local_address: PeerAddress,
    recv_buffer: Vec<u8>,
    simulator: NetworkSimulator,
    stats: SocketStats,
}

impl UdpTransport {
    /// Binds all interfaces; port 0 picks an ephemeral port.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;

        let local_address = PeerAddress::try_from(socket.local_addr()?)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "socket is not IPv4"))?;

        Ok(Self {
            socket,
            local_address,
            recv_buffer: vec![0u8; RECV_BUFFER_LEN],
            simulator: NetworkSimulator::new(),
            stats: SocketStats::default(),
        })
    }

    pub fn local_address(&self) -> PeerAddress {
        self.local_address
    }

    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    pub fn set_simulation(&mut self, simulation: Option<PacketLossSimulation>) {
        self.simulator.set_global(simulation);
    }

    pub fn send_to(&mut self, datagram: &[u8], to: PeerAddress) {
        if self.simulator.is_active() {
            self.simulator.enqueue_outbound(datagram, to);
            return;
        }
        self.send_now(datagram, to);
    }

    fn send_now(&mut self, datagram: &[u8], to: PeerAddress) {
        match self.socket.send_to(datagram, SocketAddr::from(to)) {
            Ok(bytes) => {
                self.stats.datagrams_sent += 1;
                self.stats.bytes_sent += bytes as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.send_errors += 1;
            }
            Err(e) => {
                self.stats.send_errors += 1;
                log::trace!("send to {} failed: {}", to, e);
            }
        }
    }

    /// Releases datagrams the simulator has held long enough.
    pub fn flush_delayed(&mut self) {
        for (datagram, to) in self.simulator.take_outbound() {
            self.send_now(&datagram, to);
        }
    }

    /// Drains everything currently queued on the socket.
    pub fn receive(&mut self) -> io::Result<Vec<(Vec<u8>, PeerAddress)>> {
        let mut datagrams = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if size == 0 {
                        continue;
                    }
                    let Ok(from) = PeerAddress::try_from(addr) else {
                        continue;
                    };
                    self.stats.datagrams_received += 1;
                    self.stats.bytes_received += size as u64;
                    datagrams.push((self.recv_buffer[..size].to_vec(), from));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable surfaces as a reset on some platforms
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(datagrams)
    }
}

impl DatagramSink for UdpTransport {
    fn send_datagram(&mut self, datagram: &[u8], to: PeerAddress) {
        self.send_to(datagram, to);
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_address", &self.local_address)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn loopback(transport: &UdpTransport) -> PeerAddress {
        PeerAddress::new(u32::from(Ipv4Addr::LOCALHOST), transport.local_address().port)
    }

    #[test]
    fn loopback_datagram() {
        let mut a = UdpTransport::bind(0).unwrap();
        let mut b = UdpTransport::bind(0).unwrap();
        let to = loopback(&b);

        a.send_to(b"hello", to);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got = Vec::new();
        while got.is_empty() && Instant::now() < deadline {
            got.extend(b.receive().unwrap());
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b"hello");
        assert_eq!(got[0].1.port, a.local_address().port);
        assert_eq!(a.stats().datagrams_sent, 1);
    }
}
