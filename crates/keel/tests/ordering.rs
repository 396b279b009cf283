use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use keel::{
    MessageId, PacketLossSimulation, Peer, PeerAddress, PeerConfig, Priority, Reliability,
    USER_PACKET_ENUM,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(43000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn lossy() -> PacketLossSimulation {
    PacketLossSimulation {
        enabled: true,
        loss_percent: 0.2,
        min_latency_ms: 5,
        max_latency_ms: 30,
        jitter_ms: 0,
    }
}

/// A connected pair with the simulator applied on both sides.
fn lossy_pair() -> (Peer, PeerAddress, Peer, PeerAddress) {
    init_logging();
    let server = Peer::new(PeerConfig {
        max_incoming_connections: 2,
        ..Default::default()
    });
    let server_port = next_port();
    server.initialize(2, server_port, 1).unwrap();

    let client = Peer::new(PeerConfig::default());
    client.initialize(1, next_port(), 1).unwrap();
    client.connect("127.0.0.1", server_port, b"").unwrap();

    assert!(wait_for(5000, || {
        while client.receive().is_some() {}
        while server.receive().is_some() {}
        client.number_of_connections() == 1 && server.number_of_connections() == 1
    }));

    server.apply_network_simulator(Some(lossy()));
    client.apply_network_simulator(Some(lossy()));

    let server_addr = PeerAddress::from_ipv4(Ipv4Addr::LOCALHOST, server_port);
    let client_addr = client.connections()[0].external_address;
    (server, server_addr, client, client_addr)
}

fn message(channel: u8, seq: u32) -> Vec<u8> {
    let mut data = vec![USER_PACKET_ENUM, channel];
    data.extend_from_slice(&seq.to_be_bytes());
    data
}

fn parse(data: &[u8]) -> Option<(u8, u32)> {
    if data.len() != 6 || data[0] != USER_PACKET_ENUM {
        return None;
    }
    Some((data[1], u32::from_be_bytes([data[2], data[3], data[4], data[5]])))
}

#[test]
fn test_reliable_ordered_survives_loss() {
    const COUNT: u32 = 100;
    let (server, server_addr, client, _) = lossy_pair();

    for seq in 0..COUNT {
        for channel in [0u8, 5] {
            assert!(client.send(
                &message(channel, seq),
                Priority::High,
                Reliability::ReliableOrdered,
                channel,
                server_addr
            ));
        }
    }

    let mut next: HashMap<u8, u32> = HashMap::new();
    let delivered = wait_for(20_000, || {
        while let Some(packet) = server.receive() {
            if packet.message_id() == Some(MessageId::ConnectionLost) {
                panic!("connection lost under simulated loss");
            }
            let Some((channel, seq)) = parse(&packet.data) else {
                continue;
            };
            let expected = next.entry(channel).or_insert(0);
            assert_eq!(seq, *expected, "channel {} out of order", channel);
            *expected += 1;
        }
        next.get(&0) == Some(&COUNT) && next.get(&5) == Some(&COUNT)
    });
    assert!(delivered, "delivered so far: {:?}", next);
}

#[test]
fn test_sequenced_never_goes_backwards() {
    const COUNT: u32 = 200;
    let (server, server_addr, client, _) = lossy_pair();

    for seq in 0..COUNT {
        assert!(client.send(
            &message(1, seq),
            Priority::High,
            Reliability::UnreliableSequenced,
            1,
            server_addr
        ));
        if seq % 20 == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    let mut seen = Vec::new();
    wait_for(1500, || {
        while let Some(packet) = server.receive() {
            if let Some((_, seq)) = parse(&packet.data) {
                seen.push(seq);
            }
        }
        seen.last() == Some(&(COUNT - 1))
    });

    assert!(!seen.is_empty());
    assert!(seen.len() <= COUNT as usize);
    assert!(
        seen.windows(2).all(|pair| pair[0] < pair[1]),
        "sequenced delivery went backwards: {:?}",
        seen
    );
}

#[test]
fn test_large_message_is_split_and_rebuilt() {
    let (server, server_addr, client, _) = lossy_pair();

    let mut payload = vec![USER_PACKET_ENUM];
    payload.extend((0..8_000u32).map(|i| (i % 251) as u8));
    assert!(client.send(
        &payload,
        Priority::Medium,
        Reliability::ReliableOrdered,
        0,
        server_addr
    ));

    let mut received = None;
    assert!(wait_for(20_000, || {
        while let Some(packet) = server.receive() {
            if packet.is_user_message() {
                received = Some(packet.data);
                return true;
            }
        }
        false
    }));
    assert_eq!(received, Some(payload));
}

#[test]
fn test_statistics_count_traffic() {
    let (server, server_addr, client, client_addr) = lossy_pair();
    client.apply_network_simulator(None);
    server.apply_network_simulator(None);

    for seq in 0..10 {
        client.send(
            &message(0, seq),
            Priority::High,
            Reliability::Reliable,
            0,
            server_addr,
        );
    }
    let mut count = 0;
    assert!(wait_for(3000, || {
        while let Some(packet) = server.receive() {
            if parse(&packet.data).is_some() {
                count += 1;
            }
        }
        count == 10
    }));

    let stats = client.statistics(server_addr).unwrap();
    assert!(stats.messages_sent >= 10);
    assert!(server.statistics(client_addr).is_some());
}
