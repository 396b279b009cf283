use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use keel::{
    ConnectMode, MessageId, Packet, Peer, PeerAddress, PeerConfig, Priority, Reliability,
    USER_PACKET_ENUM,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn loopback(port: u16) -> PeerAddress {
    PeerAddress::from_ipv4(Ipv4Addr::LOCALHOST, port)
}

fn start(config: PeerConfig, max_connections: usize) -> (Peer, u16) {
    let port = next_port();
    let peer = Peer::new(config);
    peer.initialize(max_connections, port, 1).unwrap();
    (peer, port)
}

fn server_config(max_incoming: usize) -> PeerConfig {
    PeerConfig {
        max_incoming_connections: max_incoming,
        ..Default::default()
    }
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

/// Drains `peer` until a packet of kind `id` shows up.
fn wait_for_message(peer: &Peer, id: MessageId, timeout_ms: u64) -> Option<Packet> {
    let mut found = None;
    wait_for(timeout_ms, || {
        while let Some(packet) = peer.receive() {
            if packet.message_id() == Some(id) {
                found = Some(packet);
                return true;
            }
        }
        false
    });
    found
}

fn connect_pair(server: &Peer, server_port: u16, client: &Peer, password: &[u8]) {
    client.connect("127.0.0.1", server_port, password).unwrap();
    assert!(
        wait_for_message(client, MessageId::ConnectionRequestAccepted, 3000).is_some(),
        "client never saw the connection accepted"
    );
    assert!(
        wait_for_message(server, MessageId::NewIncomingConnection, 3000).is_some(),
        "server never saw the new connection"
    );
}

#[test]
fn test_full_server_sends_no_free_slots() {
    init_logging();
    let (server, server_port) = start(server_config(0), 4);
    let (client, _) = start(PeerConfig::default(), 1);

    client.connect("127.0.0.1", server_port, b"").unwrap();

    assert!(wait_for_message(&client, MessageId::NoFreeIncomingConnections, 3000).is_some());
    assert!(server.connections().is_empty());
    assert!(client.connections().is_empty());
}

#[test]
fn test_password_handshake_and_ping() {
    init_logging();
    let (server, server_port) = start(server_config(4), 4);
    server.set_incoming_password(b"hunter2");
    let (client, client_port) = start(PeerConfig::default(), 1);

    connect_pair(&server, server_port, &client, b"hunter2");

    let server_addr = loopback(server_port);
    let client_addr = loopback(client_port);
    assert_eq!(client.connection_state(server_addr), Some(ConnectMode::Connected));
    assert!(wait_for(1000, || server.number_of_connections() == 1));
    assert_eq!(client.external_address(server_addr), Some(client_addr));
    assert_eq!(server.external_address(client_addr), Some(server_addr));

    assert!(wait_for(3000, || client.lowest_ping(server_addr).is_some()));
    assert!(wait_for(3000, || server.lowest_ping(client_addr).is_some()));
    assert!(client.lowest_ping(server_addr).unwrap() < 1000);
    assert!(client.average_ping(server_addr).is_some());
}

#[test]
fn test_wrong_password_is_refused() {
    init_logging();
    let (server, server_port) = start(server_config(4), 4);
    server.set_incoming_password(b"right");
    let (client, _) = start(PeerConfig::default(), 1);

    client.connect("127.0.0.1", server_port, b"wrong").unwrap();

    assert!(wait_for_message(&client, MessageId::InvalidPassword, 3000).is_some());
    assert!(wait_for(1000, || server.connections().is_empty()));
    assert!(wait_for(1000, || client.connections().is_empty()));
}

#[test]
fn test_banned_address_is_refused() {
    init_logging();
    let (server, server_port) = start(server_config(4), 4);
    server.add_ban("127.0.0.*", 0);
    let (client, _) = start(PeerConfig::default(), 1);

    client.connect("127.0.0.1", server_port, b"").unwrap();

    assert!(wait_for_message(&client, MessageId::ConnectionBanned, 3000).is_some());
    assert!(server.connections().is_empty());
}

#[test]
fn test_simultaneous_dial_yields_one_connection() {
    init_logging();
    let (a, a_port) = start(server_config(1), 2);
    let (b, b_port) = start(server_config(1), 2);

    a.connect("127.0.0.1", b_port, b"").unwrap();
    // b may already hold a slot for a
    let _ = b.connect("127.0.0.1", a_port, b"");

    assert!(wait_for(5000, || {
        while a.receive().is_some() {}
        while b.receive().is_some() {}
        a.number_of_connections() == 1 && b.number_of_connections() == 1
    }));

    // give a stray duplicate time to surface
    thread::sleep(Duration::from_millis(200));
    let a_view = a.connections();
    let b_view = b.connections();
    assert_eq!(a_view.len(), 1);
    assert_eq!(b_view.len(), 1);
    assert_eq!(a_view[0].address, loopback(b_port));
    assert_eq!(b_view[0].address, loopback(a_port));
    assert_ne!(a_view[0].we_initiated, b_view[0].we_initiated);
}

#[test]
fn test_secured_handshake_carries_data() {
    init_logging();
    let server = Peer::new(server_config(4));
    assert!(server.initialize_security(None, None));
    let server_key = server.security_public_key().unwrap();
    let server_port = next_port();
    server.initialize(4, server_port, 1).unwrap();

    let client = Peer::new(PeerConfig::default());
    assert!(client.initialize_security(None, Some(server_key)));
    client.initialize(1, next_port(), 1).unwrap();

    connect_pair(&server, server_port, &client, b"");

    let server_addr = loopback(server_port);
    let mut message = vec![USER_PACKET_ENUM];
    message.extend_from_slice(b"sealed payload");
    assert!(client.send(
        &message,
        Priority::High,
        Reliability::ReliableOrdered,
        0,
        server_addr
    ));

    let mut received = None;
    assert!(wait_for(3000, || {
        while let Some(packet) = server.receive() {
            if packet.is_user_message() {
                received = Some(packet);
                return true;
            }
        }
        false
    }));
    assert_eq!(received.unwrap().data, message);
}

#[test]
fn test_pinned_key_mismatch() {
    init_logging();
    let server = Peer::new(server_config(4));
    assert!(server.initialize_security(None, None));
    let server_port = next_port();
    server.initialize(4, server_port, 1).unwrap();

    let client = Peer::new(PeerConfig::default());
    assert!(client.initialize_security(None, Some([7u8; 32])));
    client.initialize(1, next_port(), 1).unwrap();

    client.connect("127.0.0.1", server_port, b"").unwrap();

    assert!(wait_for_message(&client, MessageId::PublicKeyMismatch, 3000).is_some());
    assert_eq!(client.number_of_connections(), 0);
}

#[test]
fn test_static_data_is_pushed() {
    init_logging();
    let (server, server_port) = start(server_config(4), 4);
    server.set_static_data(b"motd: welcome");
    let (client, _) = start(PeerConfig::default(), 1);

    client.connect("127.0.0.1", server_port, b"").unwrap();

    let packet = wait_for_message(&client, MessageId::ReceivedStaticData, 3000).unwrap();
    assert_eq!(packet.body(), b"motd: welcome");
    assert_eq!(
        client.remote_static_data(loopback(server_port)),
        Some(b"motd: welcome".to_vec())
    );
}

#[test]
fn test_unconnected_ping_returns_response() {
    init_logging();
    let (server, server_port) = start(server_config(4), 4);
    server.set_offline_ping_response(b"lobby-7");
    let (client, _) = start(PeerConfig::default(), 1);

    assert!(client.ping_unconnected("127.0.0.1", server_port, true));

    let pong = wait_for_message(&client, MessageId::Pong, 3000).unwrap();
    assert_eq!(&pong.data[5..], b"lobby-7");
    assert!(server.connections().is_empty());
}

#[test]
fn test_close_notifies_remote() {
    init_logging();
    let (server, server_port) = start(server_config(4), 4);
    let (client, client_port) = start(PeerConfig::default(), 1);
    connect_pair(&server, server_port, &client, b"");

    assert!(client.close_connection(loopback(server_port), true));

    let notice = wait_for_message(&server, MessageId::DisconnectionNotification, 3000).unwrap();
    assert_eq!(notice.sender, loopback(client_port));
    assert!(wait_for(3000, || client.connections().is_empty()));
    assert!(wait_for(3000, || server.connections().is_empty()));
}

#[test]
fn test_silent_peer_is_reported_lost() {
    init_logging();
    let (server, server_port) = start(server_config(4), 4);
    let (client, _) = start(
        PeerConfig {
            timeout_ms: 1000,
            ..Default::default()
        },
        1,
    );
    connect_pair(&server, server_port, &client, b"");

    server.shutdown(0);

    let lost = wait_for_message(&client, MessageId::ConnectionLost, 6000);
    assert_eq!(lost.map(|p| p.sender), Some(loopback(server_port)));
    assert!(wait_for(1000, || client.connections().is_empty()));
}

#[test]
fn test_unreachable_host_fails_attempt() {
    init_logging();
    let (client, _) = start(PeerConfig::default(), 1);
    let nobody = next_port();

    client.connect("127.0.0.1", nobody, b"").unwrap();

    assert!(wait_for_message(&client, MessageId::ConnectionAttemptFailed, 10_000).is_some());
}
