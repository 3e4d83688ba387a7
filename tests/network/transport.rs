//! Reliable and unreliable delivery over loopback UDP.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::common::test_utils::init_tracing;
use crate::common::wire;
use netchan_client::telemetry::{CollectingObserver, ViolationKind};
use netchan_client::{ClientPayload, NetchanError, Transport, TransportConfig};
use serial_test::serial;

const RELIABLE_BIT: u32 = 1 << 31;

fn config() -> TransportConfig {
    TransportConfig {
        poll_interval: Duration::from_millis(5),
        resend_every_polls: 2,
        max_retransmissions: Some(100),
        recv_backlog_limit: 16,
    }
}

/// A bound server socket and a transport pointed at it.
fn pair(config: TransportConfig) -> (UdpSocket, Transport) {
    init_tracing();
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let port = server.local_addr().unwrap().port();
    let transport = Transport::connect("127.0.0.1", port, config).unwrap();
    (server, transport)
}

fn recv(server: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (len, from) = server.recv_from(&mut buf).unwrap();
    (buf[..len].to_vec(), from)
}

fn seq_a(datagram: &[u8]) -> u32 {
    u32::from_le_bytes(datagram[..4].try_into().unwrap())
}

fn receive_within(transport: &Transport, attempts: usize) -> Option<Vec<u8>> {
    (0..attempts).find_map(|_| transport.receive_data().unwrap())
}

#[test]
#[serial]
fn connectionless_exchange() {
    let (server, transport) = pair(config());

    transport.send_connectionless("getchallenge").unwrap();
    let (request, client) = recv(&server);
    assert_eq!(request, wire::connectionless("getchallenge"));

    server
        .send_to(&wire::connectionless("challenge 77"), client)
        .unwrap();
    let reply = receive_within(&transport, 200).unwrap();
    assert_eq!(&reply[4..], b"challenge 77");
    // Connectionless traffic leaves the sequence state alone.
    assert_eq!(transport.reliability().local_parity_flips(), 0);
}

#[test]
#[serial]
fn reliable_send_survives_lost_datagrams() {
    let (server, transport) = pair(config());

    let acker = thread::spawn(move || {
        // Drop the first two copies, acknowledge the third.
        let mut copies = Vec::new();
        let mut from = None;
        while copies.len() < 3 {
            let (datagram, client) = recv(&server);
            copies.push(datagram);
            from = Some(client);
        }
        let ack = wire::datagram(1, seq_a(&copies[2]), &[wire::nop()]);
        server.send_to(&ack, from.unwrap()).unwrap();
        copies
    });

    let retransmissions = transport
        .send_reliable(&ClientPayload::StringCommand("new".to_owned()))
        .unwrap();
    let copies = acker.join().unwrap();

    assert!(retransmissions >= 2);
    assert_eq!(copies[0], copies[1], "retransmissions repeat the datagram");
    assert_ne!(seq_a(&copies[0]) & RELIABLE_BIT, 0);
    assert_eq!(&copies[0][8..], b"\x04new\0");
    let stats = transport.stats();
    assert_eq!(stats.reliable_acked, 1);
    assert!(stats.retransmissions >= 2);
}

#[test]
#[serial]
fn acknowledging_datagram_still_reaches_the_receiver() {
    let (server, transport) = pair(config());

    let acker = thread::spawn(move || {
        let (datagram, client) = recv(&server);
        let ack = wire::datagram(
            1,
            seq_a(&datagram),
            &[wire::print(2, "welcome\n")],
        );
        server.send_to(&ack, client).unwrap();
    });

    transport
        .send_reliable(&ClientPayload::StringCommand("begin 1".to_owned()))
        .unwrap();
    acker.join().unwrap();

    let datagram = receive_within(&transport, 10).unwrap();
    assert_eq!(seq_a(&datagram), 1);
    assert_eq!(&datagram[8..], &wire::print(2, "welcome\n")[..]);
}

#[test]
#[serial]
fn unanswered_reliable_send_stalls() {
    let collector = Arc::new(CollectingObserver::new());
    let (_server, transport) = pair(TransportConfig {
        max_retransmissions: Some(3),
        ..config()
    });
    let transport = transport.with_violation_observer(collector.clone());

    let err = transport
        .send_reliable(&ClientPayload::StringCommand("new".to_owned()))
        .unwrap_err();

    assert_eq!(err, NetchanError::TransportStalled { retransmissions: 3 });
    assert!(collector.has_violation(ViolationKind::Reliability));
}

#[test]
#[serial]
fn close_wakes_a_waiting_sender() {
    let (_server, transport) = pair(TransportConfig {
        max_retransmissions: None,
        ..config()
    });
    let transport = Arc::new(transport);

    let sender = {
        let transport = Arc::clone(&transport);
        thread::spawn(move || transport.send_reliable(&ClientPayload::StringCommand("new".to_owned())))
    };
    thread::sleep(Duration::from_millis(50));
    transport.close();

    assert_eq!(sender.join().unwrap(), Err(NetchanError::TransportClosed));
    assert_eq!(transport.receive_data(), Err(NetchanError::TransportClosed));
    assert_eq!(
        transport.send_connectionless("getchallenge"),
        Err(NetchanError::TransportClosed)
    );
}

#[test]
#[serial]
fn unreliable_frames_count_up_and_echo_the_peer() {
    let (server, transport) = pair(config());

    transport.send_unreliable(&[ClientPayload::Nop]);
    let (first, client) = recv(&server);
    assert_eq!(seq_a(&first), 1);
    assert_eq!(&first[4..8], &0u32.to_le_bytes());

    server
        .send_to(&wire::datagram(5 | RELIABLE_BIT, 0, &[wire::nop()]), client)
        .unwrap();
    receive_within(&transport, 200).unwrap();

    transport.send_unreliable(&[ClientPayload::Nop]);
    let (second, _) = recv(&server);
    assert_eq!(seq_a(&second), 2);
    // The peer's reliable frame flipped the parity we echo back.
    assert_eq!(
        u32::from_le_bytes(second[4..8].try_into().unwrap()),
        5 | RELIABLE_BIT
    );
}

#[test]
#[serial]
fn late_server_frames_are_dropped() {
    let (server, transport) = pair(config());
    transport.send_unreliable(&[ClientPayload::Nop]);
    let (_, client) = recv(&server);

    for seq in [3, 2, 3, 4] {
        server
            .send_to(&wire::datagram(seq, 0, &[wire::nop()]), client)
            .unwrap();
    }
    let mut delivered = Vec::new();
    for _ in 0..200 {
        if let Some(datagram) = transport.receive_data().unwrap() {
            delivered.push(seq_a(&datagram));
        }
        if transport.stats().packets_received == 4 {
            break;
        }
    }

    assert_eq!(delivered, vec![3, 4]);
    assert_eq!(transport.stats().stale_dropped, 2);
    assert_eq!(transport.reliability().peer_seq().value(), 4);
}
