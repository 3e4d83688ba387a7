//! Server-initiated reconnects.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]

use crate::common::fake_server::{FakeServer, ServerScript};
use crate::common::test_utils::{fast_config, init_tracing, wait_for, WAIT_TIMEOUT};
use crate::common::wire;
use netchan_client::{ConnectionState, Session, SessionBuilder, World};
use serial_test::serial;

fn connected_session(server: &FakeServer) -> Session {
    init_tracing();
    let session: Session = SessionBuilder::new()
        .with_config(fast_config())
        .build()
        .unwrap();
    session.connect("127.0.0.1", server.port()).unwrap();
    session
}

#[test]
#[serial]
fn reconnect_message_starts_a_new_connection() {
    let server = FakeServer::start(ServerScript::default());
    let session = connected_session(&server);
    let first_id = session.client_id();

    server.push_message(wire::reconnect());

    assert!(wait_for(WAIT_TIMEOUT, || server.connects() == 2));
    assert!(session.wait_until_spawned(WAIT_TIMEOUT));
    assert_eq!(session.state(), ConnectionState::Connected { in_game: true });
    // The lease is held across the reconnect.
    assert_eq!(session.client_id(), first_id);

    let requests = server.connectionless();
    assert_eq!(
        requests.iter().filter(|r| *r == "getchallenge").count(),
        2,
        "{requests:?}"
    );
    // The level load ran again on the new connection.
    let commands = server.commands();
    assert_eq!(commands.iter().filter(|c| *c == "new").count(), 2);
    assert_eq!(commands.iter().filter(|c| *c == "begin 2").count(), 1);
}

#[test]
#[serial]
fn stuffed_reconnect_after_map_change() {
    let server = FakeServer::start(ServerScript::default());
    let session = connected_session(&server);

    server.push_message(wire::stuff_text("changing\nreconnect\n"));

    assert!(wait_for(WAIT_TIMEOUT, || server.connects() == 2));
    assert!(session.wait_until_spawned(WAIT_TIMEOUT));
    // The world was rebuilt from the new level data.
    session.with_world(|world| {
        assert_eq!(world.server_data().map(|d| d.server_count), Some(2));
        assert!(world.current_frame_number().is_some());
    });
}

#[test]
#[serial]
fn disconnect_during_back_off_stops_reconnecting() {
    let server = FakeServer::start(ServerScript::default());
    init_tracing();
    let mut config = fast_config();
    config.reconnect_backoff_min = std::time::Duration::from_millis(300);
    config.reconnect_backoff_max = std::time::Duration::from_millis(300);
    let session: Session = SessionBuilder::new().with_config(config).build().unwrap();
    session.connect("127.0.0.1", server.port()).unwrap();

    server.push_message(wire::reconnect());
    assert!(wait_for(WAIT_TIMEOUT, || session.state()
        == ConnectionState::AwaitingChallenge));
    session.disconnect();

    assert_eq!(session.state(), ConnectionState::Disconnected);
    std::thread::sleep(std::time::Duration::from_millis(500));
    assert_eq!(server.connects(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[test]
#[serial]
fn failed_reconnect_is_reported() {
    let server = FakeServer::start(ServerScript::default());
    let session = connected_session(&server);

    server.set_script(ServerScript {
        reject: Some("Server is restarting.".to_owned()),
        ..ServerScript::default()
    });
    server.push_message(wire::reconnect());

    assert!(wait_for(WAIT_TIMEOUT, || session.state()
        == ConnectionState::Disconnected));
    assert!(!session.wait_until_spawned(std::time::Duration::from_millis(10)));
    assert_eq!(
        session.last_failure(),
        Some(netchan_client::NetchanError::HandshakeRejected {
            reason: "Server is restarting.".to_owned()
        })
    );
}
