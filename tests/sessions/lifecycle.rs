//! Connect, play and disconnect against the fake server over loopback UDP.

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
use netchan_client::telemetry::{CollectingObserver, ViolationKind};
use netchan_client::{
    Action, ClientIdAllocator, ConnectionState, DatagramRecorder, GameState, HandshakeStage,
    NetchanError, RecordPhase, Session, SessionBuilder, SessionConfig, World,
};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn session(config: SessionConfig) -> Session<GameState> {
    init_tracing();
    SessionBuilder::new()
        .with_config(config)
        .with_profile("\\name\\tester\\skin\\male/grunt")
        .build()
        .unwrap()
}

#[test]
#[serial]
fn connect_completes_handshake_and_spawns() {
    let server = FakeServer::start(ServerScript::default());
    let session = session(fast_config());

    session.connect("127.0.0.1", server.port()).unwrap();

    assert_eq!(session.state(), ConnectionState::Connected { in_game: true });
    assert!(session.is_spawned());
    let client_id = session.client_id().unwrap();
    assert_eq!(
        server.connectionless(),
        vec![
            "getchallenge".to_owned(),
            format!("connect 34 {client_id} 12345 \"\\name\\tester\\skin\\male/grunt\""),
        ]
    );
    let commands = server.commands();
    assert_eq!(commands[0], "new");
    assert!(commands.contains(&"configstrings 1 0".to_owned()));
    assert!(commands.contains(&"begin 1".to_owned()));
    session.with_world(|world| {
        assert_eq!(world.map_name(), Some("maps/q2dm1.bsp"));
        assert_eq!(world.controlled_entity_number(), Some(1));
        assert!(world.current_frame_number().is_some());
    });
}

#[test]
#[serial]
fn observers_see_advancing_frames() {
    let server = FakeServer::start(ServerScript::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    init_tracing();
    let session: Session = SessionBuilder::new()
        .with_config(fast_config())
        .with_observer(move |world: &GameState| {
            if let Some(frame) = world.current_frame_number() {
                sink.lock().push(frame);
            }
        })
        .build()
        .unwrap();

    session.connect("127.0.0.1", server.port()).unwrap();
    assert!(wait_for(WAIT_TIMEOUT, || seen.lock().len() >= 3));

    let frames = seen.lock().clone();
    assert!(frames.windows(2).all(|pair| pair[0] < pair[1]), "{frames:?}");
}

#[test]
#[serial]
fn late_and_repeated_frames_are_dropped() {
    let server = FakeServer::start(ServerScript::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    init_tracing();
    let session: Session = SessionBuilder::new()
        .with_config(fast_config())
        .with_observer(move |world: &GameState| {
            if let Some(frame) = world.current_frame_number() {
                sink.lock().push(frame);
            }
        })
        .build()
        .unwrap();
    session.connect("127.0.0.1", server.port()).unwrap();
    assert!(wait_for(WAIT_TIMEOUT, || seen.lock().len() >= 3));

    server.send_stale_frame(0, 1);
    server.send_stale_frame(3, 1);
    assert!(wait_for(WAIT_TIMEOUT, || session.stats().stale_dropped >= 2));
    let newest = seen.lock().last().copied().unwrap();

    // Live frames keep coming and the world never steps back to frame 1.
    assert!(wait_for(WAIT_TIMEOUT, || seen
        .lock()
        .last()
        .is_some_and(|&frame| frame > newest)));
    let frames = seen.lock().clone();
    assert!(frames.windows(2).all(|pair| pair[0] < pair[1]), "{frames:?}");
    assert!(session.with_world(|w| w.current_frame_number()) > Some(newest));
}

#[test]
#[serial]
fn observer_added_after_connect_is_called() {
    let server = FakeServer::start(ServerScript::default());
    let session = session(fast_config());
    session.connect("127.0.0.1", server.port()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    session.add_observer(move |_: &GameState| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    assert!(wait_for(WAIT_TIMEOUT, || calls.load(Ordering::Relaxed) >= 2));
}

#[test]
#[serial]
fn moves_and_commands_reach_the_server() {
    let server = FakeServer::start(ServerScript::default());
    let session = session(fast_config());
    session.connect("127.0.0.1", server.port()).unwrap();

    session.set_pending_move([0.0, 90.0, 0.0], [200.0, 0.0, 0.0], Action::attack());
    let before = server.moves();
    assert!(wait_for(WAIT_TIMEOUT, || server.moves() > before + 5));

    session.send_command("say hello").unwrap();
    assert!(server.commands().contains(&"say hello".to_owned()));

    session.send_console_command("inven").unwrap();
    assert!(wait_for(WAIT_TIMEOUT, || server
        .commands()
        .contains(&"inven".to_owned())));

    assert!(session.stats().reliable_acked >= 2);
    assert!(session.stats().packets_received > 0);
}

#[test]
#[serial]
fn disconnect_notifies_server_and_stops() {
    let server = FakeServer::start(ServerScript::default());
    let session = session(fast_config());
    session.connect("127.0.0.1", server.port()).unwrap();

    session.disconnect();

    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!session.is_spawned());
    assert_eq!(session.client_id(), None);
    assert!(wait_for(WAIT_TIMEOUT, || server
        .commands()
        .contains(&"disconnect".to_owned())));
    assert!(matches!(
        session.send_command("say late"),
        Err(NetchanError::InvalidRequest { .. })
    ));
}

#[test]
#[serial]
fn server_disconnect_ends_session() {
    let server = FakeServer::start(ServerScript::default());
    let session = session(fast_config());
    session.connect("127.0.0.1", server.port()).unwrap();

    server.push_message(wire::print(2, "Server quit\n"));
    server.push_message(wire::disconnect());

    assert!(wait_for(WAIT_TIMEOUT, || session.state()
        == ConnectionState::Disconnected));
    assert!(!session.is_spawned());
    // The session can be used again afterwards.
    session.connect("127.0.0.1", server.port()).unwrap();
    assert!(session.is_spawned());
}

#[test]
#[serial]
fn rejected_connection_is_reported() {
    let server = FakeServer::start(ServerScript {
        reject: Some("Server is full.".to_owned()),
        ..ServerScript::default()
    });
    let session = session(fast_config());

    let err = session.connect("127.0.0.1", server.port()).unwrap_err();

    assert_eq!(
        err,
        NetchanError::HandshakeRejected {
            reason: "Server is full.".to_owned()
        }
    );
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[test]
#[serial]
fn silent_server_times_out() {
    let server = FakeServer::start(ServerScript {
        silent: true,
        ..ServerScript::default()
    });
    let session = session(SessionConfig {
        handshake_timeout: Duration::from_millis(300),
        handshake_resend_interval: Duration::from_millis(50),
        ..fast_config()
    });

    let err = session.connect("127.0.0.1", server.port()).unwrap_err();

    assert_eq!(
        err,
        NetchanError::HandshakeTimeout {
            stage: HandshakeStage::AwaitingChallenge
        }
    );
    assert!(server.connectionless().len() >= 2);
}

#[test]
#[serial]
fn player_that_never_spawns_times_out() {
    let server = FakeServer::start(ServerScript {
        spawn: false,
        ..ServerScript::default()
    });
    let session = session(SessionConfig {
        spawn_timeout: Some(Duration::from_millis(400)),
        ..fast_config()
    });

    let err = session.connect("127.0.0.1", server.port()).unwrap_err();

    assert_eq!(err, NetchanError::SpawnTimeout);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.last_failure(), Some(NetchanError::SpawnTimeout));
}

#[test]
#[serial]
fn dead_player_is_not_spawned() {
    let server = FakeServer::start(ServerScript {
        move_type: 2,
        ..ServerScript::default()
    });
    let session = session(SessionConfig {
        spawn_timeout: Some(Duration::from_millis(400)),
        ..fast_config()
    });

    assert_eq!(
        session.connect("127.0.0.1", server.port()),
        Err(NetchanError::SpawnTimeout)
    );
}

#[test]
#[serial]
fn connecting_twice_is_refused() {
    let server = FakeServer::start(ServerScript::default());
    let session = session(fast_config());
    session.connect("127.0.0.1", server.port()).unwrap();

    assert!(matches!(
        session.connect("127.0.0.1", server.port()),
        Err(NetchanError::InvalidRequest { .. })
    ));
    assert!(session.state().is_in_game());
}

#[test]
#[serial]
fn unknown_messages_are_reported_and_skipped() {
    let server = FakeServer::start(ServerScript::default());
    let violations = Arc::new(CollectingObserver::new());
    init_tracing();
    let session: Session = SessionBuilder::new()
        .with_config(fast_config())
        .with_violation_observer(violations.clone())
        .build()
        .unwrap();
    session.connect("127.0.0.1", server.port()).unwrap();

    server.push_message(vec![99, 1, 2, 3]);

    assert!(wait_for(WAIT_TIMEOUT, || violations
        .has_violation(ViolationKind::NetworkProtocol)));
    assert!(wait_for(WAIT_TIMEOUT, || session
        .with_world(|w| w.bad_message_count())
        >= 1));
    // Later frames still arrive.
    let frame = session.with_world(|w| w.current_frame_number());
    assert!(wait_for(WAIT_TIMEOUT, || session
        .with_world(|w| w.current_frame_number())
        > frame));
    assert!(session.state().is_in_game());
}

#[derive(Default)]
struct MemoryRecorder {
    phases: Mutex<Vec<RecordPhase>>,
    flushes: AtomicUsize,
}

impl DatagramRecorder for MemoryRecorder {
    fn record(&self, phase: RecordPhase, datagram: &[u8]) {
        assert!(datagram.len() >= 8);
        self.phases.lock().push(phase);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
#[serial]
fn recorder_sees_header_then_game_datagrams() {
    let server = FakeServer::start(ServerScript::default());
    let recorder = Arc::new(MemoryRecorder::default());
    init_tracing();
    let session: Session = SessionBuilder::new()
        .with_config(fast_config())
        .with_recorder(Arc::clone(&recorder))
        .build()
        .unwrap();
    session.connect("127.0.0.1", server.port()).unwrap();
    assert!(wait_for(WAIT_TIMEOUT, || recorder
        .phases
        .lock()
        .contains(&RecordPhase::InGame)));
    session.disconnect();

    let phases = recorder.phases.lock().clone();
    assert_eq!(phases[0], RecordPhase::PreGameHeader);
    let first_in_game = phases
        .iter()
        .position(|&p| p == RecordPhase::InGame)
        .unwrap();
    assert!(phases[first_in_game..]
        .iter()
        .all(|&p| p == RecordPhase::InGame));
    assert!(recorder.flushes.load(Ordering::Relaxed) >= 1);
}

#[test]
#[serial]
fn high_thread_safety_mode_serves_consistent_reads() {
    let server = FakeServer::start(ServerScript::default());
    let session = session(SessionConfig {
        high_thread_safety: true,
        ..fast_config()
    });
    session.add_observer(|world: &GameState| {
        assert!(world.current_frame_number().is_some());
    });
    session.connect("127.0.0.1", server.port()).unwrap();

    for _ in 0..50 {
        session.with_world(|world| {
            // Every applied datagram carries frame, player and entities together.
            assert!(world.current_frame_number().is_some());
            assert!(world.controlled_entity().is_some());
        });
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
#[serial]
fn client_id_is_leased_for_the_connection() {
    let server = FakeServer::start(ServerScript::default());
    let allocator = ClientIdAllocator::with_seed(11);
    init_tracing();
    let session: Session = SessionBuilder::new()
        .with_config(fast_config())
        .with_client_id_allocator(allocator.clone())
        .build()
        .unwrap();

    session.connect("127.0.0.1", server.port()).unwrap();
    assert_eq!(allocator.in_use(), 1);
    assert!(session.client_id().is_some());

    session.disconnect();
    assert_eq!(allocator.in_use(), 0);
    assert_eq!(session.client_id(), None);
}
