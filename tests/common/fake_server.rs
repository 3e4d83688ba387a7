//! A scripted protocol 34 server for integration tests.
//!
//! The server answers the challenge handshake, tracks the client's reliable
//! parity the way a real server does and walks the client through the level
//! load (`new` → server data → `configstrings` → `precache` → `begin`). Once
//! the client has sent `begin`, it sends a frame with the player and its
//! entity every tick.
//!
//! Extra messages can be queued with [`FakeServer::push_message`]; they go
//! out reliably on the next tick.

#![allow(dead_code)] // Each integration crate uses a different subset.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::wire;

const TICK: Duration = Duration::from_millis(20);
const RELIABLE_BIT: u32 = 1 << 31;
const CLIENT_OP_NOP: u8 = 1;
const CLIENT_OP_MOVE: u8 = 2;
const CLIENT_OP_USER_INFO: u8 = 3;
const CLIENT_OP_STRING_COMMAND: u8 = 4;
const MOVE_SIZE: usize = 21;

/// How the fake server behaves.
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// Token sent in the challenge reply.
    pub challenge: i64,
    /// Refuse connections with this reason.
    pub reject: Option<String>,
    /// Ignore handshake requests entirely.
    pub silent: bool,
    /// Send entity snapshots after `begin`. Without them the player never
    /// spawns.
    pub spawn: bool,
    /// Movement type reported for the player (0 is normal, 2 dead).
    pub move_type: u8,
    /// Player slot; the controlled entity is this plus one.
    pub player_num: i16,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            challenge: 12345,
            reject: None,
            silent: false,
            spawn: true,
            move_type: 0,
            player_num: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    client: Option<SocketAddr>,
    out_seq: u32,
    client_seq: u32,
    last_client_reliable: u32,
    client_parity: bool,
    in_game: bool,
    server_frame: i32,
    server_count: i32,
    queued: Vec<Vec<u8>>,
    connectionless: Vec<String>,
    commands: Vec<String>,
    moves: usize,
    connects: usize,
}

struct Shared {
    script: Mutex<ServerScript>,
    state: Mutex<ServerState>,
    stop: AtomicBool,
}

/// Handle to a running fake server. Stops when dropped.
pub struct FakeServer {
    addr: SocketAddr,
    socket: UdpSocket,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl FakeServer {
    /// Starts a server on an ephemeral loopback port.
    pub fn start(script: ServerScript) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind fake server");
        socket
            .set_read_timeout(Some(Duration::from_millis(2)))
            .expect("set read timeout");
        let addr = socket.local_addr().expect("local addr");
        let shared = Arc::new(Shared {
            script: Mutex::new(script),
            state: Mutex::new(ServerState::default()),
            stop: AtomicBool::new(false),
        });
        let worker = Arc::clone(&shared);
        let sender = socket.try_clone().expect("clone fake server socket");
        let handle = thread::Builder::new()
            .name("fake-server".to_owned())
            .spawn(move || run(&socket, &worker))
            .expect("spawn fake server");
        Self {
            addr,
            socket: sender,
            shared,
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queues a message for the next tick.
    pub fn push_message(&self, message: Vec<u8>) {
        self.shared.state.lock().queued.push(message);
    }

    /// Sends a snapshot of `server_frame` under a sequence `behind` steps
    /// older than the newest one sent, as if the network had delayed it.
    /// With `behind == 0` it repeats the newest sequence.
    pub fn send_stale_frame(&self, behind: u32, server_frame: i32) {
        let state = self.shared.state.lock();
        let Some(client) = state.client else {
            return;
        };
        let seq_a = state.out_seq.saturating_sub(behind).max(1);
        let seq_b = state.client_seq | if state.client_parity { RELIABLE_BIT } else { 0 };
        let messages = vec![
            wire::frame(server_frame),
            wire::player_info(0),
            wire::packet_entities(&[1]),
        ];
        self.socket
            .send_to(&wire::datagram(seq_a, seq_b, &messages), client)
            .expect("send stale frame");
    }

    /// Changes the script for subsequent datagrams.
    pub fn set_script(&self, script: ServerScript) {
        *self.shared.script.lock() = script;
    }

    /// Connectionless requests received, in order.
    pub fn connectionless(&self) -> Vec<String> {
        self.shared.state.lock().connectionless.clone()
    }

    /// String commands received, retransmissions excluded.
    pub fn commands(&self) -> Vec<String> {
        self.shared.state.lock().commands.clone()
    }

    /// Move payloads received.
    pub fn moves(&self) -> usize {
        self.shared.state.lock().moves
    }

    /// Accepted connect requests.
    pub fn connects(&self) -> usize {
        self.shared.state.lock().connects
    }

    /// Whether the client has entered the game on its current connection.
    pub fn client_in_game(&self) -> bool {
        self.shared.state.lock().in_game
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(socket: &UdpSocket, shared: &Shared) {
    let mut buf = [0u8; 4096];
    let mut next_tick = Instant::now() + TICK;
    while !shared.stop.load(Ordering::Acquire) {
        if let Ok((len, from)) = socket.recv_from(&mut buf) {
            handle_datagram(socket, shared, &buf[..len], from);
        }
        if Instant::now() >= next_tick {
            next_tick += TICK;
            tick(socket, shared);
        }
    }
}

fn handle_datagram(socket: &UdpSocket, shared: &Shared, datagram: &[u8], from: SocketAddr) {
    if datagram.len() < 4 {
        return;
    }
    let seq_a = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    if seq_a == u32::MAX {
        let text = String::from_utf8_lossy(&datagram[4..]).into_owned();
        handle_connectionless(socket, shared, &text, from);
        return;
    }
    if datagram.len() < 8 {
        return;
    }

    let script = shared.script.lock().clone();
    let mut state = shared.state.lock();
    if state.client != Some(from) {
        // A sequenced frame from an address that never completed the handshake.
        return;
    }
    let value = seq_a & !RELIABLE_BIT;
    let reliable = seq_a & RELIABLE_BIT != 0;
    if value <= state.client_seq {
        // Retransmission: already processed, acknowledge again.
        if reliable {
            send_frame(socket, &mut state, Vec::new());
        }
        return;
    }
    state.client_seq = value;
    if reliable && value > state.last_client_reliable {
        state.last_client_reliable = value;
        state.client_parity = !state.client_parity;
    }

    let mut payload = &datagram[8..];
    while let Some((&op, rest)) = payload.split_first() {
        match op {
            CLIENT_OP_NOP => payload = rest,
            CLIENT_OP_MOVE if payload.len() >= MOVE_SIZE => {
                state.moves += 1;
                payload = &payload[MOVE_SIZE..];
            },
            CLIENT_OP_STRING_COMMAND | CLIENT_OP_USER_INFO => {
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                let text = String::from_utf8_lossy(&rest[..end]).into_owned();
                payload = rest.get(end + 1..).unwrap_or(&[]);
                if op == CLIENT_OP_STRING_COMMAND {
                    handle_command(&script, &mut state, &text);
                }
            },
            _ => break,
        }
    }

    if reliable {
        let queued = std::mem::take(&mut state.queued);
        send_frame(socket, &mut state, queued);
    }
}

fn handle_connectionless(socket: &UdpSocket, shared: &Shared, text: &str, from: SocketAddr) {
    let script = shared.script.lock().clone();
    let mut state = shared.state.lock();
    state.connectionless.push(text.to_owned());
    if script.silent {
        return;
    }
    let reply = if text == "getchallenge" {
        format!("challenge {}", script.challenge)
    } else if text.starts_with("connect ") {
        if let Some(reason) = &script.reject {
            format!("print\n{reason}\n")
        } else {
            let connects = state.connects + 1;
            let server_count = state.server_count + 1;
            // A fresh connection; only the request history survives.
            let fresh = ServerState {
                client: Some(from),
                connects,
                server_count,
                connectionless: std::mem::take(&mut state.connectionless),
                commands: std::mem::take(&mut state.commands),
                moves: state.moves,
                ..ServerState::default()
            };
            *state = fresh;
            "client_connect".to_owned()
        }
    } else {
        return;
    };
    let _ = socket.send_to(&wire::connectionless(&reply), from);
}

fn handle_command(script: &ServerScript, state: &mut ServerState, command: &str) {
    state.commands.push(command.to_owned());
    let server_count = state.server_count;
    match command {
        "new" => {
            state.in_game = false;
            state.queued.push(wire::server_data(server_count, script.player_num, "The Edge"));
            state
                .queued
                .push(wire::stuff_text(&format!("cmd configstrings {server_count} 0\n")));
        },
        c if c.starts_with("configstrings ") => {
            state.queued.push(wire::config_string(33, "maps/q2dm1.bsp"));
            state
                .queued
                .push(wire::stuff_text(&format!("precache {server_count}\n")));
        },
        c if c.starts_with("begin") => state.in_game = script.spawn,
        "disconnect" => state.in_game = false,
        _ => {},
    }
}

fn tick(socket: &UdpSocket, shared: &Shared) {
    let script = shared.script.lock().clone();
    let mut state = shared.state.lock();
    if state.client.is_none() {
        return;
    }
    let mut messages = std::mem::take(&mut state.queued);
    if state.in_game {
        state.server_frame += 1;
        let entity = (script.player_num + 1) as u8;
        messages.push(wire::frame(state.server_frame));
        messages.push(wire::player_info(script.move_type));
        messages.push(wire::packet_entities(&[entity]));
    }
    if !messages.is_empty() {
        send_frame(socket, &mut state, messages);
    }
}

fn send_frame(socket: &UdpSocket, state: &mut ServerState, messages: Vec<Vec<u8>>) {
    let Some(client) = state.client else {
        return;
    };
    state.out_seq += 1;
    let reliable = messages
        .iter()
        .any(|m| m.first().is_some_and(|&tag| tag != 20 && tag != 17 && tag != 18));
    let seq_a = state.out_seq | if reliable { RELIABLE_BIT } else { 0 };
    let seq_b = state.client_seq | if state.client_parity { RELIABLE_BIT } else { 0 };
    let _ = socket.send_to(&wire::datagram(seq_a, seq_b, &messages), client);
}
