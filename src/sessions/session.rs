//! The client session: handshake, background worker and reconnection.
//!
//! A [`Session`] owns one connection at a time. [`connect`](Session::connect)
//! runs the handshake on the caller's thread, sends the reliable `new`
//! command and hands the transport to a worker thread that loops:
//!
//! ```text
//! receive ─> record ─> decode ─> apply to world ─> session commands
//!    ^                                                  │
//!    └──── yield <── send pending move <── notify observers (frame advanced)
//! ```
//!
//! Each connection gets a generation number. Threads belonging to an older
//! generation stop touching shared state and exit, which is how a reconnect
//! replaces the worker and how [`disconnect`](Session::disconnect) stops it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};
use web_time::{Duration, Instant};

use crate::network::commands::{Action, ClientPayload, MoveCommand};
use crate::network::frame::{is_connectionless_datagram, ServerFrame};
use crate::network::messages::{MessageCatalog, ServerMessage};
use crate::network::network_stats::NetworkStats;
use crate::network::transport::Transport;
use crate::recorder::{DatagramRecorder, RecordPhase};
use crate::report_violation_to;
use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::sessions::client_id::{ClientIdAllocator, ClientIdLease};
use crate::sessions::config::SessionConfig;
use crate::sessions::handshake;
use crate::sessions::state::ConnectionState;
use crate::telemetry::{
    report_to_observer, Violation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::world::{GameState, World, WorldObserver};
use crate::NetchanError;

/// Longest duration a single move may claim.
const MAX_MOVE_MSEC: u128 = 250;

/// Slice the reconnect back-off sleeps in, so a disconnect is noticed.
const BACKOFF_SLICE: Duration = Duration::from_millis(20);

/// Something the session must do in response to server messages, performed
/// after the world lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionAction {
    SendReliable(String),
    Disconnect,
    Reconnect,
}

/// Translates the session-level messages of a datagram into actions.
fn collect_actions(message: &ServerMessage, actions: &mut Vec<SessionAction>) {
    match message {
        ServerMessage::Disconnect => actions.push(SessionAction::Disconnect),
        ServerMessage::Reconnect => actions.push(SessionAction::Reconnect),
        ServerMessage::StuffText(text) => stuff_text_actions(text, actions),
        _ => {},
    }
}

/// Interprets the console text a server asks the client to execute.
///
/// Only the commands that drive the connection forward are understood:
/// `cmd` forwards its arguments to the server, `precache` is answered with
/// `begin`, `reconnect` restarts the handshake. Everything else is ignored.
fn stuff_text_actions(text: &str, actions: &mut Vec<SessionAction>) {
    for line in text.split(['\n', ';']) {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match command {
            "" => {},
            "cmd" if !rest.is_empty() => actions.push(SessionAction::SendReliable(rest.to_owned())),
            "precache" => {
                let begin = match rest.split_whitespace().next() {
                    Some(spawn_count) => format!("begin {spawn_count}"),
                    None => "begin".to_owned(),
                };
                actions.push(SessionAction::SendReliable(begin));
            },
            "reconnect" => actions.push(SessionAction::Reconnect),
            "changing" => debug!("server is changing map"),
            _ => trace!(line, "ignoring stuffed command"),
        }
    }
}

/// Whether applying a datagram moved the world to a newer frame.
fn frame_advanced(before: Option<i32>, after: Option<i32>) -> bool {
    match (before, after) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(before), Some(after)) => after > before,
    }
}

#[derive(Debug, Default)]
struct Status {
    state: ConnectionState,
    spawned: bool,
    failure: Option<NetchanError>,
}

/// Everything the builder hands to a new session.
pub(crate) struct SessionParts<W: World> {
    pub(crate) config: SessionConfig,
    pub(crate) profile: String,
    pub(crate) catalog: MessageCatalog,
    pub(crate) allocator: ClientIdAllocator,
    pub(crate) recorder: Option<Arc<dyn DatagramRecorder>>,
    pub(crate) observers: Vec<Arc<dyn WorldObserver<W>>>,
    pub(crate) violation_observer: Option<Arc<dyn ViolationObserver>>,
}

struct Shared<W: World> {
    config: SessionConfig,
    profile: String,
    catalog: MessageCatalog,
    allocator: ClientIdAllocator,
    recorder: Option<Arc<dyn DatagramRecorder>>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    observers: Mutex<Vec<Arc<dyn WorldObserver<W>>>>,
    lease: Mutex<Option<ClientIdLease>>,
    endpoint: Mutex<Option<(String, u16)>>,
    transport: Mutex<Option<Arc<Transport>>>,
    world: Mutex<W>,
    /// Held across one datagram's application in high thread-safety mode.
    iteration_lock: Mutex<()>,
    status: Mutex<Status>,
    status_changed: Condvar,
    pending_move: Mutex<MoveCommand>,
    rng: Mutex<Pcg32>,
    running: AtomicBool,
    generation: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A client connection to one game server.
///
/// Created by [`SessionBuilder`](crate::SessionBuilder). The session may be
/// shared between threads; all methods take `&self`. Dropping it
/// disconnects.
pub struct Session<W: World = GameState> {
    shared: Arc<Shared<W>>,
}

impl<W: World> std::fmt::Debug for Session<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<W: World> Session<W> {
    pub(crate) fn from_parts(parts: SessionParts<W>) -> Self {
        let rng = match parts.config.rng_seed {
            Some(seed) => Pcg32::seed_from_u64(seed),
            None => Pcg32::from_entropy(),
        };
        Self {
            shared: Arc::new(Shared {
                config: parts.config,
                profile: parts.profile,
                catalog: parts.catalog,
                allocator: parts.allocator,
                recorder: parts.recorder,
                violation_observer: parts.violation_observer,
                observers: Mutex::new(parts.observers),
                lease: Mutex::new(None),
                endpoint: Mutex::new(None),
                transport: Mutex::new(None),
                world: Mutex::new(W::default()),
                iteration_lock: Mutex::new(()),
                status: Mutex::new(Status::default()),
                status_changed: Condvar::new(),
                pending_move: Mutex::new(MoveCommand::default()),
                rng: Mutex::new(rng),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connects to `host:port` and blocks until the player has spawned.
    ///
    /// # Errors
    ///
    /// - [`NetchanError::InvalidRequest`] if the session is already running.
    /// - [`NetchanError::ResolveFailed`] / [`NetchanError::SocketError`] if
    ///   the socket could not be opened.
    /// - [`NetchanError::HandshakeTimeout`] / [`NetchanError::HandshakeRejected`]
    ///   if the server did not accept the connection.
    /// - [`NetchanError::SpawnTimeout`] if the player did not spawn within
    ///   [`SessionConfig::spawn_timeout`]; the session is disconnected.
    pub fn connect(&self, host: &str, port: u16) -> Result<(), NetchanError> {
        let shared = &self.shared;
        if shared.running.swap(true, Ordering::AcqRel) {
            return Err(NetchanError::InvalidRequest {
                info: format!("session is already {}", self.state()),
            });
        }
        shared.join_workers();

        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *shared.endpoint.lock() = Some((host.to_owned(), port));
        {
            let mut status = shared.status.lock();
            *status = Status::default();
        }
        info!(host, port, "connecting");

        if let Err(err) = shared.start(generation) {
            shared.fail(generation, err.clone());
            shared.running.store(false, Ordering::Release);
            shared.close_transport();
            return Err(err);
        }

        match shared.wait_for_spawn(shared.config.spawn_timeout) {
            Ok(()) => {
                info!(host, port, client_id = ?self.client_id(), "spawned");
                Ok(())
            },
            Err(err) => {
                warn!("connect failed: {}", err);
                self.disconnect();
                shared.status.lock().failure = Some(err.clone());
                Err(err)
            },
        }
    }

    /// Leaves the server and stops the worker.
    ///
    /// Sends an unreliable `disconnect`, closes the socket and joins the
    /// worker threads. Calling it on a session that is not connected only
    /// releases resources.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let was_running = shared.running.swap(false, Ordering::AcqRel);
        shared.generation.fetch_add(1, Ordering::AcqRel);

        let transport = shared.transport.lock().clone();
        if let Some(transport) = transport {
            if was_running && !transport.is_closed() {
                transport.send_unreliable(&[ClientPayload::StringCommand("disconnect".to_owned())]);
            }
            transport.close();
        }
        shared.join_workers();

        {
            let mut status = shared.status.lock();
            if status.state != ConnectionState::Idle {
                status.state = ConnectionState::Disconnected;
            }
            status.spawned = false;
            shared.status_changed.notify_all();
        }
        if let Some(recorder) = &shared.recorder {
            recorder.flush();
        }
        *shared.lease.lock() = None;
        if was_running {
            info!("disconnected");
        }
    }

    /// Sends a console command reliably, blocking until the server
    /// acknowledges it.
    ///
    /// # Errors
    ///
    /// [`NetchanError::InvalidRequest`] when not connected, otherwise the
    /// errors of [`Transport::send_reliable`].
    pub fn send_command(&self, command: &str) -> Result<(), NetchanError> {
        let transport = self.live_transport()?;
        let retransmissions =
            transport.send_reliable(&ClientPayload::StringCommand(command.to_owned()))?;
        debug!(command, retransmissions, "command acknowledged");
        Ok(())
    }

    /// Sends a console command in one unreliable frame.
    ///
    /// # Errors
    ///
    /// [`NetchanError::InvalidRequest`] when not connected.
    pub fn send_console_command(&self, command: &str) -> Result<(), NetchanError> {
        let transport = self.live_transport()?;
        transport.send_unreliable(&[ClientPayload::StringCommand(command.to_owned())]);
        Ok(())
    }

    /// Replaces the move the worker sends every iteration.
    ///
    /// Only the latest call before a worker iteration takes effect, and the
    /// move keeps being sent until replaced.
    pub fn set_pending_move(&self, angles: [f32; 3], velocity: [f32; 3], action: Action) {
        *self.shared.pending_move.lock() = MoveCommand::new(angles, velocity, action);
    }

    /// The move the worker is currently sending.
    #[must_use]
    pub fn pending_move(&self) -> MoveCommand {
        *self.shared.pending_move.lock()
    }

    /// Registers an observer called after every datagram that advanced the
    /// world's frame number.
    ///
    /// Observers run on the worker thread while the world is locked, so
    /// they must not call [`with_world`](Self::with_world).
    pub fn add_observer(&self, observer: impl WorldObserver<W> + 'static) {
        self.shared.observers.lock().push(Arc::new(observer));
    }

    /// Runs `f` with the current world.
    ///
    /// With [`SessionConfig::high_thread_safety`] the worker is held off for
    /// the whole datagram it is applying, so `f` sees the world between
    /// datagrams. Otherwise it may see a datagram half applied.
    pub fn with_world<R>(&self, f: impl FnOnce(&W) -> R) -> R {
        let _iteration = self.shared.iteration_guard();
        let world = self.shared.world.lock();
        f(&world)
    }

    /// The current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    /// Whether the controlled player is present and alive.
    #[must_use]
    pub fn is_spawned(&self) -> bool {
        self.shared.status.lock().spawned
    }

    /// Blocks until the player is spawned, the session disconnects or
    /// `timeout` passes. Returns whether the player is spawned.
    ///
    /// Useful after a map change, while the session reconnects on its own.
    pub fn wait_until_spawned(&self, timeout: Duration) -> bool {
        self.shared.wait_for_spawn(Some(timeout)).is_ok()
    }

    /// Why the session last became disconnected on its own, if it did.
    #[must_use]
    pub fn last_failure(&self) -> Option<NetchanError> {
        self.shared.status.lock().failure.clone()
    }

    /// Interval between the two most recent inbound datagrams.
    #[must_use]
    pub fn ping(&self) -> Duration {
        self.shared
            .transport
            .lock()
            .as_ref()
            .map_or(Duration::ZERO, |t| t.ping())
    }

    /// Traffic counters of the current (or last) connection.
    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        self.shared
            .transport
            .lock()
            .as_ref()
            .map(|t| t.stats())
            .unwrap_or_default()
    }

    /// The client id of the current connection.
    #[must_use]
    pub fn client_id(&self) -> Option<u16> {
        self.shared.lease.lock().as_ref().map(ClientIdLease::id)
    }

    /// The configuration this session runs with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    fn live_transport(&self) -> Result<Arc<Transport>, NetchanError> {
        let state = self.state();
        if !state.is_connected() {
            return Err(NetchanError::InvalidRequest {
                info: format!("cannot send commands while {state}"),
            });
        }
        self.shared
            .transport
            .lock()
            .clone()
            .ok_or_else(|| NetchanError::InvalidRequest {
                info: "no open transport".to_owned(),
            })
    }
}

impl<W: World> Drop for Session<W> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<W: World> Shared<W> {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn iteration_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.config
            .high_thread_safety
            .then(|| self.iteration_lock.lock())
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        let mut status = self.status.lock();
        if !self.is_current(generation) || status.state == state {
            return;
        }
        debug!(from = %status.state, to = %state, "state change");
        status.state = state;
        if !state.is_connected() {
            status.spawned = false;
        }
        self.status_changed.notify_all();
    }

    fn fail(&self, generation: u64, err: NetchanError) {
        let mut status = self.status.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.running.store(false, Ordering::Release);
        status.state = ConnectionState::Disconnected;
        status.spawned = false;
        status.failure = Some(err);
        self.status_changed.notify_all();
    }

    fn wait_for_spawn(&self, timeout: Option<Duration>) -> Result<(), NetchanError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = self.status.lock();
        loop {
            if status.spawned {
                return Ok(());
            }
            if status.state == ConnectionState::Disconnected {
                return Err(status.failure.clone().unwrap_or(NetchanError::TransportClosed));
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(NetchanError::SpawnTimeout);
                    }
                    self.status_changed.wait_for(&mut status, deadline - now);
                },
                None => self.status_changed.wait(&mut status),
            }
        }
    }

    fn close_transport(&self) {
        if let Some(transport) = self.transport.lock().as_ref() {
            transport.close();
        }
    }

    /// Publishes `transport` as the session's transport, closing the one it
    /// replaces. Refused once the generation is stale.
    fn install_transport(&self, generation: u64, transport: &Arc<Transport>) -> bool {
        let mut slot = self.transport.lock();
        if !self.is_current(generation) {
            transport.close();
            return false;
        }
        if let Some(old) = slot.replace(Arc::clone(transport)) {
            old.close();
        }
        true
    }

    /// Opens a transport, runs the handshake, resets the world and asks the
    /// server for the level.
    fn establish(&self, generation: u64) -> Result<Arc<Transport>, NetchanError> {
        let (host, port) = self
            .endpoint
            .lock()
            .clone()
            .ok_or_else(|| NetchanError::InvalidRequest {
                info: "no server address".to_owned(),
            })?;
        let client_id = {
            let mut lease = self.lease.lock();
            match &*lease {
                Some(held) => held.id(),
                None => {
                    let fresh = self.allocator.allocate()?;
                    let id = fresh.id();
                    *lease = Some(fresh);
                    id
                },
            }
        };

        self.set_state(generation, ConnectionState::AwaitingChallenge);
        let mut transport = Transport::connect(&host, port, self.config.transport)?;
        if let Some(observer) = &self.violation_observer {
            transport = transport.with_violation_observer(Arc::clone(observer));
        }
        let transport = Arc::new(transport);
        if !self.install_transport(generation, &transport) {
            return Err(NetchanError::TransportClosed);
        }

        handshake::perform(
            &transport,
            &self.config,
            client_id,
            &self.profile,
            &self.violation_observer,
            |state| self.set_state(generation, state),
        )?;

        {
            let _iteration = self.iteration_guard();
            *self.world.lock() = W::default();
        }
        self.set_state(generation, ConnectionState::Connected { in_game: false });
        info!(%host, port, client_id, "connection accepted");

        transport.send_reliable(&ClientPayload::StringCommand("new".to_owned()))?;
        Ok(transport)
    }

    fn spawn_thread(
        &self,
        name: &str,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<(), NetchanError> {
        let handle = thread::Builder::new().name(name.to_owned()).spawn(body)?;
        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
        Ok(())
    }

    /// Joins every worker except the calling thread.
    fn join_workers(&self) {
        let current = thread::current().id();
        loop {
            let handles = std::mem::take(&mut *self.workers.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    report_violation_to!(
                        &self.violation_observer,
                        ViolationSeverity::Critical,
                        ViolationKind::InternalError,
                        "session worker panicked"
                    );
                }
            }
        }
    }

    /// Waits a random back-off before reconnecting. Returns false if the
    /// session moved on meanwhile.
    fn sleep_backoff(&self, generation: u64) -> bool {
        let min = self.config.reconnect_backoff_min.as_millis();
        let max = self.config.reconnect_backoff_max.as_millis();
        let millis = self.rng.lock().gen_range_inclusive(
            u32::try_from(min).unwrap_or(u32::MAX),
            u32::try_from(max).unwrap_or(u32::MAX),
        );
        debug!(millis, "reconnect back-off");
        let deadline = Instant::now() + Duration::from_millis(u64::from(millis));
        loop {
            if !self.is_current(generation) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(BACKOFF_SLICE));
        }
    }

    fn update_status(&self, generation: u64, saw_snapshot: bool, spawned: bool) {
        let mut status = self.status.lock();
        if !self.is_current(generation) {
            return;
        }
        let mut changed = false;
        if saw_snapshot && status.state == (ConnectionState::Connected { in_game: false }) {
            debug!("first entity snapshot, in game");
            status.state = ConnectionState::Connected { in_game: true };
            changed = true;
        }
        let spawned = spawned && status.state.is_connected();
        if status.spawned != spawned {
            debug!(spawned, "spawn state changed");
            status.spawned = spawned;
            changed = true;
        }
        if changed {
            self.status_changed.notify_all();
        }
    }

    fn send_move(&self, transport: &Transport, last_move: &mut Instant) {
        if !self.config.send_moves_before_spawn && !self.status.lock().spawned {
            return;
        }
        let now = Instant::now();
        let msec = (now - *last_move).as_millis().clamp(1, MAX_MOVE_MSEC) as u8;
        *last_move = now;
        let last_frame = self.world.lock().current_frame_number().unwrap_or(-1);
        let command = *self.pending_move.lock();
        transport.send_unreliable(&[ClientPayload::Move(command.to_payload(last_frame, msec))]);
    }
}

impl<W: World> Shared<W> {
    /// First connection: handshake on the caller's thread, then the worker.
    fn start(self: &Arc<Self>, generation: u64) -> Result<(), NetchanError> {
        let transport = self.establish(generation)?;
        let shared = Arc::clone(self);
        self.spawn_thread("netchan-worker", move || shared.run(generation, &transport))
    }

    /// Replaces the connection after the server announced a map change.
    fn begin_reconnect(self: &Arc<Self>, generation: u64, transport: &Transport) {
        if !self.running.load(Ordering::Acquire)
            || self
                .generation
                .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        let generation = generation + 1;
        info!("server requested reconnect");
        transport.close();
        self.set_state(generation, ConnectionState::AwaitingChallenge);

        let shared = Arc::clone(self);
        let spawned = self.spawn_thread("netchan-reconnect", move || {
            if !shared.sleep_backoff(generation) {
                return;
            }
            match shared.establish(generation) {
                Ok(transport) => {
                    info!("reconnected");
                    shared.run(generation, &transport);
                },
                Err(err) => {
                    warn!("reconnect failed: {}", err);
                    shared.fail(generation, err);
                    shared.close_transport();
                },
            }
        });
        if let Err(err) = spawned {
            self.fail(generation, err);
        }
    }

    /// The server ended the connection.
    fn server_disconnect(&self, generation: u64, transport: &Transport) {
        {
            let mut status = self.status.lock();
            if !self.is_current(generation) {
                return;
            }
            self.running.store(false, Ordering::Release);
            status.state = ConnectionState::Disconnected;
            status.spawned = false;
            self.status_changed.notify_all();
        }
        info!("server closed the connection");
        transport.close();
        if let Some(recorder) = &self.recorder {
            recorder.flush();
        }
    }

    fn run(self: &Arc<Self>, generation: u64, transport: &Arc<Transport>) {
        debug!(generation, "worker started");
        let mut last_move = Instant::now();
        while self.is_current(generation) {
            match transport.receive_data() {
                Ok(Some(datagram)) => {
                    if !self.handle_datagram(generation, transport, &datagram) {
                        break;
                    }
                },
                Ok(None) => {},
                Err(NetchanError::TransportClosed) => break,
                Err(err) => {
                    debug!("receive failed: {}", err);
                    thread::sleep(self.config.transport.poll_interval);
                },
            }
            if self.is_current(generation) {
                self.send_move(transport, &mut last_move);
            }
            thread::yield_now();
        }
        debug!(generation, "worker stopped");
    }

    /// Processes one inbound datagram. Returns false when the worker should
    /// stop.
    fn handle_datagram(
        self: &Arc<Self>,
        generation: u64,
        transport: &Transport,
        datagram: &[u8],
    ) -> bool {
        if is_connectionless_datagram(datagram) {
            trace!("ignoring connectionless datagram on an open connection");
            return true;
        }
        if let Some(recorder) = &self.recorder {
            let phase = if self.status.lock().state.is_in_game() {
                RecordPhase::InGame
            } else {
                RecordPhase::PreGameHeader
            };
            recorder.record(phase, datagram);
        }

        let frame = match ServerFrame::decode(datagram, &self.catalog) {
            Ok(frame) => frame,
            Err(err) => {
                report_violation_to!(
                    &self.violation_observer,
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "undecodable datagram of {} bytes: {}",
                    datagram.len(),
                    err
                );
                return true;
            },
        };
        trace!(seq = %frame.seq_a, messages = frame.messages.len(), "server frame");
        for decoded in &frame.messages {
            if let ServerMessage::Bad { tag, bytes, .. } = &decoded.message {
                let violation = Violation::new(
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    format!("undecodable message, {} bytes skipped", bytes.len()),
                    concat!(file!(), ":", line!()),
                )
                .with_sequence(frame.seq_a)
                .with_context("tag", tag.to_string())
                .with_context("offset", decoded.offset.to_string());
                report_to_observer(self.violation_observer.as_ref(), &violation);
            }
        }

        let mut actions = Vec::new();
        let mut saw_snapshot = false;
        let spawned = {
            let _iteration = self.iteration_guard();
            let before = self.world.lock().current_frame_number();
            for decoded in &frame.messages {
                self.world.lock().apply(&decoded.message);
                saw_snapshot |= decoded.message.is_entity_snapshot();
                collect_actions(&decoded.message, &mut actions);
            }
            let world = self.world.lock();
            let after = world.current_frame_number();
            if frame_advanced(before, after)
                && !actions.contains(&SessionAction::Disconnect)
                && self.is_current(generation)
            {
                let observers = self.observers.lock().clone();
                for observer in &observers {
                    observer.on_world_update(&world);
                }
            }
            world.is_spawned()
        };
        self.update_status(generation, saw_snapshot, spawned);

        for action in actions {
            match action {
                SessionAction::SendReliable(command) => {
                    match transport.send_reliable(&ClientPayload::StringCommand(command.clone())) {
                        Ok(_) => debug!(command, "server command answered"),
                        Err(NetchanError::TransportClosed) => return false,
                        Err(err) => report_violation_to!(
                            &self.violation_observer,
                            ViolationSeverity::Error,
                            ViolationKind::Reliability,
                            "reply {:?} was not acknowledged: {}",
                            command,
                            err
                        ),
                    }
                },
                SessionAction::Disconnect => {
                    self.server_disconnect(generation, transport);
                    return false;
                },
                SessionAction::Reconnect => {
                    self.begin_reconnect(generation, transport);
                    return false;
                },
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::SessionBuilder;

    fn actions(text: &str) -> Vec<SessionAction> {
        let mut out = Vec::new();
        stuff_text_actions(text, &mut out);
        out
    }

    #[test]
    fn stuff_text_forwards_cmd() {
        assert_eq!(
            actions("cmd configstrings 3 0\n"),
            vec![SessionAction::SendReliable("configstrings 3 0".to_owned())]
        );
    }

    #[test]
    fn stuff_text_answers_precache_with_begin() {
        assert_eq!(
            actions("precache 7\n"),
            vec![SessionAction::SendReliable("begin 7".to_owned())]
        );
        assert_eq!(
            actions("precache\n"),
            vec![SessionAction::SendReliable("begin".to_owned())]
        );
    }

    #[test]
    fn stuff_text_handles_several_commands() {
        assert_eq!(
            actions("changing\nreconnect\n"),
            vec![SessionAction::Reconnect]
        );
        assert_eq!(
            actions("cmd baselines 3 0; echo hi\n"),
            vec![SessionAction::SendReliable("baselines 3 0".to_owned())]
        );
    }

    #[test]
    fn stuff_text_ignores_unknown_and_empty() {
        assert!(actions("alias +foo bar\nexec autoexec.cfg\n\n").is_empty());
        assert!(actions("cmd\n").is_empty());
    }

    #[test]
    fn only_a_newer_frame_counts_as_advancing() {
        assert!(frame_advanced(None, Some(0)));
        assert!(frame_advanced(Some(9), Some(10)));
        assert!(!frame_advanced(Some(10), Some(10)));
        assert!(!frame_advanced(Some(10), Some(5)));
        assert!(!frame_advanced(Some(10), None));
        assert!(!frame_advanced(None, None));
    }

    #[test]
    fn session_messages_become_actions() {
        let mut out = Vec::new();
        collect_actions(&ServerMessage::Disconnect, &mut out);
        collect_actions(&ServerMessage::Nop, &mut out);
        collect_actions(&ServerMessage::Reconnect, &mut out);
        assert_eq!(out, vec![SessionAction::Disconnect, SessionAction::Reconnect]);
    }

    #[test]
    fn idle_session_refuses_commands() {
        let session: Session = SessionBuilder::new().build().unwrap();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(matches!(
            session.send_command("say hi"),
            Err(NetchanError::InvalidRequest { .. })
        ));
        assert!(matches!(
            session.send_console_command("say hi"),
            Err(NetchanError::InvalidRequest { .. })
        ));
        assert_eq!(session.client_id(), None);
        assert_eq!(session.ping(), Duration::ZERO);
        assert_eq!(session.stats(), NetworkStats::default());
    }

    #[test]
    fn sessions_share_the_client_id_pool_by_default() {
        let a: Session = SessionBuilder::new().build().unwrap();
        let b: Session = SessionBuilder::new().with_rng_seed(3).build().unwrap();
        assert!(a.shared.allocator.shares_pool_with(&b.shared.allocator));

        let own = ClientIdAllocator::with_seed(4);
        let c: Session = SessionBuilder::new()
            .with_client_id_allocator(own.clone())
            .build()
            .unwrap();
        assert!(c.shared.allocator.shares_pool_with(&own));
        assert!(!c.shared.allocator.shares_pool_with(&a.shared.allocator));
    }

    #[test]
    fn disconnect_without_connect_stays_idle() {
        let session: Session = SessionBuilder::new().build().unwrap();
        session.disconnect();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(!session.is_spawned());
    }

    #[test]
    fn pending_move_is_overwritten() {
        let session: Session = SessionBuilder::new().build().unwrap();
        session.set_pending_move([0.0, 90.0, 0.0], [100.0, 0.0, 0.0], Action::IDLE);
        session.set_pending_move([0.0, 180.0, 0.0], [0.0, 50.0, 0.0], Action::attack());
        let pending = session.pending_move();
        assert_eq!(pending.angles, [0.0, 180.0, 0.0]);
        assert_eq!(pending.velocity, [0.0, 50.0, 0.0]);
        assert_eq!(pending.action, Action::attack());
    }

    #[test]
    fn with_world_sees_fresh_world() {
        let session: Session = SessionBuilder::new().build().unwrap();
        assert_eq!(session.with_world(|w| w.current_frame_number()), None);
        assert!(!session.with_world(|w| w.is_spawned()));
    }

    #[test]
    fn unresolvable_host_fails_and_allows_retry() {
        let session: Session = SessionBuilder::new().build().unwrap();
        let err = session.connect("host.invalid", 27910).unwrap_err();
        assert!(matches!(err, NetchanError::ResolveFailed { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.last_failure(), Some(err));
        // The failed attempt released the running flag.
        assert!(matches!(
            session.connect("host.invalid", 27910),
            Err(NetchanError::ResolveFailed { .. })
        ));
    }
}
