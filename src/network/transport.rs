//! The datagram transport for one connection.
//!
//! A [`Transport`] owns the socket and the connection's
//! [`ReliabilityState`]. Two kinds of caller use it concurrently:
//!
//! - the session's receive loop, calling [`receive_data`] over and over;
//! - whoever sends a reliable command, which blocks inside
//!   [`send_reliable`] resending its datagram and polling the socket until
//!   the server's echoed parity flips.
//!
//! Socket reads are serialized by an internal receive lock, so a datagram is
//! never read by both. Datagrams a reliable sender pulls off the socket go on
//! a bounded backlog that [`receive_data`] drains first, and their sequence
//! pair has already been observed by then. Every datagram therefore updates
//! the reliability state exactly once and still reaches the receive loop.
//!
//! A sequenced datagram whose `seq_a` is not newer than one already read
//! arrived late or twice. It is counted and dropped on the spot, so callers
//! only ever see server frames in increasing sequence order.
//!
//! [`receive_data`]: Transport::receive_data
//! [`send_reliable`]: Transport::send_reliable

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use crate::network::commands::ClientPayload;
use crate::network::frame::{is_connectionless_datagram, WireFrame, HEADER_SIZE};
use crate::network::network_stats::NetworkStats;
use crate::network::reliability::ReliabilityState;
use crate::network::sequence::{SequenceNumber, SEQUENCE_SIZE};
use crate::network::udp_socket::{DatagramSocket, UdpDatagramSocket};
use crate::report_violation_to;
use crate::sessions::config::TransportConfig;
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::NetchanError;

const RECV_BUFFER_SIZE: usize = 4096;

/// A datagram read on behalf of a reliable sender.
#[derive(Debug)]
struct Backlogged {
    datagram: Vec<u8>,
    /// Its reliable data was acknowledged when it was read, so losing it
    /// would lose that data for good.
    new_reliable: bool,
}

#[derive(Debug, Default)]
struct Counters {
    stats: NetworkStats,
    last_receive: Option<Instant>,
}

/// Socket, reliability state and counters for one connection.
pub struct Transport {
    socket: Box<dyn DatagramSocket>,
    config: TransportConfig,
    reliability: Mutex<ReliabilityState>,
    receive_lock: Mutex<()>,
    reliable_lock: Mutex<()>,
    send_lock: Mutex<()>,
    backlog: Mutex<VecDeque<Backlogged>>,
    counters: Mutex<Counters>,
    closed: AtomicBool,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .field("reliability", &*self.reliability.lock())
            .field("backlog_len", &self.backlog.lock().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Opens a UDP socket to `host:port` with fresh reliability state.
    pub fn connect(host: &str, port: u16, config: TransportConfig) -> Result<Self, NetchanError> {
        config.validate()?;
        let socket = UdpDatagramSocket::connect(host, port, config.poll_interval)?;
        debug!(peer = %socket.peer_addr(), "transport connected");
        Ok(Self::with_socket(socket, config))
    }

    /// Wraps an already connected socket.
    pub fn with_socket<S: DatagramSocket + 'static>(socket: S, config: TransportConfig) -> Self {
        Self {
            socket: Box::new(socket),
            config,
            reliability: Mutex::new(ReliabilityState::new()),
            receive_lock: Mutex::new(()),
            reliable_lock: Mutex::new(()),
            send_lock: Mutex::new(()),
            backlog: Mutex::new(VecDeque::new()),
            counters: Mutex::new(Counters::default()),
            closed: AtomicBool::new(false),
            violation_observer: None,
        }
    }

    /// Routes this transport's violations to `observer` instead of the log.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// The configuration this transport runs with.
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Sends a handshake datagram.
    pub fn send_connectionless(&self, text: &str) -> Result<(), NetchanError> {
        self.ensure_open()?;
        trace!(text, "send connectionless");
        self.send_raw(&WireFrame::connectionless(text).encode())
    }

    /// Sends `payloads` in one unreliable frame.
    ///
    /// Failures are logged and dropped: the next tick sends fresh data anyway.
    pub fn send_unreliable(&self, payloads: &[ClientPayload]) {
        if self.is_closed() {
            return;
        }
        // Held until the datagram is on the wire, so sequences leave in order.
        let _sending = self.send_lock.lock();
        let (seq_a, seq_b) = self.reliability.lock().next_outgoing(false);
        let datagram = match WireFrame::client(seq_a, seq_b, payloads) {
            Ok(frame) => frame.encode(),
            Err(err) => {
                report_violation_to!(
                    &self.violation_observer,
                    ViolationSeverity::Error,
                    ViolationKind::InternalError,
                    "could not build unreliable frame: {}",
                    err
                );
                return;
            },
        };
        if let Err(err) = self.send_raw(&datagram) {
            debug!(%seq_a, "unreliable send failed: {}", err);
        }
    }

    /// Sends `payload` reliably and blocks until the server acknowledges it.
    ///
    /// The same datagram is resent every
    /// [`resend_every_polls`](TransportConfig::resend_every_polls) receive
    /// polls. Returns the number of retransmissions it took.
    ///
    /// # Errors
    ///
    /// - [`NetchanError::TransportStalled`] once
    ///   [`max_retransmissions`](TransportConfig::max_retransmissions) resends
    ///   went unacknowledged.
    /// - [`NetchanError::TransportClosed`] if the transport is closed while
    ///   waiting.
    pub fn send_reliable(&self, payload: &ClientPayload) -> Result<u32, NetchanError> {
        self.ensure_open()?;
        // One reliable frame in flight; the single parity bit cannot tell two apart.
        let _in_flight = self.reliable_lock.lock();

        let (datagram, seq_a, baseline) = {
            let _sending = self.send_lock.lock();
            let (datagram, seq_a, baseline) = {
                let mut reliability = self.reliability.lock();
                let baseline = reliability.local_parity_flips();
                let (seq_a, seq_b) = reliability.next_outgoing(true);
                let frame = WireFrame::client(seq_a, seq_b, std::slice::from_ref(payload))?;
                (frame.encode(), seq_a, baseline)
            };
            trace!(%seq_a, "send reliable");
            self.send_or_log(&datagram);
            (datagram, seq_a, baseline)
        };
        let acked = || self.reliability.lock().local_parity_flips() != baseline;

        let mut polls: u32 = 0;
        let mut retransmissions: u32 = 0;
        loop {
            if acked() {
                self.counters.lock().stats.reliable_acked += 1;
                debug!(%seq_a, retransmissions, "reliable frame acknowledged");
                return Ok(retransmissions);
            }
            self.ensure_open()?;

            self.poll_into_backlog();
            polls = polls.wrapping_add(1);

            if polls % self.config.resend_every_polls.max(1) != 0 || acked() {
                continue;
            }
            if let Some(max) = self.config.max_retransmissions {
                if retransmissions >= max {
                    report_violation_to!(
                        &self.violation_observer,
                        ViolationSeverity::Error,
                        ViolationKind::Reliability,
                        sequence = seq_a,
                        "reliable frame unacknowledged after {} retransmissions",
                        retransmissions
                    );
                    return Err(NetchanError::TransportStalled { retransmissions });
                }
            }
            retransmissions += 1;
            self.counters.lock().stats.retransmissions += 1;
            trace!(%seq_a, retransmissions, "resend reliable");
            self.send_or_log(&datagram);
        }
    }

    /// Returns the next inbound datagram, or `None` if nothing arrived within
    /// one poll interval.
    ///
    /// Datagrams set aside by a reliable send come first. A datagram read
    /// from the socket updates the reliability state before it is returned.
    /// Late and duplicated server frames are dropped and also yield `None`.
    pub fn receive_data(&self) -> Result<Option<Vec<u8>>, NetchanError> {
        self.ensure_open()?;
        if let Some(entry) = self.backlog.lock().pop_front() {
            return Ok(Some(entry.datagram));
        }
        let _receiving = self.receive_lock.lock();
        // A reliable sender may have queued something while we waited for the lock.
        if let Some(entry) = self.backlog.lock().pop_front() {
            return Ok(Some(entry.datagram));
        }
        let entry = self.poll_socket()?;
        self.ensure_open()?;
        Ok(entry.map(|entry| entry.datagram))
    }

    /// Marks the transport closed. Blocked callers return
    /// [`NetchanError::TransportClosed`] within one poll interval.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("transport closed");
        }
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Interval between the two most recent inbound datagrams.
    #[must_use]
    pub fn ping(&self) -> Duration {
        self.counters.lock().stats.ping
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> NetworkStats {
        self.counters.lock().stats
    }

    /// Snapshot of the reliability state.
    #[must_use]
    pub fn reliability(&self) -> ReliabilityState {
        self.reliability.lock().clone()
    }

    fn ensure_open(&self) -> Result<(), NetchanError> {
        if self.is_closed() {
            Err(NetchanError::TransportClosed)
        } else {
            Ok(())
        }
    }

    fn send_raw(&self, datagram: &[u8]) -> Result<(), NetchanError> {
        self.socket.send(datagram)?;
        self.counters.lock().stats.record_sent(datagram.len());
        Ok(())
    }

    fn send_or_log(&self, datagram: &[u8]) {
        if let Err(err) = self.send_raw(datagram) {
            debug!("send failed: {}", err);
        }
    }

    /// One poll on behalf of a waiting reliable sender.
    ///
    /// If another caller is already reading the socket, waiting for it to
    /// finish counts as the poll; it observes whatever arrives.
    fn poll_into_backlog(&self) {
        let Some(_receiving) = self.receive_lock.try_lock_for(self.config.poll_interval) else {
            return;
        };
        match self.poll_socket() {
            Ok(Some(entry)) => self.push_backlog(entry),
            Ok(None) => {},
            Err(err) => debug!("receive during reliable wait failed: {}", err),
        }
    }

    /// Queues `entry`, evicting the oldest datagram without acknowledged
    /// reliable data when the backlog is full.
    fn push_backlog(&self, entry: Backlogged) {
        let mut backlog = self.backlog.lock();
        if backlog.len() >= self.config.recv_backlog_limit {
            let victim = backlog.iter().position(|queued| !queued.new_reliable);
            let evicted = match victim {
                Some(index) => backlog.remove(index),
                // Every queued datagram carries acknowledged reliable data.
                None if !entry.new_reliable => {
                    self.report_backlog_overflow("dropping the newest unreliable one");
                    return;
                },
                None => backlog.pop_front(),
            };
            if evicted.is_some_and(|evicted| evicted.new_reliable) {
                self.report_backlog_overflow("dropping acknowledged reliable data");
            } else {
                self.report_backlog_overflow("dropping the oldest unreliable one");
            }
        }
        backlog.push_back(entry);
    }

    fn report_backlog_overflow(&self, dropping: &str) {
        report_violation_to!(
            &self.violation_observer,
            ViolationSeverity::Warning,
            ViolationKind::Reliability,
            "receive backlog full ({} datagrams), {}",
            self.config.recv_backlog_limit,
            dropping
        );
    }

    /// Reads one datagram from the socket. Caller holds the receive lock.
    ///
    /// Returns `None` on timeout and for server frames that are not newer
    /// than the last one read.
    fn poll_socket(&self) -> Result<Option<Backlogged>, NetchanError> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let Some(len) = self.socket.recv(&mut buf)? else {
            return Ok(None);
        };
        let datagram = buf[..len].to_vec();

        {
            let now = Instant::now();
            let mut counters = self.counters.lock();
            if let Some(previous) = counters.last_receive.replace(now) {
                counters.stats.ping = now.saturating_duration_since(previous);
            }
            counters.stats.record_received(len);
        }

        if len < HEADER_SIZE || is_connectionless_datagram(&datagram) {
            trace!(len, "received connectionless or short datagram");
            return Ok(Some(Backlogged {
                datagram,
                new_reliable: false,
            }));
        }

        let seq_a = SequenceNumber::decode(&datagram, 0);
        let seq_b = SequenceNumber::decode(&datagram, SEQUENCE_SIZE);
        let outcome = self.reliability.lock().observe(seq_a, seq_b);
        if outcome.stale {
            self.counters.lock().stats.stale_dropped += 1;
            debug!(%seq_a, "dropping out-of-order datagram");
            return Ok(None);
        }
        trace!(
            %seq_a,
            %seq_b,
            len,
            peer_flip = outcome.peer_parity_flipped,
            local_flip = outcome.local_parity_flipped,
            "received"
        );
        Ok(Some(Backlogged {
            datagram,
            new_reliable: outcome.peer_parity_flipped,
        }))
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
    use crate::telemetry::CollectingObserver;
    use std::io;
    use std::thread;

    /// In-memory socket: queued inbound datagrams, plus an optional ack that
    /// becomes readable once enough datagrams were sent.
    #[derive(Default)]
    struct MockSocket {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
        ack_after_sends: Option<usize>,
        ack_delivered: AtomicBool,
    }

    impl MockSocket {
        fn acking_after(sends: usize) -> Self {
            Self {
                ack_after_sends: Some(sends),
                ..Self::default()
            }
        }

        fn push(&self, datagram: Vec<u8>) {
            self.inbound.lock().push_back(datagram);
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().clone()
        }
    }

    impl DatagramSocket for MockSocket {
        fn send(&self, datagram: &[u8]) -> io::Result<()> {
            self.sent.lock().push(datagram.to_vec());
            Ok(())
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            let sent = self.sent.lock().len();
            let ack_ready = self.ack_after_sends.is_some_and(|n| sent >= n)
                && !self.ack_delivered.swap(true, Ordering::AcqRel);
            let next = if ack_ready {
                Some(server_datagram(SequenceNumber::new(1, false), SequenceNumber::new(1, true)))
            } else {
                self.inbound.lock().pop_front()
            };
            match next {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(Some(datagram.len()))
                },
                None => {
                    thread::sleep(std::time::Duration::from_millis(1));
                    Ok(None)
                },
            }
        }
    }

    fn server_datagram(seq_a: SequenceNumber, seq_b: SequenceNumber) -> Vec<u8> {
        let mut out = seq_a.encode().to_vec();
        out.extend_from_slice(&seq_b.encode());
        out.push(6);
        out
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            poll_interval: Duration::from_millis(1),
            ..TransportConfig::default()
        }
    }

    fn command(text: &str) -> ClientPayload {
        ClientPayload::StringCommand(text.to_owned())
    }

    #[test]
    fn reliable_send_counts_retransmissions_until_ack() {
        // Original send plus three retransmissions, then the ack shows up.
        let socket = Arc::new(MockSocket::acking_after(4));
        let transport = Transport::with_socket(socket.clone(), fast_config());

        let retransmissions = transport.send_reliable(&command("new")).unwrap();

        assert_eq!(retransmissions, 3);
        let sent = socket.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|d| d == &sent[0]));
        assert!(SequenceNumber::decode(&sent[0], 0).is_reliable());
        let stats = transport.stats();
        assert_eq!(stats.retransmissions, 3);
        assert_eq!(stats.reliable_acked, 1);
    }

    #[test]
    fn ack_drained_by_reliable_send_reaches_receiver() {
        let socket = Arc::new(MockSocket::acking_after(1));
        let transport = Transport::with_socket(socket, fast_config());
        assert_eq!(transport.send_reliable(&command("new")).unwrap(), 0);

        let before = transport.reliability();
        let datagram = transport.receive_data().unwrap().unwrap();
        assert_eq!(SequenceNumber::decode(&datagram, 0).value(), 1);
        // Already observed once; handing it out again changes nothing.
        assert_eq!(transport.reliability(), before);
    }

    #[test]
    fn reliable_send_stalls_at_the_cap() {
        let socket = Arc::new(MockSocket::default());
        let observer = Arc::new(CollectingObserver::new());
        let config = TransportConfig {
            resend_every_polls: 2,
            max_retransmissions: Some(2),
            ..fast_config()
        };
        let transport =
            Transport::with_socket(socket.clone(), config).with_violation_observer(observer.clone());

        let err = transport.send_reliable(&command("new")).unwrap_err();

        assert_eq!(err, NetchanError::TransportStalled { retransmissions: 2 });
        assert_eq!(socket.sent().len(), 3);
        assert!(observer.has_violation(ViolationKind::Reliability));
    }

    #[test]
    fn close_interrupts_reliable_send() {
        let socket = Arc::new(MockSocket::default());
        let transport = Arc::new(Transport::with_socket(
            socket,
            TransportConfig {
                max_retransmissions: None,
                ..fast_config()
            },
        ));
        let sender = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || transport.send_reliable(&command("new")))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        transport.close();
        assert_eq!(sender.join().unwrap(), Err(NetchanError::TransportClosed));
        assert_eq!(transport.receive_data(), Err(NetchanError::TransportClosed));
    }

    #[test]
    fn receive_updates_peer_parity() {
        let socket = Arc::new(MockSocket::default());
        for (value, reliable) in [(5, true), (6, false), (7, true), (7, true), (9, true)] {
            socket.push(server_datagram(
                SequenceNumber::new(value, reliable),
                SequenceNumber::new(0, false),
            ));
        }
        let transport = Transport::with_socket(socket.clone(), fast_config());
        let received: Vec<bool> = (0..5)
            .map(|_| transport.receive_data().unwrap().is_some())
            .collect();
        // The repeated 7R is dropped.
        assert_eq!(received, vec![true, true, true, false, true]);
        assert_eq!(transport.receive_data().unwrap(), None);
        assert_eq!(transport.stats().stale_dropped, 1);

        let state = transport.reliability();
        assert_eq!(state.last_reliable_peer_seq(), 9);
        assert!(state.peer_parity());

        transport.send_unreliable(&[ClientPayload::Nop]);
        let sent = socket.sent();
        let seq_b = SequenceNumber::decode(&sent[0], SEQUENCE_SIZE);
        assert_eq!(seq_b.value(), 9);
        assert!(seq_b.is_reliable());
        assert!(!SequenceNumber::decode(&sent[0], 0).is_reliable());
    }

    #[test]
    fn connectionless_replies_do_not_touch_reliability() {
        let socket = Arc::new(MockSocket::default());
        socket.push(WireFrame::connectionless("challenge 1234").encode());
        let transport = Transport::with_socket(socket, fast_config());
        let datagram = transport.receive_data().unwrap().unwrap();
        assert!(is_connectionless_datagram(&datagram));
        assert_eq!(transport.reliability(), ReliabilityState::new());
        assert_eq!(transport.stats().packets_received, 1);
    }

    #[test]
    fn unreliable_sequences_increase() {
        let socket = Arc::new(MockSocket::default());
        let transport = Transport::with_socket(socket.clone(), fast_config());
        transport.send_unreliable(&[ClientPayload::Nop]);
        transport.send_unreliable(&[ClientPayload::Nop]);
        let values: Vec<u32> = socket
            .sent()
            .iter()
            .map(|d| SequenceNumber::decode(d, 0).value())
            .collect();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(transport.stats().packets_sent, 2);
    }

    fn backlogged(value: u32, new_reliable: bool) -> Backlogged {
        Backlogged {
            datagram: server_datagram(
                SequenceNumber::new(value, new_reliable),
                SequenceNumber::new(0, false),
            ),
            new_reliable,
        }
    }

    fn drain(transport: &Transport) -> Vec<u32> {
        std::iter::from_fn(|| transport.receive_data().unwrap())
            .map(|datagram| SequenceNumber::decode(&datagram, 0).value())
            .collect()
    }

    fn backlog_transport(limit: usize, observer: Arc<CollectingObserver>) -> Transport {
        Transport::with_socket(
            MockSocket::default(),
            TransportConfig {
                recv_backlog_limit: limit,
                ..fast_config()
            },
        )
        .with_violation_observer(observer)
    }

    #[test]
    fn backlog_drops_oldest_beyond_limit() {
        let observer = Arc::new(CollectingObserver::new());
        let transport = backlog_transport(2, observer.clone());
        for value in 1..=3u32 {
            transport.push_backlog(backlogged(value, false));
        }
        assert_eq!(drain(&transport), vec![2, 3]);
        assert!(observer.has_violation(ViolationKind::Reliability));
    }

    #[test]
    fn full_backlog_keeps_acknowledged_reliable_data() {
        let observer = Arc::new(CollectingObserver::new());
        let transport = backlog_transport(2, observer.clone());
        transport.push_backlog(backlogged(1, true));
        transport.push_backlog(backlogged(2, false));
        transport.push_backlog(backlogged(3, false));
        assert_eq!(drain(&transport), vec![1, 3]);

        // Nothing unreliable left to evict: an unreliable newcomer is dropped.
        transport.push_backlog(backlogged(4, true));
        transport.push_backlog(backlogged(5, true));
        transport.push_backlog(backlogged(6, false));
        assert_eq!(drain(&transport), vec![4, 5]);
        assert_eq!(observer.violations_of_kind(ViolationKind::Reliability).len(), 2);
    }

    #[test]
    fn late_datagrams_never_reach_the_backlog() {
        let socket = Arc::new(MockSocket::default());
        for value in [4, 2, 4, 5] {
            socket.push(server_datagram(
                SequenceNumber::new(value, false),
                SequenceNumber::new(0, false),
            ));
        }
        let transport = Transport::with_socket(socket, fast_config());
        for _ in 0..6 {
            transport.poll_into_backlog();
        }
        assert_eq!(drain(&transport), vec![4, 5]);
        assert_eq!(transport.stats().stale_dropped, 2);
        assert_eq!(transport.stats().packets_received, 4);
    }

    #[test]
    fn concurrent_senders_put_sequences_on_the_wire_in_order() {
        let socket = Arc::new(MockSocket::default());
        let transport = Arc::new(Transport::with_socket(socket.clone(), fast_config()));
        let senders: Vec<_> = (0..4)
            .map(|_| {
                let transport = Arc::clone(&transport);
                thread::spawn(move || {
                    for _ in 0..100 {
                        transport.send_unreliable(&[ClientPayload::Nop]);
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }
        let values: Vec<u32> = socket
            .sent()
            .iter()
            .map(|d| SequenceNumber::decode(d, 0).value())
            .collect();
        assert_eq!(values, (1..=400).collect::<Vec<u32>>());
    }
}
