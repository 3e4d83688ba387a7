//! The connectionless handshake.
//!
//! ```text
//! client                                server
//!   │ FFFFFFFF "getchallenge"              │
//!   │─────────────────────────────────────>│
//!   │            FFFFFFFF "challenge 1234" │
//!   │<─────────────────────────────────────│
//!   │ FFFFFFFF `connect 34 <id> 1234 "<profile>"`
//!   │─────────────────────────────────────>│
//!   │            FFFFFFFF "client_connect" │
//!   │<─────────────────────────────────────│
//! ```
//!
//! A server that refuses answers with `print\n<reason>`. Requests are
//! repeated at the configured interval since either datagram may be lost.

use std::sync::Arc;

use tracing::debug;
use web_time::Instant;

use crate::network::frame::connectionless_text;
use crate::network::transport::Transport;
use crate::report_violation_to;
use crate::sessions::config::SessionConfig;
use crate::sessions::state::{ConnectionState, HandshakeStage};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::NetchanError;

/// Request that starts the handshake.
pub const GET_CHALLENGE: &str = "getchallenge";

/// A parsed connectionless reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionlessReply {
    /// `challenge <n>`.
    Challenge(i64),
    /// `client_connect`, possibly followed by extra fields.
    ClientConnect,
    /// `print\n<text>`; during the handshake this is a rejection.
    Print(String),
    /// Anything else, kept verbatim.
    Other(String),
}

impl ConnectionlessReply {
    /// Parses the text after the connectionless marker.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let text = text.trim_end_matches('\0');
        if let Some(rest) = text.strip_prefix("print\n") {
            return Self::Print(rest.trim_end().to_owned());
        }
        let mut words = text.split_whitespace();
        match words.next() {
            Some("challenge") => match words.next().map(str::parse) {
                Some(Ok(token)) => Self::Challenge(token),
                _ => Self::Other(text.to_owned()),
            },
            Some("client_connect") => Self::ClientConnect,
            _ => Self::Other(text.to_owned()),
        }
    }
}

/// The connect request for a challenge.
///
/// Quotes in the profile would end the quoted argument early, so they are
/// dropped.
#[must_use]
pub fn connect_request(
    protocol_version: u32,
    client_id: u16,
    challenge: i64,
    profile: &str,
) -> String {
    let profile: String = profile.chars().filter(|&c| c != '"').collect();
    format!("connect {protocol_version} {client_id} {challenge} \"{profile}\"")
}

/// Runs the handshake over `transport`, reporting each state change.
///
/// Returns once the server accepted the connection.
pub(crate) fn perform(
    transport: &Transport,
    config: &SessionConfig,
    client_id: u16,
    profile: &str,
    observer: &Option<Arc<dyn ViolationObserver>>,
    mut set_state: impl FnMut(ConnectionState),
) -> Result<(), NetchanError> {
    set_state(ConnectionState::AwaitingChallenge);
    let challenge = exchange(
        transport,
        config,
        HandshakeStage::AwaitingChallenge,
        GET_CHALLENGE,
        observer,
        |reply| match reply {
            ConnectionlessReply::Challenge(token) => Some(*token),
            _ => None,
        },
    )?;
    debug!(challenge, "received challenge");

    set_state(ConnectionState::AwaitingConnectAck);
    let request = connect_request(config.protocol_version, client_id, challenge, profile);
    exchange(
        transport,
        config,
        HandshakeStage::AwaitingConnectAck,
        &request,
        observer,
        |reply| matches!(reply, ConnectionlessReply::ClientConnect).then_some(()),
    )?;
    debug!(client_id, "server accepted connection");
    Ok(())
}

/// Sends `request` until `accept` takes a reply or the stage times out.
fn exchange<T>(
    transport: &Transport,
    config: &SessionConfig,
    stage: HandshakeStage,
    request: &str,
    observer: &Option<Arc<dyn ViolationObserver>>,
    accept: impl Fn(&ConnectionlessReply) -> Option<T>,
) -> Result<T, NetchanError> {
    let deadline = Instant::now() + config.handshake_timeout;
    let mut next_send = Instant::now();
    loop {
        let now = Instant::now();
        if now >= deadline {
            report_violation_to!(
                observer,
                ViolationSeverity::Warning,
                ViolationKind::Handshake,
                "no reply while {} after {}ms",
                stage,
                config.handshake_timeout.as_millis()
            );
            return Err(NetchanError::HandshakeTimeout { stage });
        }
        if now >= next_send {
            transport.send_connectionless(request)?;
            next_send = now + config.handshake_resend_interval;
        }

        let Some(datagram) = transport.receive_data()? else {
            continue;
        };
        // Sequenced leftovers from a previous connection are not for us.
        let Some(text) = connectionless_text(&datagram) else {
            continue;
        };
        let reply = ConnectionlessReply::parse(&text);
        if let Some(value) = accept(&reply) {
            return Ok(value);
        }
        match reply {
            ConnectionlessReply::Print(reason) => {
                report_violation_to!(
                    observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Handshake,
                    "server rejected connection while {}: {}",
                    stage,
                    reason
                );
                return Err(NetchanError::HandshakeRejected { reason });
            },
            ConnectionlessReply::Other(text) => {
                report_violation_to!(
                    observer,
                    ViolationSeverity::Warning,
                    ViolationKind::Handshake,
                    "unexpected reply while {}: {:?}",
                    stage,
                    text
                );
            },
            // A duplicate of an earlier step's reply.
            ConnectionlessReply::Challenge(_) | ConnectionlessReply::ClientConnect => {},
        }
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
    use crate::network::frame::WireFrame;
    use crate::network::udp_socket::DatagramSocket;
    use crate::sessions::config::TransportConfig;
    use crate::telemetry::CollectingObserver;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use web_time::Duration;

    /// Answers each connectionless request with a scripted reply.
    #[derive(Default)]
    struct ScriptedServer {
        replies: Mutex<VecDeque<String>>,
        pending: Mutex<VecDeque<Vec<u8>>>,
        requests: Mutex<Vec<String>>,
    }

    impl ScriptedServer {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| (*r).to_owned()).collect()),
                ..Self::default()
            }
        }
    }

    impl DatagramSocket for ScriptedServer {
        fn send(&self, datagram: &[u8]) -> io::Result<()> {
            let text = connectionless_text(datagram).unwrap();
            self.requests.lock().push(text);
            if let Some(reply) = self.replies.lock().pop_front() {
                self.pending
                    .lock()
                    .push_back(WireFrame::connectionless(&reply).encode());
            }
            Ok(())
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            match self.pending.lock().pop_front() {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(Some(datagram.len()))
                },
                None => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    Ok(None)
                },
            }
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            transport: TransportConfig {
                poll_interval: Duration::from_millis(1),
                ..TransportConfig::default()
            },
            handshake_timeout: Duration::from_millis(200),
            handshake_resend_interval: Duration::from_millis(50),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn parse_replies() {
        assert_eq!(
            ConnectionlessReply::parse("challenge 12345"),
            ConnectionlessReply::Challenge(12345)
        );
        assert_eq!(
            ConnectionlessReply::parse("challenge -7\n"),
            ConnectionlessReply::Challenge(-7)
        );
        assert_eq!(
            ConnectionlessReply::parse("client_connect"),
            ConnectionlessReply::ClientConnect
        );
        assert_eq!(
            ConnectionlessReply::parse("client_connect dlserver=x"),
            ConnectionlessReply::ClientConnect
        );
        assert_eq!(
            ConnectionlessReply::parse("print\nServer is full.\n"),
            ConnectionlessReply::Print("Server is full.".to_owned())
        );
        assert_eq!(
            ConnectionlessReply::parse("challenge abc"),
            ConnectionlessReply::Other("challenge abc".to_owned())
        );
        assert_eq!(
            ConnectionlessReply::parse("info 34"),
            ConnectionlessReply::Other("info 34".to_owned())
        );
    }

    #[test]
    fn connect_request_format() {
        assert_eq!(
            connect_request(34, 4242, 12345, "\\name\\bot\\skin\\male/grunt"),
            "connect 34 4242 12345 \"\\name\\bot\\skin\\male/grunt\""
        );
        assert_eq!(connect_request(34, 1, 2, "a\"b"), "connect 34 1 2 \"ab\"");
    }

    #[test]
    fn challenge_then_connect() {
        let server = Arc::new(ScriptedServer::new(&["challenge 12345", "client_connect"]));
        let transport = Transport::with_socket(server.clone(), config().transport);
        let mut states = Vec::new();

        perform(&transport, &config(), 4242, "\\name\\bot", &None, |s| states.push(s)).unwrap();

        assert_eq!(
            *server.requests.lock(),
            vec![
                "getchallenge".to_owned(),
                "connect 34 4242 12345 \"\\name\\bot\"".to_owned()
            ]
        );
        assert_eq!(
            states,
            vec![
                ConnectionState::AwaitingChallenge,
                ConnectionState::AwaitingConnectAck
            ]
        );
    }

    #[test]
    fn rejection_is_reported() {
        let server = Arc::new(ScriptedServer::new(&["challenge 1", "print\nServer is full.\n"]));
        let transport = Transport::with_socket(server, config().transport);
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());

        let err = perform(&transport, &config(), 1, "", &observer, |_| {}).unwrap_err();

        assert_eq!(
            err,
            NetchanError::HandshakeRejected {
                reason: "Server is full.".to_owned()
            }
        );
        assert!(collector.has_violation(ViolationKind::Handshake));
    }

    #[test]
    fn silent_server_times_out_and_requests_are_repeated() {
        let server = Arc::new(ScriptedServer::new(&[]));
        let transport = Transport::with_socket(server.clone(), config().transport);

        let err = perform(&transport, &config(), 1, "", &None, |_| {}).unwrap_err();

        assert_eq!(
            err,
            NetchanError::HandshakeTimeout {
                stage: HandshakeStage::AwaitingChallenge
            }
        );
        let requests = server.requests.lock();
        assert!(requests.len() >= 2);
        assert!(requests.iter().all(|r| r == GET_CHALLENGE));
    }

    #[test]
    fn unexpected_replies_are_skipped() {
        let server = Arc::new(ScriptedServer::new(&["info 34", "challenge 9", "client_connect"]));
        let transport = Transport::with_socket(server.clone(), config().transport);
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());

        perform(&transport, &config(), 7, "p", &observer, |_| {}).unwrap();

        // The first getchallenge got "info 34"; the resend got the challenge.
        let requests = server.requests.lock();
        assert_eq!(requests[0], GET_CHALLENGE);
        assert_eq!(requests[1], GET_CHALLENGE);
        assert_eq!(requests[2], "connect 34 7 9 \"p\"");
        assert_eq!(collector.len(), 1);
    }
}
