//! UDP socket connected to one server, with a bounded receive wait.

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
};

use web_time::Duration;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::NetchanError;

/// Largest datagram a protocol 34 server accepts. Anything bigger is cut off
/// on the other side.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// A datagram socket connected to a single peer.
///
/// [`recv`](Self::recv) blocks for at most one poll interval and returns
/// `Ok(None)` when nothing arrived in that time. This bounded wait is what
/// lets a closed transport wake up its receivers.
///
/// Both methods take `&self`: one thread may send while another is parked in
/// `recv`.
pub trait DatagramSocket: Send + Sync {
    /// Sends one datagram to the peer.
    fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Receives one datagram into `buf`, or `None` after the poll interval.
    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

impl<T: DatagramSocket + ?Sized> DatagramSocket for std::sync::Arc<T> {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        (**self).send(datagram)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        (**self).recv(buf)
    }
}

/// A connected UDP socket with a read timeout.
#[derive(Debug)]
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpDatagramSocket {
    /// Resolves `host:port`, binds an ephemeral local port of the same
    /// address family and connects to the first resolved address.
    pub fn connect(host: &str, port: u16, poll_interval: Duration) -> Result<Self, NetchanError> {
        let address = format!("{host}:{port}");
        let peer = (host, port)
            .to_socket_addrs()
            .map_err(|err| NetchanError::ResolveFailed {
                address: format!("{address} ({err})"),
            })?
            .next()
            .ok_or_else(|| NetchanError::ResolveFailed {
                address: address.clone(),
            })?;
        Self::connect_addr(peer, poll_interval)
    }

    /// Binds an ephemeral port and connects to `peer`.
    pub fn connect_addr(peer: SocketAddr, poll_interval: Duration) -> Result<Self, NetchanError> {
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(peer)?;
        // A zero timeout means "block forever" to the OS.
        let timeout = poll_interval.max(Duration::from_millis(1));
        socket.set_read_timeout(Some(timeout))?;
        Ok(Self { socket, peer })
    }

    /// The address this socket is connected to.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send(&self, datagram: &[u8]) -> io::Result<()> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending datagram of {} bytes, larger than the {} the server accepts",
                datagram.len(),
                MAX_DATAGRAM_SIZE
            );
        }
        self.socket.send(datagram).map(|_| ())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buf) {
            Ok(len) => Ok(Some(len)),
            // Read timeout; Unix reports WouldBlock, Windows TimedOut.
            Err(ref err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            },
            // ICMP port unreachable from an earlier send; the server may come up later.
            Err(ref err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused
                ) =>
            {
                tracing::trace!(peer = %self.peer, "peer unreachable: {}", err);
                Ok(None)
            },
            Err(err) => Err(err),
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
    use serial_test::serial;

    #[test]
    #[serial]
    fn recv_times_out_with_none() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let socket =
            UdpDatagramSocket::connect_addr(server.local_addr().unwrap(), Duration::from_millis(20))
                .unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(socket.recv(&mut buf).unwrap(), None);
    }

    #[test]
    #[serial]
    fn send_and_receive_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let socket = UdpDatagramSocket::connect("127.0.0.1", port, Duration::from_millis(500))
            .unwrap();
        socket.send(b"ping").unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.port(), socket.local_addr().unwrap().port());

        server.send_to(b"pong", from).unwrap();
        let len = socket.recv(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"pong");
    }

    #[test]
    fn unresolvable_host_fails() {
        let err = UdpDatagramSocket::connect("host.invalid", 27910, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, NetchanError::ResolveFailed { .. }));
    }
}
