use web_time::Duration;

/// The `NetworkStats` struct contains statistics about the current connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "NetworkStats should be inspected or used after being queried"]
pub struct NetworkStats {
    /// Time between the two most recent datagrams from the server.
    ///
    /// The server sends a frame every tick, so this tracks tick interval plus
    /// jitter more than true round-trip time. It is what the protocol has.
    pub ping: Duration,
    /// Datagrams handed to the socket, retransmissions included.
    pub packets_sent: u64,
    /// Datagrams read from the socket.
    pub packets_received: u64,
    /// Bytes handed to the socket.
    pub bytes_sent: u64,
    /// Bytes read from the socket.
    pub bytes_received: u64,
    /// Reliable datagrams sent again because no acknowledgement arrived.
    pub retransmissions: u64,
    /// Reliable datagrams the server acknowledged.
    pub reliable_acked: u64,
    /// Server frames dropped for arriving late or twice.
    pub stale_dropped: u64,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&mut self, len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += len as u64;
    }

    pub(crate) fn record_received(&mut self, len: usize) {
        self.packets_received += 1;
        self.bytes_received += len as u64;
    }
}

impl std::fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            ping,
            packets_sent,
            packets_received,
            bytes_sent,
            bytes_received,
            retransmissions,
            reliable_acked,
            stale_dropped,
        } = self;

        write!(
            f,
            "NetworkStats {{ ping: {}ms, sent: {} ({} B), received: {} ({} B), retransmissions: {}, reliable_acked: {}, stale_dropped: {} }}",
            ping.as_millis(),
            packets_sent,
            bytes_sent,
            packets_received,
            bytes_received,
            retransmissions,
            reliable_acked,
            stale_dropped
        )
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut stats = NetworkStats::new();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_received(100);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.bytes_received, 100);
    }

    #[test]
    fn display_lists_every_field() {
        let stats = NetworkStats {
            ping: Duration::from_millis(42),
            packets_sent: 3,
            packets_received: 4,
            bytes_sent: 30,
            bytes_received: 400,
            retransmissions: 1,
            reliable_acked: 2,
            stale_dropped: 5,
        };
        assert_eq!(
            stats.to_string(),
            "NetworkStats { ping: 42ms, sent: 3 (30 B), received: 4 (400 B), retransmissions: 1, reliable_acked: 2, stale_dropped: 5 }"
        );
    }
}
