//! Shared test utilities for integration tests.

#![allow(dead_code)] // Integration crates only use subsets of these helpers.

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use netchan_client::{SessionConfig, TransportConfig};

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per test binary.
///
/// Honors `RUST_LOG`-style filtering through the default `fmt` settings;
/// output is captured by the test harness.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Session timing scaled down for loopback tests.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        transport: TransportConfig {
            poll_interval: Duration::from_millis(5),
            resend_every_polls: 10,
            max_retransmissions: Some(200),
            recv_backlog_limit: 256,
        },
        handshake_timeout: Duration::from_secs(2),
        handshake_resend_interval: Duration::from_millis(100),
        spawn_timeout: Some(WAIT_TIMEOUT),
        reconnect_backoff_min: Duration::from_millis(10),
        reconnect_backoff_max: Duration::from_millis(50),
        rng_seed: Some(7),
        ..SessionConfig::default()
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns whether it held.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
