//! Fuzz target for session configuration.
//!
//! This target tests that arbitrary configuration values are handled gracefully
//! by SessionConfig validation and the SessionBuilder.
//!
//! # Safety Properties Tested
//! - No panics on arbitrary configuration values
//! - A configuration the builder accepts also validates on its own
//! - Profiles with quotes or line breaks are refused

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use netchan_client::{GameState, SessionBuilder, SessionConfig, TransportConfig};
use std::time::Duration;

/// Arbitrary configuration inputs for the session builder
#[derive(Debug, Arbitrary)]
struct FuzzConfig {
    poll_interval_ms: u16,
    resend_every_polls: u32,
    max_retransmissions: Option<u32>,
    recv_backlog_limit: u32,
    protocol_version: u32,
    handshake_timeout_ms: u32,
    handshake_resend_ms: u32,
    spawn_timeout_ms: Option<u32>,
    backoff_min_ms: u32,
    backoff_max_ms: u32,
    high_thread_safety: bool,
    rng_seed: Option<u64>,
    profile: String,
}

fuzz_target!(|input: FuzzConfig| {
    let config = SessionConfig {
        transport: TransportConfig {
            poll_interval: Duration::from_millis(u64::from(input.poll_interval_ms)),
            resend_every_polls: input.resend_every_polls,
            max_retransmissions: input.max_retransmissions,
            recv_backlog_limit: input.recv_backlog_limit as usize,
        },
        protocol_version: input.protocol_version,
        handshake_timeout: Duration::from_millis(u64::from(input.handshake_timeout_ms)),
        handshake_resend_interval: Duration::from_millis(u64::from(input.handshake_resend_ms)),
        spawn_timeout: input
            .spawn_timeout_ms
            .map(|ms| Duration::from_millis(u64::from(ms))),
        reconnect_backoff_min: Duration::from_millis(u64::from(input.backoff_min_ms)),
        reconnect_backoff_max: Duration::from_millis(u64::from(input.backoff_max_ms)),
        high_thread_safety: input.high_thread_safety,
        rng_seed: input.rng_seed,
        ..SessionConfig::default()
    };

    let valid = config.validate().is_ok();
    let profile_ok = !input.profile.contains(['"', '\n', '\r']);

    let built = SessionBuilder::<GameState>::new()
        .with_config(config)
        .with_profile(input.profile)
        .build();
    // Building never opens a socket, so acceptance depends only on the inputs.
    assert_eq!(built.is_ok(), valid && profile_ok);
});
