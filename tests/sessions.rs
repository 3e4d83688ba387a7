//! Session integration tests.
//!
//! Every test drives a real [`netchan_client::Session`] over loopback UDP
//! against the scripted server in `common::fake_server`:
//! - Lifecycle: handshake, level load, moves, commands, disconnects
//! - Reconnect: server-initiated map changes

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Session test modules
mod sessions {
    pub mod lifecycle;
    pub mod reconnect;
}
