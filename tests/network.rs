//! Network integration tests.
//!
//! These exercise [`netchan_client::Transport`] over real loopback UDP
//! sockets, with the test thread playing the server by hand.

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Network test modules
mod network {
    pub mod transport;
}
