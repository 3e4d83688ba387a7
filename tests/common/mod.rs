//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `fake_server`: a scripted protocol 34 server on a loopback UDP socket
//! - `wire`: encoders for the server messages the fake server sends
//! - `test_utils`: shared configuration and polling helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::fake_server::{FakeServer, ServerScript};
//! use common::test_utils::{fast_config, wait_for};
//! ```

pub mod fake_server;
pub mod test_utils;
pub mod wire;
