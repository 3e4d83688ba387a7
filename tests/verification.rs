//! Verification integration tests.
//!
//! This module contains property-based tests:
//! - Property tests - wire format and decoding properties with proptest
//! - Invariant tests - parity bookkeeping under random traffic

// Verification test modules
mod verification {
    pub mod invariants;
    pub mod property;
}
