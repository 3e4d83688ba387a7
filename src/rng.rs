//! Small seedable PRNG based on PCG32.
//!
//! Used for reconnect back-off jitter and client-id allocation. Neither needs
//! cryptographic quality, but both need to be reproducible in tests, so every
//! consumer accepts an explicit seed.
//!
//! ```rust
//! use netchan_client::rng::{Pcg32, Rng, SeedableRng};
//!
//! let mut rng = Pcg32::seed_from_u64(12345);
//! let value = rng.gen_range(0..100);
//! assert!(value < 100);
//! ```

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

/// PCG-XSH-RR with 64 bits of state. Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a generator for `state` on the given stream.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Next 32-bit output.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Next 64-bit output, two 32-bit draws combined.
    #[inline]
    #[must_use]
    pub fn next_u64(&mut self) -> u64 {
        let high = u64::from(self.next_u32());
        let low = u64::from(self.next_u32());
        (high << 32) | low
    }
}

/// Construction of generators from seeds.
pub trait SeedableRng: Sized {
    /// Creates a generator from a 64-bit seed.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;

    /// Creates a generator seeded from process-local entropy.
    #[must_use]
    fn from_entropy() -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }
}

/// Random draws.
pub trait Rng {
    /// Next 32-bit value.
    fn next_u32(&mut self) -> u32;

    /// Next 64-bit value.
    fn next_u64(&mut self) -> u64;

    /// A value in `[low, high)`.
    ///
    /// An empty range is reported via telemetry and yields `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() || span == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        // Rejection sampling keeps the result unbiased.
        let threshold = span.wrapping_neg() % span;
        loop {
            let random_value = self.next_u32();
            if random_value >= threshold {
                return range.start.wrapping_add(random_value % span);
            }
        }
    }

    /// A value in `[low, high]`; `low > high` is treated as `high..=low`.
    fn gen_range_inclusive(&mut self, low: u32, high: u32) -> u32 {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        match high.checked_add(1) {
            Some(end) => self.gen_range(low..end),
            None if low == 0 => self.next_u32(),
            None => self.gen_range(low - 1..high).wrapping_add(1),
        }
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Self::next_u32(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        Self::next_u64(self)
    }
}

/// Seed from the standard library's per-process random hasher keys mixed
/// with the wall clock and thread identity.
fn entropy_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    std::thread::current().id().hash(&mut hasher);
    if let Ok(since_epoch) = web_time::SystemTime::now().duration_since(web_time::UNIX_EPOCH) {
        since_epoch.as_nanos().hash(&mut hasher);
    }
    hasher.finish().wrapping_add(0x9e3779b97f4a7c15)
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

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let same = (0..100).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 5);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(7);
        for _ in 0..1000 {
            let v = rng.gen_range(1000..4000);
            assert!((1000..4000).contains(&v));
        }
    }

    #[test]
    fn gen_range_empty_returns_start() {
        let mut rng = Pcg32::seed_from_u64(7);
        assert_eq!(rng.gen_range(5..5), 5);
    }

    #[test]
    fn gen_range_inclusive_covers_both_ends() {
        let mut rng = Pcg32::seed_from_u64(99);
        let draws: Vec<u32> = (0..200).map(|_| rng.gen_range_inclusive(0, 1)).collect();
        assert!(draws.contains(&0));
        assert!(draws.contains(&1));
        assert_eq!(rng.gen_range_inclusive(3, 3), 3);
        let swapped = rng.gen_range_inclusive(10, 5);
        assert!((5..=10).contains(&swapped));
        let top = rng.gen_range_inclusive(u32::MAX - 1, u32::MAX);
        assert!(top >= u32::MAX - 1);
    }

    #[test]
    fn entropy_seeded_generators_differ() {
        let mut a = Pcg32::from_entropy();
        let mut b = Pcg32::from_entropy();
        let same = (0..10).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 10);
    }
}
