//! Client identifiers.
//!
//! The connect request carries a 16-bit client id (the "qport") that lets the
//! server recognise a client whose NAT mapping changed. Sessions running in
//! one process must not share an id, so ids come from a [`ClientIdAllocator`]
//! and are held as [`ClientIdLease`]s that return the id on drop.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::rng::{Pcg32, Rng, SeedableRng};
use crate::NetchanError;

#[derive(Debug)]
struct AllocatorInner {
    rng: Pcg32,
    in_use: BTreeSet<u16>,
}

/// Hands out distinct client ids. Clones share the same pool.
#[derive(Debug, Clone)]
pub struct ClientIdAllocator {
    inner: Arc<Mutex<AllocatorInner>>,
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientIdAllocator {
    /// An allocator drawing ids from entropy.
    #[must_use]
    pub fn new() -> Self {
        Self::from_rng(Pcg32::from_entropy())
    }

    /// The process-wide pool sessions use unless given another allocator.
    #[must_use]
    pub fn shared() -> Self {
        static SHARED: OnceLock<ClientIdAllocator> = OnceLock::new();
        SHARED.get_or_init(Self::new).clone()
    }

    /// Whether `self` and `other` hand out ids from the same pool.
    #[must_use]
    pub fn shares_pool_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// An allocator with a reproducible id sequence.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(Pcg32::seed_from_u64(seed))
    }

    fn from_rng(rng: Pcg32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AllocatorInner {
                rng,
                in_use: BTreeSet::new(),
            })),
        }
    }

    /// Reserves an unused id in `1..=65535`.
    ///
    /// # Errors
    ///
    /// `NetchanError::InvalidRequest` when every id is taken.
    pub fn allocate(&self) -> Result<ClientIdLease, NetchanError> {
        let mut inner = self.inner.lock();
        if inner.in_use.len() >= usize::from(u16::MAX) {
            return Err(NetchanError::InvalidRequest {
                info: "all client ids are in use".to_owned(),
            });
        }
        let start = inner.rng.gen_range(1..u32::from(u16::MAX) + 1) as u16;
        // Probe upwards from the random start, wrapping past 65535 to 1.
        let id = (0..u16::MAX)
            .map(|step| ((u32::from(start) - 1 + u32::from(step)) % u32::from(u16::MAX) + 1) as u16)
            .find(|candidate| !inner.in_use.contains(candidate))
            .ok_or_else(|| NetchanError::InvalidRequest {
                info: "all client ids are in use".to_owned(),
            })?;
        inner.in_use.insert(id);
        Ok(ClientIdLease {
            id,
            allocator: Arc::clone(&self.inner),
        })
    }

    /// Number of ids currently leased.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use.len()
    }
}

/// A reserved client id, released when dropped.
#[derive(Debug)]
pub struct ClientIdLease {
    id: u16,
    allocator: Arc<Mutex<AllocatorInner>>,
}

impl ClientIdLease {
    /// The reserved id.
    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for ClientIdLease {
    fn drop(&mut self) {
        self.allocator.lock().in_use.remove(&self.id);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn leases_are_distinct_and_released_on_drop() {
        let allocator = ClientIdAllocator::with_seed(1);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), 0);
        assert_eq!(allocator.in_use(), 2);
        drop(a);
        assert_eq!(allocator.in_use(), 1);
    }

    #[test]
    fn clones_share_the_pool() {
        let allocator = ClientIdAllocator::with_seed(5);
        let other = allocator.clone();
        let lease = allocator.allocate().unwrap();
        assert_eq!(other.in_use(), 1);
        drop(lease);
        assert_eq!(other.in_use(), 0);
    }

    #[test]
    fn shared_pool_is_one_pool() {
        let a = ClientIdAllocator::shared();
        let b = ClientIdAllocator::shared();
        assert!(a.shares_pool_with(&b));
        assert!(!a.shares_pool_with(&ClientIdAllocator::with_seed(1)));
        let first = a.allocate().unwrap();
        let second = b.allocate().unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn same_seed_same_first_id() {
        let a = ClientIdAllocator::with_seed(77).allocate().unwrap().id();
        let b = ClientIdAllocator::with_seed(77).allocate().unwrap().id();
        assert_eq!(a, b);
    }

    #[test]
    fn many_leases_never_collide() {
        let allocator = ClientIdAllocator::with_seed(3);
        let leases: Vec<_> = (0..2000).map(|_| allocator.allocate().unwrap()).collect();
        let ids: BTreeSet<u16> = leases.iter().map(ClientIdLease::id).collect();
        assert_eq!(ids.len(), 2000);
    }
}
