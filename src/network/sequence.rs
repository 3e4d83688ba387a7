//! Sequence numbers with a packed reliability flag.
//!
//! Every frame on the wire starts with one or two 32-bit little-endian words.
//! The low 31 bits carry a monotonically increasing counter; bit 31 carries
//! a reliability flag. For the first word of a client or server frame the
//! flag means "this frame contains reliable data". For the second word it is
//! the echoed reliable parity of the peer.
//!
//! ```text
//!  byte 0     byte 1     byte 2     byte 3
//! ┌─────────┬──────────┬──────────┬─┬────────┐
//! │ value[0..8] ...               │R│ value[24..31]
//! └─────────┴──────────┴──────────┴─┴────────┘
//! ```

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Number of bytes a [`SequenceNumber`] occupies on the wire.
pub const SEQUENCE_SIZE: usize = 4;

const RELIABLE_BIT: u32 = 1 << 31;
const VALUE_MASK: u32 = !RELIABLE_BIT;

/// A 31-bit sequence counter plus a 1-bit reliability flag.
///
/// Equality, ordering and hashing consider only [`value`](Self::value); the
/// reliability flag is metadata carried alongside the counter.
///
/// # Examples
///
/// ```
/// use netchan_client::SequenceNumber;
///
/// let seq = SequenceNumber::new(5, true);
/// let bytes = seq.encode();
/// assert_eq!(bytes, [5, 0, 0, 0x80]);
///
/// let decoded = SequenceNumber::decode(&bytes, 0);
/// assert_eq!(decoded.value(), 5);
/// assert!(decoded.is_reliable());
/// ```
#[derive(Debug, Copy, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SequenceNumber {
    value: u32,
    reliable: bool,
}

impl SequenceNumber {
    /// The largest representable counter, also the connectionless sentinel.
    pub const MAX_VALUE: u32 = VALUE_MASK;

    /// The sequence field of every connectionless datagram.
    pub const CONNECTIONLESS: Self = Self {
        value: Self::MAX_VALUE,
        reliable: true,
    };

    /// Creates a sequence number. Bits above the 31-bit counter are discarded.
    #[inline]
    #[must_use]
    pub const fn new(value: u32, reliable: bool) -> Self {
        Self {
            value: value & VALUE_MASK,
            reliable,
        }
    }

    /// Builds a sequence number from a raw wire word.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            value: raw & VALUE_MASK,
            reliable: raw & RELIABLE_BIT != 0,
        }
    }

    /// Returns the raw wire word.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        if self.reliable {
            self.value | RELIABLE_BIT
        } else {
            self.value
        }
    }

    /// The 31-bit counter.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u32 {
        self.value
    }

    /// Whether the reliability flag is set.
    #[inline]
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        self.reliable
    }

    /// Returns a copy with the reliability flag replaced.
    #[inline]
    #[must_use]
    pub const fn with_reliable(self, reliable: bool) -> Self {
        Self {
            value: self.value,
            reliable,
        }
    }

    /// Whether this is the connectionless sentinel.
    #[inline]
    #[must_use]
    pub const fn is_connectionless(self) -> bool {
        self.value == Self::MAX_VALUE && self.reliable
    }

    /// Little-endian encoding with bit 31 of the last byte set when reliable.
    #[inline]
    #[must_use]
    pub const fn encode(self) -> [u8; SEQUENCE_SIZE] {
        self.to_raw().to_le_bytes()
    }

    /// Decodes the four bytes at `offset`.
    ///
    /// The caller guarantees `bytes.len() >= offset + 4`; shorter input is a
    /// contract violation and panics.
    #[inline]
    #[must_use]
    pub fn decode(bytes: &[u8], offset: usize) -> Self {
        let word = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        Self::from_raw(u32::from_le_bytes(word))
    }

    /// Decodes the four bytes at `offset`, or `None` if the slice is too short.
    #[inline]
    #[must_use]
    pub fn try_decode(bytes: &[u8], offset: usize) -> Option<Self> {
        let end = offset.checked_add(SEQUENCE_SIZE)?;
        let word: [u8; SEQUENCE_SIZE] = bytes.get(offset..end)?.try_into().ok()?;
        Some(Self::from_raw(u32::from_le_bytes(word)))
    }

    /// The following counter value, keeping the reliability flag.
    ///
    /// Wrapping past [`MAX_VALUE`](Self::MAX_VALUE) is not handled; at sixty
    /// frames a second a session would need over a year to get there.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self::new(self.value + 1, self.reliable)
    }

    /// The preceding counter value, never dropping below 1.
    #[inline]
    #[must_use]
    pub const fn previous(self) -> Self {
        let value = if self.value > 1 { self.value - 1 } else { 1 };
        Self {
            value,
            reliable: self.reliable,
        }
    }
}

impl PartialEq for SequenceNumber {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for SequenceNumber {}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for SequenceNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_connectionless() {
            write!(f, "CONNECTIONLESS")
        } else if self.reliable {
            write!(f, "{}R", self.value)
        } else {
            write!(f, "{}", self.value)
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn encode_sets_high_bit_of_last_byte_when_reliable() {
        assert_eq!(SequenceNumber::new(1, false).encode(), [1, 0, 0, 0]);
        assert_eq!(SequenceNumber::new(1, true).encode(), [1, 0, 0, 0x80]);
        assert_eq!(
            SequenceNumber::new(0x0102_0304, true).encode(),
            [0x04, 0x03, 0x02, 0x81]
        );
    }

    #[test]
    fn decode_at_offset() {
        let bytes = [0xAA, 0xBB, 7, 0, 0, 0x80, 9, 0, 0, 0];
        let a = SequenceNumber::decode(&bytes, 2);
        let b = SequenceNumber::decode(&bytes, 6);
        assert_eq!(a.value(), 7);
        assert!(a.is_reliable());
        assert_eq!(b.value(), 9);
        assert!(!b.is_reliable());
    }

    #[test]
    fn try_decode_rejects_short_input() {
        assert!(SequenceNumber::try_decode(&[1, 2, 3], 0).is_none());
        assert!(SequenceNumber::try_decode(&[1, 2, 3, 4], 1).is_none());
        assert!(SequenceNumber::try_decode(&[1, 0, 0, 0], 0).is_some());
    }

    #[test]
    fn connectionless_sentinel_wire_form() {
        let bytes = SequenceNumber::CONNECTIONLESS.encode();
        assert_eq!(bytes, [0xFF, 0xFF, 0xFF, 0xFF]);
        let decoded = SequenceNumber::decode(&bytes, 0);
        assert_eq!(decoded.value(), 0x7fff_ffff);
        assert!(decoded.is_reliable());
        assert!(decoded.is_connectionless());
    }

    #[test]
    fn unreliable_max_is_not_connectionless() {
        assert!(!SequenceNumber::new(SequenceNumber::MAX_VALUE, false).is_connectionless());
    }

    #[test]
    fn next_and_previous() {
        let seq = SequenceNumber::new(10, true);
        assert_eq!(seq.next().value(), 11);
        assert!(seq.next().is_reliable());
        assert_eq!(seq.previous().value(), 9);
        assert_eq!(SequenceNumber::new(1, false).previous().value(), 1);
        assert_eq!(SequenceNumber::new(0, false).previous().value(), 1);
    }

    #[test]
    fn equality_ignores_reliability() {
        assert_eq!(SequenceNumber::new(3, true), SequenceNumber::new(3, false));
        assert!(SequenceNumber::new(4, false) > SequenceNumber::new(3, true));
    }

    #[test]
    fn new_masks_high_bit() {
        let seq = SequenceNumber::new(u32::MAX, false);
        assert_eq!(seq.value(), SequenceNumber::MAX_VALUE);
        assert!(!seq.is_reliable());
    }

    #[test]
    fn display() {
        assert_eq!(SequenceNumber::new(42, true).to_string(), "42R");
        assert_eq!(SequenceNumber::new(42, false).to_string(), "42");
        assert_eq!(SequenceNumber::CONNECTIONLESS.to_string(), "CONNECTIONLESS");
    }
}
