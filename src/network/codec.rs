//! Binary codec helpers for the wire format.
//!
//! Two tools live here:
//!
//! - A centralized bincode configuration (`standard()` with fixed-width,
//!   little-endian integers) used for fixed-layout payloads such as the move
//!   command. Fixed-width integers are what make those payloads constant-size.
//! - [`ByteReader`], a bounds-checked little-endian cursor used by the server
//!   message decoders, whose layouts are self-describing and cannot be
//!   expressed as a single serde struct.
//!
//! # Examples
//!
//! ```
//! use netchan_client::network::codec::{encode_append, ByteReader};
//!
//! let mut out = vec![0xAA];
//! assert_eq!(encode_append(&0x0102_0304u32, &mut out).unwrap(), 4);
//! assert_eq!(out, [0xAA, 4, 3, 2, 1]);
//!
//! let mut reader = ByteReader::new(b"hi\0\x05");
//! assert_eq!(reader.read_string().unwrap(), "hi");
//! assert_eq!(reader.read_u8().unwrap(), 5);
//! ```

use serde::Serialize;
use std::fmt;

fn config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Errors that can occur during encoding or decoding.
///
/// Bincode errors are opaque, so their text is kept as a `String`. Cursor
/// underflow is structured since it happens on the receive hot path.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Serializing a fixed-layout payload failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
    },
    /// A read ran past the end of the input.
    UnexpectedEnd {
        /// Cursor position when the read was attempted.
        position: usize,
        /// Bytes the read needed.
        needed: usize,
        /// Bytes that were left.
        available: usize,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message } => write!(f, "payload encoding failed: {message}"),
            Self::UnexpectedEnd {
                position,
                needed,
                available,
            } => write!(
                f,
                "unexpected end of input at offset {position}: needed {needed} bytes, {available} available"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a fixed-layout value by appending to `buffer`, returning the bytes appended.
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::EncodeError {
            message: e.to_string(),
        })
}

/// Bounds-checked little-endian cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `bytes`.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Creates a reader positioned at `position`.
    #[must_use]
    pub const fn at(bytes: &'a [u8], position: usize) -> Self {
        Self { bytes, position }
    }

    /// Current offset into the underlying slice.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.position)
    }

    /// Whether the cursor reached the end.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let available = self.remaining();
        if len > available {
            return Err(CodecError::UnexpectedEnd {
                position: self.position,
                needed: len,
                available,
            });
        }
        let start = self.position;
        self.position += len;
        Ok(&self.bytes[start..self.position])
    }

    /// Reads everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let start = self.position.min(self.bytes.len());
        self.position = self.bytes.len();
        &self.bytes[start..]
    }

    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Reads an unsigned byte.
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a signed byte.
    pub fn read_i8(&mut self) -> CodecResult<i8> {
        Ok(i8::from_le_bytes(self.read_array()?))
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Reads a little-endian `i16`.
    pub fn read_i16(&mut self) -> CodecResult<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> CodecResult<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Reads a NUL-terminated string.
    ///
    /// A string that runs to the end of the input without a terminator is
    /// accepted. Invalid UTF-8 is replaced rather than rejected, matching how
    /// game servers freely embed high-bit "colored" characters.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let rest = &self.bytes[self.position.min(self.bytes.len())..];
        let (text, consumed) = match rest.iter().position(|&b| b == 0) {
            Some(nul) => (&rest[..nul], nul + 1),
            None => (rest, rest.len()),
        };
        self.position += consumed;
        Ok(String::from_utf8_lossy(text).into_owned())
    }

    /// Reads a coordinate stored as a short in 1/8 units.
    pub fn read_coord(&mut self) -> CodecResult<f32> {
        Ok(f32::from(self.read_i16()?) * 0.125)
    }

    /// Reads three coordinates.
    pub fn read_position(&mut self) -> CodecResult<[f32; 3]> {
        Ok([self.read_coord()?, self.read_coord()?, self.read_coord()?])
    }

    /// Reads an angle stored as a byte in 1/256 turns, in degrees.
    pub fn read_angle(&mut self) -> CodecResult<f32> {
        Ok(f32::from(self.read_i8()?) * (360.0 / 256.0))
    }

    /// Reads an angle stored as a short in 1/65536 turns, in degrees.
    pub fn read_angle16(&mut self) -> CodecResult<f32> {
        Ok(f32::from(self.read_i16()?) * (360.0 / 65536.0))
    }
}

/// Converts degrees into the 16-bit angle representation used by move commands.
#[must_use]
pub fn angle_to_short(degrees: f32) -> i16 {
    ((degrees * 65536.0 / 360.0) as i32 & 0xFFFF) as u16 as i16
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    #[derive(serde::Serialize)]
    struct Fixed {
        a: u8,
        b: i32,
        c: [i16; 3],
    }

    #[test]
    fn fixed_layout_is_little_endian_and_unpadded() {
        let value = Fixed {
            a: 2,
            b: -1,
            c: [1, 256, -2],
        };
        let mut bytes = Vec::new();
        let len = encode_append(&value, &mut bytes).unwrap();
        assert_eq!(
            bytes,
            vec![2, 0xFF, 0xFF, 0xFF, 0xFF, 1, 0, 0, 1, 0xFE, 0xFF]
        );
        assert_eq!(len, bytes.len());
    }

    #[test]
    fn encode_append_reports_appended_length() {
        let mut buffer = vec![9u8];
        let len = encode_append(&7u16, &mut buffer).unwrap();
        assert_eq!(len, 2);
        assert_eq!(buffer, vec![9, 7, 0]);
    }

    #[test]
    fn reader_reads_primitives_in_order() {
        let bytes = [0x01, 0xFE, 0x34, 0x12, 0xFF, 0xFF, 0x78, 0x56, 0x34, 0x12];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_i8().unwrap(), -2);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_i16().unwrap(), -1);
        assert_eq!(reader.read_i32().unwrap(), 0x1234_5678);
        assert!(reader.is_empty());
    }

    #[test]
    fn reader_underflow_is_an_error_and_does_not_advance() {
        let mut reader = ByteReader::new(&[1, 2, 3]);
        reader.read_u8().unwrap();
        let err = reader.read_i32().unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedEnd {
                position: 1,
                needed: 4,
                available: 2
            }
        );
        assert_eq!(reader.position(), 1);
    }

    #[test]
    fn reader_strings() {
        let mut reader = ByteReader::new(b"abc\0def");
        assert_eq!(reader.read_string().unwrap(), "abc");
        assert_eq!(reader.position(), 4);
        assert_eq!(reader.read_string().unwrap(), "def");
        assert!(reader.is_empty());
        assert_eq!(reader.read_string().unwrap(), "");
    }

    #[test]
    fn reader_rest() {
        let mut reader = ByteReader::at(&[1, 2, 3, 4], 1);
        assert_eq!(reader.read_rest(), &[2, 3, 4]);
        assert!(reader.is_empty());
        assert!(reader.read_rest().is_empty());
    }

    #[test]
    fn coords_and_angles() {
        let mut reader = ByteReader::new(&[16, 0, 64, 0x00, 0x40]);
        assert_eq!(reader.read_coord().unwrap(), 2.0);
        assert_eq!(reader.read_angle().unwrap(), 90.0);
        assert_eq!(reader.read_angle16().unwrap(), 90.0);
    }

    #[test]
    fn angle_to_short_wraps() {
        assert_eq!(angle_to_short(90.0), 0x4000);
        assert_eq!(angle_to_short(-90.0), -0x4000);
        assert_eq!(angle_to_short(270.0), -0x4000);
    }

    #[test]
    fn codec_error_display() {
        let err = CodecError::EncodeError {
            message: "sequence too long".to_owned(),
        };
        assert!(err.to_string().contains("sequence too long"));
        let err = CodecError::UnexpectedEnd {
            position: 3,
            needed: 4,
            available: 1,
        };
        assert!(err.to_string().contains("offset 3"));
    }
}
