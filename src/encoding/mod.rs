//! DNP3 Wire Encoding Module
//!
//! This module provides the low-level serialization primitives shared by the
//! rest of the stack. DNP3 transmits every multi-octet field least-significant
//! octet first, so all helpers here are little-endian.
//!
//! # Overview
//!
//! The encoding module is responsible for:
//! - Reading and writing little-endian integers and IEEE-754 values
//! - The bounded [`ResponseWriter`] used to assemble one response fragment
//! - The reserve-then-patch mechanism for object headers whose ranges are
//!   not known until their points have been written
//! - The [`Reader`] cursor used when parsing request fragments
//!
//! # Example
//!
//! ```
//! use dnp3_rs::encoding::ResponseWriter;
//!
//! let mut writer = ResponseWriter::new(249);
//! writer.write_u8(0x01).unwrap();
//! writer.write_u16_le(0x1234).unwrap();
//! assert_eq!(writer.as_slice(), &[0x01, 0x34, 0x12]);
//! ```

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use bytes::{BufMut, BytesMut};

/// Result type for encoding operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, EncodingError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingError {
    /// Write would exceed the fragment capacity
    BufferOverflow,
    /// Read past the end of the request data
    BufferUnderflow,
    /// Qualifier code not recognized
    InvalidQualifier(u8),
    /// Range or count field inconsistent (e.g. start > stop)
    InvalidRange,
    /// Value cannot be represented in the requested width
    ValueOutOfRange,
    /// Patch offset outside the written region
    InvalidPatchOffset,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::BufferOverflow => write!(f, "Write exceeds fragment capacity"),
            EncodingError::BufferUnderflow => write!(f, "Read past end of data"),
            EncodingError::InvalidQualifier(q) => write!(f, "Invalid qualifier code 0x{:02X}", q),
            EncodingError::InvalidRange => write!(f, "Inconsistent range field"),
            EncodingError::ValueOutOfRange => write!(f, "Value out of representable range"),
            EncodingError::InvalidPatchOffset => write!(f, "Patch offset outside written data"),
        }
    }
}

#[cfg(feature = "std")]
impl Error for EncodingError {}

/// Bounded byte sink representing one outgoing application-layer fragment.
///
/// The writer refuses any write that would exceed the fragment capacity and
/// leaves the buffer unchanged in that case, so callers can probe for space
/// and fall back to multi-fragment continuation. Previously written octets
/// can be patched in place, which is how object headers get their final
/// range/count once the number of emitted points is known.
#[derive(Debug)]
pub struct ResponseWriter {
    buf: BytesMut,
    capacity: usize,
}

impl ResponseWriter {
    /// Create a writer for one fragment of at most `capacity` octets
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Octets still available in this fragment
    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Octets written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current write position, usable later with [`patch`](Self::patch)
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Append raw octets
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining_capacity() {
            return Err(EncodingError::BufferOverflow);
        }
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Write a single octet
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.append(&[value])
    }

    /// Write a 16-bit unsigned value, least-significant octet first
    pub fn write_u16_le(&mut self, value: u16) -> Result<()> {
        self.append(&value.to_le_bytes())
    }

    /// Write a 32-bit unsigned value, least-significant octet first
    pub fn write_u32_le(&mut self, value: u32) -> Result<()> {
        self.append(&value.to_le_bytes())
    }

    /// Write a 16-bit signed value, least-significant octet first
    pub fn write_i16_le(&mut self, value: i16) -> Result<()> {
        self.append(&value.to_le_bytes())
    }

    /// Write a 32-bit signed value, least-significant octet first
    pub fn write_i32_le(&mut self, value: i32) -> Result<()> {
        self.append(&value.to_le_bytes())
    }

    /// Write an IEEE-754 single-precision value
    pub fn write_f32_le(&mut self, value: f32) -> Result<()> {
        self.append(&value.to_le_bytes())
    }

    /// Write an IEEE-754 double-precision value
    pub fn write_f64_le(&mut self, value: f64) -> Result<()> {
        self.append(&value.to_le_bytes())
    }

    /// Overwrite previously written octets at `offset`.
    ///
    /// The patched region must lie entirely within the data written so far.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(EncodingError::InvalidPatchOffset)?;
        if end > self.buf.len() {
            return Err(EncodingError::InvalidPatchOffset);
        }
        self.buf[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Drop everything written at or after `len`.
    ///
    /// Used to remove an object header that ended up with zero points.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// View the fragment assembled so far
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer and return the finished fragment
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Read cursor over a received request fragment
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader over the given octets
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Octets not yet consumed
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current read position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read a single octet
    pub fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    /// Read a 16-bit unsigned value, least-significant octet first
    pub fn read_u16_le(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit unsigned value, least-significant octet first
    pub fn read_u32_le(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a 48-bit unsigned value, least-significant octet first
    pub fn read_u48_le(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(6)?;
        let mut buf = [0u8; 8];
        buf[..6].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a 16-bit signed value, least-significant octet first
    pub fn read_i16_le(&mut self) -> Result<i16> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit signed value, least-significant octet first
    pub fn read_i32_le(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read an IEEE-754 single-precision value
    pub fn read_f32_le(&mut self) -> Result<f32> {
        let bytes = self.read_bytes(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read an IEEE-754 double-precision value
    pub fn read_f64_le(&mut self) -> Result<f64> {
        let bytes = self.read_bytes(8)?;
        Ok(f64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Read `n` raw octets
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(EncodingError::BufferUnderflow);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

/// Write a 48-bit unsigned value, least-significant octet first
pub fn write_u48_le(writer: &mut ResponseWriter, value: u64) -> Result<()> {
    if value > 0xFFFF_FFFF_FFFF {
        return Err(EncodingError::ValueOutOfRange);
    }
    writer.append(&value.to_le_bytes()[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_little_endian() {
        let mut writer = ResponseWriter::new(64);
        writer.write_u16_le(0xABCD).unwrap();
        writer.write_u32_le(0x0102_0304).unwrap();
        writer.write_i16_le(-2).unwrap();
        assert_eq!(
            writer.as_slice(),
            &[0xCD, 0xAB, 0x04, 0x03, 0x02, 0x01, 0xFE, 0xFF]
        );
    }

    #[test]
    fn test_writer_capacity_enforced() {
        let mut writer = ResponseWriter::new(3);
        writer.write_u16_le(1).unwrap();
        assert_eq!(writer.remaining_capacity(), 1);

        // A two-octet write must fail and leave the buffer untouched
        assert_eq!(writer.write_u16_le(2), Err(EncodingError::BufferOverflow));
        assert_eq!(writer.len(), 2);

        writer.write_u8(0xEE).unwrap();
        assert_eq!(writer.remaining_capacity(), 0);
    }

    #[test]
    fn test_patch_in_place() {
        let mut writer = ResponseWriter::new(16);
        writer.append(&[0, 0, 0, 0]).unwrap();
        let offset = writer.position();
        writer.write_u8(0xAA).unwrap();

        writer.patch(1, &[0x11, 0x22]).unwrap();
        assert_eq!(writer.as_slice(), &[0x00, 0x11, 0x22, 0x00, 0xAA]);

        // Patching past the written region is rejected
        assert_eq!(
            writer.patch(offset, &[1, 2, 3]),
            Err(EncodingError::InvalidPatchOffset)
        );
    }

    #[test]
    fn test_truncate_rolls_back() {
        let mut writer = ResponseWriter::new(16);
        writer.append(&[1, 2, 3]).unwrap();
        let mark = writer.position();
        writer.append(&[4, 5]).unwrap();
        writer.truncate(mark);
        assert_eq!(writer.as_slice(), &[1, 2, 3]);
        assert_eq!(writer.remaining_capacity(), 13);
    }

    #[test]
    fn test_reader_round_trip() {
        let mut writer = ResponseWriter::new(64);
        writer.write_u8(7).unwrap();
        writer.write_u16_le(1000).unwrap();
        writer.write_i32_le(-123456).unwrap();
        writer.write_f32_le(2.5).unwrap();
        writer.write_f64_le(-0.125).unwrap();
        write_u48_le(&mut writer, 0x0000_4859_8E7D_1234).unwrap();

        let frame = writer.into_vec();
        let mut reader = Reader::new(&frame);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16_le().unwrap(), 1000);
        assert_eq!(reader.read_i32_le().unwrap(), -123456);
        assert_eq!(reader.read_f32_le().unwrap(), 2.5);
        assert_eq!(reader.read_f64_le().unwrap(), -0.125);
        assert_eq!(reader.read_u48_le().unwrap(), 0x0000_4859_8E7D_1234);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_underflow() {
        let data = [0x01];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.read_u16_le(), Err(EncodingError::BufferUnderflow));
        // Position unchanged after a failed read
        assert_eq!(reader.read_u8().unwrap(), 0x01);
    }

    #[test]
    fn test_u48_range_check() {
        let mut writer = ResponseWriter::new(8);
        assert_eq!(
            write_u48_le(&mut writer, 0x0001_0000_0000_0000),
            Err(EncodingError::ValueOutOfRange)
        );
        write_u48_le(&mut writer, 0xFFFF_FFFF_FFFF).unwrap();
        assert_eq!(writer.as_slice(), &[0xFF; 6]);
    }
}
