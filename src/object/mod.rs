//! DNP3 Object Model
//!
//! This module defines the application-layer object vocabulary of the
//! outstation: measurement types with their quality flags, event class
//! membership, and the object headers that address points on the wire.
//!
//! # Overview
//!
//! Everything a master reads from or writes to an outstation is expressed as
//! an *object*: an instance of an object **group** (binary inputs are group 1,
//! their change events group 2, analog inputs group 30, and so on) encoded in
//! one of several **variations** (with flags, with time, bare value, packed
//! bits). An object header names the group, the variation, and a *qualifier*
//! describing which points follow:
//!
//! - **All points** (0x06): every point the outstation has
//! - **Start/stop range** (0x00/0x01): a contiguous index range
//! - **Limited quantity** (0x07/0x08): the first N points
//! - **Index list** (0x17/0x28): an explicit list of point numbers
//!
//! The 8-bit and 16-bit forms of the range, quantity and index qualifiers are
//! kept distinct so a control request can be echoed byte-exactly.
//!
//! # Quality flags
//!
//! Every measurement carries a flags octet. Bit 0 (`ONLINE`) set with all
//! other quality bits clear is the *nominal* state; the static response
//! builder uses this to decide whether a bare-value variation can represent a
//! point or a flag-carrying variation is required. For single-bit and
//! double-bit types the point state itself travels in the top bits of the
//! same octet, so [`Flags`] here holds only the quality bits and the state is
//! merged in at encode time.
//!
//! # Examples
//!
//! ```
//! use dnp3_rs::object::{Flags, ClassMask, Binary};
//!
//! let point = Binary {
//!     value: true,
//!     flags: Flags::ONLINE,
//! };
//! assert!(point.flags.is_nominal());
//!
//! let mask = ClassMask::CLASS_1 | ClassMask::CLASS_2;
//! assert!(mask.contains(ClassMask::CLASS_1));
//! ```

use bitflags::bitflags;

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::encoding::{self, EncodingError, Reader, ResponseWriter};

/// Result type for object operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, ObjectError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, ObjectError>;

/// Errors that can occur while interpreting object headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectError {
    /// Object group/variation pair not known to this outstation
    UnknownGroupVariation(u8, u8),
    /// Qualifier not valid for the requested operation
    UnsupportedQualifier,
    /// Point index beyond the database quantity
    IndexOutOfRange,
    /// Range start exceeds stop, or count exceeds the database quantity
    InvalidRange,
    /// Underlying wire-format error
    Encoding(EncodingError),
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectError::UnknownGroupVariation(g, v) => {
                write!(f, "Unknown object g{}v{}", g, v)
            }
            ObjectError::UnsupportedQualifier => write!(f, "Unsupported qualifier"),
            ObjectError::IndexOutOfRange => write!(f, "Point index out of range"),
            ObjectError::InvalidRange => write!(f, "Invalid range"),
            ObjectError::Encoding(e) => write!(f, "Encoding error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl Error for ObjectError {}

impl From<EncodingError> for ObjectError {
    fn from(value: EncodingError) -> Self {
        ObjectError::Encoding(value)
    }
}

bitflags! {
    /// Measurement quality flags.
    ///
    /// Bits 5-7 are type-specific on the wire: `CHATTER_FILTER`, `ROLLOVER`
    /// and `OVER_RANGE` share bit 5, and binary/double-bit state occupies the
    /// top bits. State never lives in a `Flags` value; the encoders merge it
    /// in when a flag-carrying variation is written.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Flags: u8 {
        const ONLINE          = 0b0000_0001;
        const RESTART         = 0b0000_0010;
        const COMM_LOST       = 0b0000_0100;
        const REMOTE_FORCED   = 0b0000_1000;
        const LOCAL_FORCED    = 0b0001_0000;
        /// Binary input chatter filter (bit 5)
        const CHATTER_FILTER  = 0b0010_0000;
        /// Counter rollover (bit 5)
        const ROLLOVER        = 0b0010_0000;
        /// Analog over-range (bit 5)
        const OVER_RANGE      = 0b0010_0000;
        /// Analog reference check failed (bit 6)
        const REFERENCE_ERR   = 0b0100_0000;
    }
}

impl Flags {
    /// Quality bits valid in a single-bit flags octet (state is bit 7)
    pub const BINARY_MASK: u8 = 0b0111_1111;
    /// Quality bits valid in a double-bit flags octet (state is bits 6-7)
    pub const DOUBLE_BIT_MASK: u8 = 0b0011_1111;

    /// True when the point is simply online with no abnormal quality.
    ///
    /// Nominal points can be carried by bare-value and packed variations;
    /// anything else forces a variation with an explicit flags octet.
    pub fn is_nominal(&self) -> bool {
        *self == Flags::ONLINE
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::RESTART
    }
}

bitflags! {
    /// Event class membership of a point.
    ///
    /// An empty mask means the point produces no events (static only, the
    /// class-0 bucket). Assignment is per point and may be changed at runtime
    /// by an assign-class request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ClassMask: u8 {
        const CLASS_1 = 0b001;
        const CLASS_2 = 0b010;
        const CLASS_3 = 0b100;
    }
}

/// Double-bit point state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum DoubleBit {
    /// Transitioning between end states
    Intermediate = 0,
    DeterminedOff = 1,
    DeterminedOn = 2,
    /// Abnormal or custom state
    Indeterminate = 3,
}

impl DoubleBit {
    /// Build from the two state bits
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => DoubleBit::Intermediate,
            1 => DoubleBit::DeterminedOff,
            2 => DoubleBit::DeterminedOn,
            _ => DoubleBit::Indeterminate,
        }
    }
}

/// Binary input measurement
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Binary {
    pub value: bool,
    pub flags: Flags,
}

/// Double-bit binary input measurement
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DoubleBitBinary {
    pub value: DoubleBit,
    pub flags: Flags,
}

/// Binary output status point
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BinaryOutputStatus {
    pub value: bool,
    pub flags: Flags,
}

/// Counter measurement
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Counter {
    pub value: u32,
    pub flags: Flags,
}

/// Analog input measurement
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Analog {
    pub value: f64,
    pub flags: Flags,
}

/// Analog output status point
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnalogOutputStatus {
    pub value: f64,
    pub flags: Flags,
}

/// Qualifier codes as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QualifierCode {
    Range8 = 0x00,
    Range16 = 0x01,
    AllPoints = 0x06,
    Count8 = 0x07,
    Count16 = 0x08,
    Index8 = 0x17,
    Index16 = 0x28,
}

impl TryFrom<u8> for QualifierCode {
    type Error = EncodingError;

    fn try_from(value: u8) -> core::result::Result<Self, EncodingError> {
        match value {
            0x00 => Ok(QualifierCode::Range8),
            0x01 => Ok(QualifierCode::Range16),
            0x06 => Ok(QualifierCode::AllPoints),
            0x07 => Ok(QualifierCode::Count8),
            0x08 => Ok(QualifierCode::Count16),
            0x17 => Ok(QualifierCode::Index8),
            0x28 => Ok(QualifierCode::Index16),
            other => Err(EncodingError::InvalidQualifier(other)),
        }
    }
}

/// Point addressing carried by an object header.
///
/// The 8-bit and 16-bit wire forms are distinct variants so that decoding
/// followed by encoding reproduces the original octets, which the control
/// echo path relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualifier {
    /// 0x06: every point of the group
    AllPoints,
    /// 0x00: contiguous range, single-octet indices
    Range8 { start: u8, stop: u8 },
    /// 0x01: contiguous range, two-octet indices
    Range16 { start: u16, stop: u16 },
    /// 0x07: the first N points, single-octet count
    Count8(u8),
    /// 0x08: the first N points, two-octet count
    Count16(u16),
    /// 0x17: explicit single-octet point numbers
    Index8(Vec<u8>),
    /// 0x28: explicit two-octet point numbers
    Index16(Vec<u16>),
}

impl Qualifier {
    /// The wire code for this qualifier
    pub fn code(&self) -> QualifierCode {
        match self {
            Qualifier::AllPoints => QualifierCode::AllPoints,
            Qualifier::Range8 { .. } => QualifierCode::Range8,
            Qualifier::Range16 { .. } => QualifierCode::Range16,
            Qualifier::Count8(_) => QualifierCode::Count8,
            Qualifier::Count16(_) => QualifierCode::Count16,
            Qualifier::Index8(_) => QualifierCode::Index8,
            Qualifier::Index16(_) => QualifierCode::Index16,
        }
    }

    /// The point numbers this qualifier addresses, given the database
    /// quantity for the group.
    ///
    /// Explicit forms are validated: `start <= stop` with the range inside
    /// the database, every index below `quantity`, a count no larger than
    /// `quantity`. Only the all-points form is open-ended.
    pub fn resolve(&self, quantity: u16) -> Result<PointRange> {
        match self {
            Qualifier::AllPoints => Ok(PointRange::contiguous(0, quantity)),
            Qualifier::Range8 { start, stop } => {
                Self::check_range(*start as u16, *stop as u16, quantity)
            }
            Qualifier::Range16 { start, stop } => Self::check_range(*start, *stop, quantity),
            Qualifier::Count8(n) => Self::check_count(*n as u16, quantity),
            Qualifier::Count16(n) => Self::check_count(*n, quantity),
            Qualifier::Index8(indices) => {
                let wide: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
                Self::check_indices(wide, quantity)
            }
            Qualifier::Index16(indices) => Self::check_indices(indices.clone(), quantity),
        }
    }

    fn check_count(count: u16, quantity: u16) -> Result<PointRange> {
        if count > quantity {
            return Err(ObjectError::InvalidRange);
        }
        Ok(PointRange::contiguous(0, count))
    }

    fn check_range(start: u16, stop: u16, quantity: u16) -> Result<PointRange> {
        if start > stop || stop >= quantity {
            return Err(ObjectError::InvalidRange);
        }
        Ok(PointRange::contiguous(start, stop - start + 1))
    }

    fn check_indices(indices: Vec<u16>, quantity: u16) -> Result<PointRange> {
        if indices.iter().any(|&i| i >= quantity) {
            return Err(ObjectError::IndexOutOfRange);
        }
        Ok(PointRange::Explicit(indices))
    }
}

/// Resolved point set for one object header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointRange {
    /// `count` points starting at `start`
    Contiguous { start: u16, count: u16 },
    /// Explicit point numbers, in request order
    Explicit(Vec<u16>),
}

impl PointRange {
    fn contiguous(start: u16, count: u16) -> Self {
        PointRange::Contiguous { start, count }
    }

    /// Number of points addressed
    pub fn len(&self) -> usize {
        match self {
            PointRange::Contiguous { count, .. } => *count as usize,
            PointRange::Explicit(v) => v.len(),
        }
    }

    /// True when no point is addressed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when point numbers are explicit (index-qualified) rather than a
    /// contiguous range. Packed encodings restart their bit offset per point
    /// in that case.
    pub fn is_explicit(&self) -> bool {
        matches!(self, PointRange::Explicit(_))
    }

    /// The point number at `position` within the set
    pub fn point_at(&self, position: usize) -> Option<u16> {
        match self {
            PointRange::Contiguous { start, count } => {
                if position < *count as usize {
                    Some(start + position as u16)
                } else {
                    None
                }
            }
            PointRange::Explicit(v) => v.get(position).copied(),
        }
    }
}

/// One application-layer object header
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHeader {
    pub group: u8,
    pub variation: u8,
    pub qualifier: Qualifier,
}

impl ObjectHeader {
    /// Create a new object header
    pub fn new(group: u8, variation: u8, qualifier: Qualifier) -> Self {
        Self {
            group,
            variation,
            qualifier,
        }
    }

    /// Encode the header.
    ///
    /// Index-qualified headers encode only the count here; the indices are
    /// interleaved with the point data that follows.
    pub fn encode(&self, writer: &mut ResponseWriter) -> encoding::Result<()> {
        writer.write_u8(self.group)?;
        writer.write_u8(self.variation)?;
        writer.write_u8(self.qualifier.code() as u8)?;
        match &self.qualifier {
            Qualifier::AllPoints => {}
            Qualifier::Range8 { start, stop } => {
                writer.write_u8(*start)?;
                writer.write_u8(*stop)?;
            }
            Qualifier::Range16 { start, stop } => {
                writer.write_u16_le(*start)?;
                writer.write_u16_le(*stop)?;
            }
            Qualifier::Count8(n) => writer.write_u8(*n)?,
            Qualifier::Count16(n) => writer.write_u16_le(*n)?,
            Qualifier::Index8(indices) => writer.write_u8(indices.len() as u8)?,
            Qualifier::Index16(indices) => writer.write_u16_le(indices.len() as u16)?,
        }
        Ok(())
    }

    /// Decode one header from a request fragment.
    ///
    /// For index qualifiers the point numbers follow the count immediately in
    /// request headers (requests carry no object data), so they are consumed
    /// here.
    pub fn decode(reader: &mut Reader<'_>) -> encoding::Result<Self> {
        let group = reader.read_u8()?;
        let variation = reader.read_u8()?;
        let code = QualifierCode::try_from(reader.read_u8()?)?;
        let qualifier = match code {
            QualifierCode::AllPoints => Qualifier::AllPoints,
            QualifierCode::Range8 => {
                let start = reader.read_u8()?;
                let stop = reader.read_u8()?;
                if start > stop {
                    return Err(EncodingError::InvalidRange);
                }
                Qualifier::Range8 { start, stop }
            }
            QualifierCode::Range16 => {
                let start = reader.read_u16_le()?;
                let stop = reader.read_u16_le()?;
                if start > stop {
                    return Err(EncodingError::InvalidRange);
                }
                Qualifier::Range16 { start, stop }
            }
            QualifierCode::Count8 => Qualifier::Count8(reader.read_u8()?),
            QualifierCode::Count16 => Qualifier::Count16(reader.read_u16_le()?),
            QualifierCode::Index8 => {
                let count = reader.read_u8()? as usize;
                let mut indices = Vec::with_capacity(count);
                for _ in 0..count {
                    indices.push(reader.read_u8()?);
                }
                Qualifier::Index8(indices)
            }
            QualifierCode::Index16 => {
                let count = reader.read_u16_le()? as usize;
                let mut indices = Vec::with_capacity(count);
                for _ in 0..count {
                    indices.push(reader.read_u16_le()?);
                }
                Qualifier::Index16(indices)
            }
        };
        Ok(Self {
            group,
            variation,
            qualifier,
        })
    }
}

/// Analog static and output object encodings
pub mod analog;
/// Binary, double-bit and binary-output static object encodings
pub mod binary;
/// Counter static object encodings
pub mod counter;
/// Point provider contract and the in-memory reference database
pub mod database;

pub use analog::{AnalogOutVariation, AnalogVariation};
pub use binary::{BinaryVariation, DoubleBitVariation};
pub use counter::CounterVariation;
pub use database::{
    AnalogOutputProvider, AnalogProvider, BinaryOutputProvider, BinaryProvider, CounterProvider,
    DoubleBitProvider, PointProvider,
};

#[cfg(feature = "std")]
pub use database::{Database, DatabaseConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_nominal() {
        assert!(Flags::ONLINE.is_nominal());
        assert!(!(Flags::ONLINE | Flags::RESTART).is_nominal());
        assert!(!Flags::default().is_nominal());
    }

    #[test]
    fn test_header_round_trip() {
        let headers = [
            ObjectHeader::new(1, 0, Qualifier::AllPoints),
            ObjectHeader::new(1, 2, Qualifier::Range8 { start: 2, stop: 9 }),
            ObjectHeader::new(30, 1, Qualifier::Range16 { start: 0, stop: 300 }),
            ObjectHeader::new(2, 0, Qualifier::Count8(5)),
            ObjectHeader::new(32, 0, Qualifier::Count16(1000)),
        ];
        for header in headers {
            let mut writer = ResponseWriter::new(64);
            header.encode(&mut writer).unwrap();
            let frame = writer.into_vec();
            let decoded = ObjectHeader::decode(&mut Reader::new(&frame)).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_index_header_decode_consumes_indices() {
        // g12v1, 0x17 qualifier, two indices
        let frame = [0x0C, 0x01, 0x17, 0x02, 0x04, 0x09];
        let mut reader = Reader::new(&frame);
        let header = ObjectHeader::decode(&mut reader).unwrap();
        assert_eq!(header.qualifier, Qualifier::Index8(vec![0x04, 0x09]));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_invalid_qualifier_rejected() {
        let frame = [0x01, 0x02, 0x2B, 0x00];
        assert_eq!(
            ObjectHeader::decode(&mut Reader::new(&frame)),
            Err(EncodingError::InvalidQualifier(0x2B))
        );
    }

    #[test]
    fn test_reversed_range_rejected() {
        let frame = [0x01, 0x02, 0x00, 0x05, 0x03];
        assert_eq!(
            ObjectHeader::decode(&mut Reader::new(&frame)),
            Err(EncodingError::InvalidRange)
        );
    }

    #[test]
    fn test_qualifier_resolution() {
        assert_eq!(
            Qualifier::AllPoints.resolve(3).unwrap(),
            PointRange::Contiguous { start: 0, count: 3 }
        );
        assert_eq!(
            Qualifier::Count16(2).resolve(3).unwrap(),
            PointRange::Contiguous { start: 0, count: 2 }
        );
        // A count past the database quantity is an error, not a clamp
        assert_eq!(
            Qualifier::Count16(10).resolve(3),
            Err(ObjectError::InvalidRange)
        );
        assert_eq!(
            Qualifier::Range8 { start: 1, stop: 2 }.resolve(3).unwrap(),
            PointRange::Contiguous { start: 1, count: 2 }
        );
        // Explicit range past the database quantity is an error, not a clamp
        assert_eq!(
            Qualifier::Range8 { start: 1, stop: 3 }.resolve(3),
            Err(ObjectError::InvalidRange)
        );
        assert_eq!(
            Qualifier::Index16(vec![0, 3]).resolve(3),
            Err(ObjectError::IndexOutOfRange)
        );
    }

    #[test]
    fn test_point_range_iteration() {
        let range = PointRange::Contiguous { start: 4, count: 3 };
        assert_eq!(range.point_at(0), Some(4));
        assert_eq!(range.point_at(2), Some(6));
        assert_eq!(range.point_at(3), None);

        let explicit = PointRange::Explicit(vec![9, 1, 5]);
        assert_eq!(explicit.point_at(1), Some(1));
        assert!(explicit.is_explicit());
    }

    #[test]
    fn test_double_bit_from_bits() {
        assert_eq!(DoubleBit::from_bits(0b01), DoubleBit::DeterminedOff);
        assert_eq!(DoubleBit::from_bits(0b10), DoubleBit::DeterminedOn);
        assert_eq!(DoubleBit::from_bits(0b11), DoubleBit::Indeterminate);
    }
}
