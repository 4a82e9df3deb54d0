//! Binary Object Encodings
//!
//! Static and event variations for the single-bit and double-bit object
//! groups: binary inputs (g1) and their change events (g2), double-bit
//! inputs (g3) and their change events (g4), and binary output status (g10).
//!
//! Single-bit points pack 8 to an octet in the packed variation and carry
//! state in bit 7 of the flags octet otherwise; double-bit points pack 4 to
//! an octet with state in bits 6-7.

use crate::encoding::{self, ResponseWriter};
use crate::object::{DoubleBit, Flags};
use crate::time::DnpTimestamp;

/// Binary input static objects
pub const GROUP_BINARY_INPUT: u8 = 1;
/// Binary input change events
pub const GROUP_BINARY_EVENT: u8 = 2;
/// Double-bit input static objects
pub const GROUP_DOUBLE_BIT_INPUT: u8 = 3;
/// Double-bit input change events
pub const GROUP_DOUBLE_BIT_EVENT: u8 = 4;
/// Binary output status static objects
pub const GROUP_BINARY_OUTPUT_STATUS: u8 = 10;

/// Merge quality flags and single-bit state into one wire octet
pub fn flags_octet(value: bool, flags: Flags) -> u8 {
    let quality = flags.bits() & Flags::BINARY_MASK;
    if value {
        quality | 0x80
    } else {
        quality
    }
}

/// Merge quality flags and double-bit state into one wire octet
pub fn double_bit_octet(value: DoubleBit, flags: Flags) -> u8 {
    (flags.bits() & Flags::DOUBLE_BIT_MASK) | ((value as u8) << 6)
}

/// Static variations for binary inputs and binary output status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryVariation {
    /// v1: packed bits, 8 points per octet, state only
    Packed,
    /// v2: one octet per point, quality flags with state in bit 7
    WithFlags,
}

impl BinaryVariation {
    /// Map a requested variation number; `None` for a variation this group
    /// does not have. Variation 0 resolves to `default`.
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(BinaryVariation::Packed),
            2 => Some(BinaryVariation::WithFlags),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            BinaryVariation::Packed => 1,
            BinaryVariation::WithFlags => 2,
        }
    }

    /// The variation needed to carry this point exactly
    pub fn required_for(&self, flags: Flags) -> Self {
        if flags.is_nominal() {
            *self
        } else {
            BinaryVariation::WithFlags
        }
    }
}

/// Static variations for double-bit inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleBitVariation {
    /// v1: packed pairs, 4 points per octet, state only
    Packed,
    /// v2: one octet per point, quality flags with state in bits 6-7
    WithFlags,
}

impl DoubleBitVariation {
    /// Map a requested variation number; variation 0 resolves to `default`
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(DoubleBitVariation::Packed),
            2 => Some(DoubleBitVariation::WithFlags),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            DoubleBitVariation::Packed => 1,
            DoubleBitVariation::WithFlags => 2,
        }
    }

    /// The variation needed to carry this point exactly
    pub fn required_for(&self, flags: Flags) -> Self {
        if flags.is_nominal() {
            *self
        } else {
            DoubleBitVariation::WithFlags
        }
    }
}

/// Event variations shared by the single-bit (g2) and double-bit (g4)
/// change-event groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryEventVariation {
    /// v1: flags octet only
    NoTime,
    /// v2: flags octet plus 48-bit absolute time
    AbsoluteTime,
    /// v3: flags octet plus 16-bit time relative to a CTO
    RelativeTime,
}

impl BinaryEventVariation {
    /// Map a requested variation number; variation 0 resolves to `default`
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(BinaryEventVariation::NoTime),
            2 => Some(BinaryEventVariation::AbsoluteTime),
            3 => Some(BinaryEventVariation::RelativeTime),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            BinaryEventVariation::NoTime => 1,
            BinaryEventVariation::AbsoluteTime => 2,
            BinaryEventVariation::RelativeTime => 3,
        }
    }

    /// Encoded size of one event record, excluding any CTO object
    pub fn size(&self) -> usize {
        match self {
            BinaryEventVariation::NoTime => 1,
            BinaryEventVariation::AbsoluteTime => 7,
            BinaryEventVariation::RelativeTime => 3,
        }
    }

    /// True when records of this variation must follow a CTO object
    pub fn needs_cto(&self) -> bool {
        *self == BinaryEventVariation::RelativeTime
    }

    /// Encode one single-bit event record
    pub fn encode(
        &self,
        state_octet: u8,
        timestamp: &DnpTimestamp,
        cto: Option<&DnpTimestamp>,
        writer: &mut ResponseWriter,
    ) -> encoding::Result<()> {
        writer.write_u8(state_octet)?;
        match self {
            BinaryEventVariation::NoTime => Ok(()),
            BinaryEventVariation::AbsoluteTime => writer.append(&timestamp.to_wire_bytes()),
            BinaryEventVariation::RelativeTime => {
                // The merge engine guarantees the delta fits 16 bits
                let delta = match cto {
                    Some(reference) => timestamp.sub(reference).millis() as u16,
                    None => 0,
                };
                writer.write_u16_le(delta)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_octet_state_bit() {
        assert_eq!(flags_octet(false, Flags::ONLINE), 0x01);
        assert_eq!(flags_octet(true, Flags::ONLINE), 0x81);
        assert_eq!(flags_octet(true, Flags::ONLINE | Flags::CHATTER_FILTER), 0xA1);
    }

    #[test]
    fn test_double_bit_octet_state_bits() {
        assert_eq!(double_bit_octet(DoubleBit::DeterminedOff, Flags::ONLINE), 0x41);
        assert_eq!(double_bit_octet(DoubleBit::DeterminedOn, Flags::ONLINE), 0x81);
        assert_eq!(
            double_bit_octet(DoubleBit::Indeterminate, Flags::ONLINE | Flags::COMM_LOST),
            0xC5
        );
    }

    #[test]
    fn test_variation_promotion() {
        let nominal = Flags::ONLINE;
        let restart = Flags::ONLINE | Flags::RESTART;
        assert_eq!(
            BinaryVariation::Packed.required_for(nominal),
            BinaryVariation::Packed
        );
        assert_eq!(
            BinaryVariation::Packed.required_for(restart),
            BinaryVariation::WithFlags
        );
        // A flags variation never demotes
        assert_eq!(
            BinaryVariation::WithFlags.required_for(nominal),
            BinaryVariation::WithFlags
        );
    }

    #[test]
    fn test_unknown_variation_rejected() {
        assert_eq!(BinaryVariation::from_request(3, BinaryVariation::Packed), None);
        assert_eq!(
            BinaryEventVariation::from_request(4, BinaryEventVariation::NoTime),
            None
        );
    }

    #[test]
    fn test_event_record_sizes() {
        assert_eq!(BinaryEventVariation::NoTime.size(), 1);
        assert_eq!(BinaryEventVariation::AbsoluteTime.size(), 7);
        assert_eq!(BinaryEventVariation::RelativeTime.size(), 3);
    }

    #[test]
    fn test_event_encode_absolute_time() {
        let mut writer = ResponseWriter::new(16);
        let ts = DnpTimestamp::from_millis(0x0102_0304_0506);
        BinaryEventVariation::AbsoluteTime
            .encode(0x81, &ts, None, &mut writer)
            .unwrap();
        assert_eq!(
            writer.as_slice(),
            &[0x81, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_event_encode_relative_time() {
        let mut writer = ResponseWriter::new(16);
        let cto = DnpTimestamp::from_millis(100_000);
        let ts = cto.add_millis(1500);
        BinaryEventVariation::RelativeTime
            .encode(0x01, &ts, Some(&cto), &mut writer)
            .unwrap();
        assert_eq!(writer.as_slice(), &[0x01, 0xDC, 0x05]);
    }
}
