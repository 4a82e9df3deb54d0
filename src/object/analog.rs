//! Analog Object Encodings
//!
//! Static and event variations for analog inputs (g30), analog change events
//! (g32) and analog output status (g40). Analog values are held as `f64` in
//! the database; the integer variations saturate on overflow and report the
//! clamp through the over-range flag, so a master always learns that the
//! wire value is not the true value.

use crate::encoding::{self, ResponseWriter};
use crate::object::{Analog, AnalogOutputStatus, Flags};
use crate::time::DnpTimestamp;

/// Analog input static objects
pub const GROUP_ANALOG_INPUT: u8 = 30;
/// Analog input change events
pub const GROUP_ANALOG_EVENT: u8 = 32;
/// Analog output status static objects
pub const GROUP_ANALOG_OUTPUT_STATUS: u8 = 40;

/// Saturate an `f64` into `i32` range, reporting whether it was clamped
fn clamp_i32(value: f64) -> (i32, bool) {
    if value > i32::MAX as f64 {
        (i32::MAX, true)
    } else if value < i32::MIN as f64 {
        (i32::MIN, true)
    } else {
        (value as i32, false)
    }
}

/// Saturate an `f64` into `i16` range, reporting whether it was clamped
fn clamp_i16(value: f64) -> (i16, bool) {
    if value > i16::MAX as f64 {
        (i16::MAX, true)
    } else if value < i16::MIN as f64 {
        (i16::MIN, true)
    } else {
        (value as i16, false)
    }
}

/// Static variations for analog inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogVariation {
    /// v1: 32-bit signed with flags
    I32Flags,
    /// v2: 16-bit signed with flags
    I16Flags,
    /// v3: 32-bit signed, no flags
    I32,
    /// v4: 16-bit signed, no flags
    I16,
    /// v5: single-precision float with flags
    FloatFlags,
}

impl AnalogVariation {
    /// Map a requested variation number; variation 0 resolves to `default`
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(AnalogVariation::I32Flags),
            2 => Some(AnalogVariation::I16Flags),
            3 => Some(AnalogVariation::I32),
            4 => Some(AnalogVariation::I16),
            5 => Some(AnalogVariation::FloatFlags),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            AnalogVariation::I32Flags => 1,
            AnalogVariation::I16Flags => 2,
            AnalogVariation::I32 => 3,
            AnalogVariation::I16 => 4,
            AnalogVariation::FloatFlags => 5,
        }
    }

    /// Encoded size of one point in octets
    pub fn size(&self) -> usize {
        match self {
            AnalogVariation::I32Flags | AnalogVariation::FloatFlags => 5,
            AnalogVariation::I16Flags => 3,
            AnalogVariation::I32 => 4,
            AnalogVariation::I16 => 2,
        }
    }

    /// True when this variation carries a flags octet
    pub fn carries_flags(&self) -> bool {
        !matches!(self, AnalogVariation::I32 | AnalogVariation::I16)
    }

    /// The variation needed to carry this point exactly.
    ///
    /// Non-nominal flags and values that would clamp in the configured
    /// width both force the flag-carrying counterpart, so the over-range
    /// indication is never silently dropped.
    pub fn required_for(&self, point: &Analog) -> Self {
        let clamped = match self {
            AnalogVariation::I32 | AnalogVariation::I32Flags => clamp_i32(point.value).1,
            AnalogVariation::I16 | AnalogVariation::I16Flags => clamp_i16(point.value).1,
            AnalogVariation::FloatFlags => false,
        };
        if self.carries_flags() || (point.flags.is_nominal() && !clamped) {
            *self
        } else {
            match self {
                AnalogVariation::I32 => AnalogVariation::I32Flags,
                AnalogVariation::I16 => AnalogVariation::I16Flags,
                other => *other,
            }
        }
    }

    /// Encode one analog point
    pub fn encode(&self, point: &Analog, writer: &mut ResponseWriter) -> encoding::Result<()> {
        match self {
            AnalogVariation::I32Flags => {
                let (value, clamped) = clamp_i32(point.value);
                writer.write_u8(analog_flags_octet(point.flags, clamped))?;
                writer.write_i32_le(value)
            }
            AnalogVariation::I16Flags => {
                let (value, clamped) = clamp_i16(point.value);
                writer.write_u8(analog_flags_octet(point.flags, clamped))?;
                writer.write_i16_le(value)
            }
            AnalogVariation::I32 => writer.write_i32_le(clamp_i32(point.value).0),
            AnalogVariation::I16 => writer.write_i16_le(clamp_i16(point.value).0),
            AnalogVariation::FloatFlags => {
                writer.write_u8(analog_flags_octet(point.flags, false))?;
                writer.write_f32_le(point.value as f32)
            }
        }
    }
}

/// Static variations for analog output status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogOutVariation {
    /// v1: 32-bit signed with flags
    I32Flags,
    /// v2: 16-bit signed with flags
    I16Flags,
    /// v3: single-precision float with flags
    FloatFlags,
}

impl AnalogOutVariation {
    /// Map a requested variation number; variation 0 resolves to `default`
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(AnalogOutVariation::I32Flags),
            2 => Some(AnalogOutVariation::I16Flags),
            3 => Some(AnalogOutVariation::FloatFlags),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            AnalogOutVariation::I32Flags => 1,
            AnalogOutVariation::I16Flags => 2,
            AnalogOutVariation::FloatFlags => 3,
        }
    }

    /// Encoded size of one point in octets
    pub fn size(&self) -> usize {
        match self {
            AnalogOutVariation::I32Flags | AnalogOutVariation::FloatFlags => 5,
            AnalogOutVariation::I16Flags => 3,
        }
    }

    /// Encode one output status point
    pub fn encode(
        &self,
        point: &AnalogOutputStatus,
        writer: &mut ResponseWriter,
    ) -> encoding::Result<()> {
        match self {
            AnalogOutVariation::I32Flags => {
                let (value, clamped) = clamp_i32(point.value);
                writer.write_u8(analog_flags_octet(point.flags, clamped))?;
                writer.write_i32_le(value)
            }
            AnalogOutVariation::I16Flags => {
                let (value, clamped) = clamp_i16(point.value);
                writer.write_u8(analog_flags_octet(point.flags, clamped))?;
                writer.write_i16_le(value)
            }
            AnalogOutVariation::FloatFlags => {
                writer.write_u8(analog_flags_octet(point.flags, false))?;
                writer.write_f32_le(point.value as f32)
            }
        }
    }
}

/// Event variations for analog change events (g32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogEventVariation {
    /// v1: 32-bit signed with flags
    I32,
    /// v2: 16-bit signed with flags
    I16,
    /// v3: 32-bit signed with flags and absolute time
    I32Time,
    /// v4: 16-bit signed with flags and absolute time
    I16Time,
    /// v5: single-precision float with flags
    Float,
    /// v7: single-precision float with flags and absolute time
    FloatTime,
}

impl AnalogEventVariation {
    /// Map a requested variation number; variation 0 resolves to `default`
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(AnalogEventVariation::I32),
            2 => Some(AnalogEventVariation::I16),
            3 => Some(AnalogEventVariation::I32Time),
            4 => Some(AnalogEventVariation::I16Time),
            5 => Some(AnalogEventVariation::Float),
            7 => Some(AnalogEventVariation::FloatTime),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            AnalogEventVariation::I32 => 1,
            AnalogEventVariation::I16 => 2,
            AnalogEventVariation::I32Time => 3,
            AnalogEventVariation::I16Time => 4,
            AnalogEventVariation::Float => 5,
            AnalogEventVariation::FloatTime => 7,
        }
    }

    /// Encoded size of one event record
    pub fn size(&self) -> usize {
        match self {
            AnalogEventVariation::I32 | AnalogEventVariation::Float => 5,
            AnalogEventVariation::I16 => 3,
            AnalogEventVariation::I32Time | AnalogEventVariation::FloatTime => 11,
            AnalogEventVariation::I16Time => 9,
        }
    }

    /// Encode one analog event record
    pub fn encode(
        &self,
        value: f64,
        flags: Flags,
        timestamp: &DnpTimestamp,
        writer: &mut ResponseWriter,
    ) -> encoding::Result<()> {
        match self {
            AnalogEventVariation::I32 | AnalogEventVariation::I32Time => {
                let (v, clamped) = clamp_i32(value);
                writer.write_u8(analog_flags_octet(flags, clamped))?;
                writer.write_i32_le(v)?;
            }
            AnalogEventVariation::I16 | AnalogEventVariation::I16Time => {
                let (v, clamped) = clamp_i16(value);
                writer.write_u8(analog_flags_octet(flags, clamped))?;
                writer.write_i16_le(v)?;
            }
            AnalogEventVariation::Float | AnalogEventVariation::FloatTime => {
                writer.write_u8(analog_flags_octet(flags, false))?;
                writer.write_f32_le(value as f32)?;
            }
        }
        match self {
            AnalogEventVariation::I32Time
            | AnalogEventVariation::I16Time
            | AnalogEventVariation::FloatTime => writer.append(&timestamp.to_wire_bytes()),
            _ => Ok(()),
        }
    }
}

/// The flags octet of an analog object, with over-range forced when the
/// wire value had to be clamped
fn analog_flags_octet(flags: Flags, clamped: bool) -> u8 {
    if clamped {
        (flags | Flags::OVER_RANGE).bits()
    } else {
        flags.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analog(value: f64, flags: Flags) -> Analog {
        Analog { value, flags }
    }

    #[test]
    fn test_i16_encoding() {
        let mut writer = ResponseWriter::new(8);
        AnalogVariation::I16Flags
            .encode(&analog(-300.0, Flags::ONLINE), &mut writer)
            .unwrap();
        assert_eq!(writer.as_slice(), &[0x01, 0xD4, 0xFE]);
    }

    #[test]
    fn test_float_encoding() {
        let mut writer = ResponseWriter::new(8);
        AnalogVariation::FloatFlags
            .encode(&analog(12.5, Flags::ONLINE), &mut writer)
            .unwrap();
        assert_eq!(writer.as_slice(), &[0x01, 0x00, 0x00, 0x48, 0x41]);
    }

    #[test]
    fn test_clamp_sets_over_range() {
        let mut writer = ResponseWriter::new(8);
        AnalogVariation::I16Flags
            .encode(&analog(70_000.0, Flags::ONLINE), &mut writer)
            .unwrap();
        // 0x21 = online | over-range, value saturated at i16::MAX
        assert_eq!(writer.as_slice(), &[0x21, 0xFF, 0x7F]);
    }

    #[test]
    fn test_bare_variation_promotes_on_clamp() {
        let over = analog(70_000.0, Flags::ONLINE);
        let fits = analog(100.0, Flags::ONLINE);
        assert_eq!(
            AnalogVariation::I16.required_for(&over),
            AnalogVariation::I16Flags
        );
        assert_eq!(AnalogVariation::I16.required_for(&fits), AnalogVariation::I16);
        // 32-bit width holds the same value without promotion
        assert_eq!(AnalogVariation::I32.required_for(&over), AnalogVariation::I32);
    }

    #[test]
    fn test_bare_variation_promotes_on_flags() {
        let suspect = analog(1.0, Flags::ONLINE | Flags::COMM_LOST);
        assert_eq!(
            AnalogVariation::I32.required_for(&suspect),
            AnalogVariation::I32Flags
        );
    }

    #[test]
    fn test_event_record_with_time() {
        let mut writer = ResponseWriter::new(16);
        let ts = DnpTimestamp::from_millis(1000);
        AnalogEventVariation::I16Time
            .encode(42.0, Flags::ONLINE, &ts, &mut writer)
            .unwrap();
        assert_eq!(
            writer.as_slice(),
            &[0x01, 0x2A, 0x00, 0xE8, 0x03, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(writer.len(), AnalogEventVariation::I16Time.size());
    }
}
