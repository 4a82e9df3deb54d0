//! Counter Object Encodings
//!
//! Static and event variations for counters (g20) and counter change events
//! (g22). The 16-bit variations saturate values above 65535; accumulators
//! that can exceed that range should be served with a 32-bit default.

use crate::encoding::{self, ResponseWriter};
use crate::object::{Counter, Flags};
use crate::time::DnpTimestamp;

/// Counter static objects
pub const GROUP_COUNTER: u8 = 20;
/// Counter change events
pub const GROUP_COUNTER_EVENT: u8 = 22;

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

/// Static variations for counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterVariation {
    /// v1: 32-bit with flags
    Bits32Flags,
    /// v2: 16-bit with flags
    Bits16Flags,
    /// v5: 32-bit, no flags
    Bits32,
    /// v6: 16-bit, no flags
    Bits16,
}

impl CounterVariation {
    /// Map a requested variation number; variation 0 resolves to `default`
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(CounterVariation::Bits32Flags),
            2 => Some(CounterVariation::Bits16Flags),
            5 => Some(CounterVariation::Bits32),
            6 => Some(CounterVariation::Bits16),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            CounterVariation::Bits32Flags => 1,
            CounterVariation::Bits16Flags => 2,
            CounterVariation::Bits32 => 5,
            CounterVariation::Bits16 => 6,
        }
    }

    /// Encoded size of one point in octets
    pub fn size(&self) -> usize {
        match self {
            CounterVariation::Bits32Flags => 5,
            CounterVariation::Bits16Flags => 3,
            CounterVariation::Bits32 => 4,
            CounterVariation::Bits16 => 2,
        }
    }

    /// True when this variation carries a flags octet
    pub fn carries_flags(&self) -> bool {
        matches!(
            self,
            CounterVariation::Bits32Flags | CounterVariation::Bits16Flags
        )
    }

    /// The variation needed to carry this point exactly
    pub fn required_for(&self, point: &Counter) -> Self {
        if self.carries_flags() || point.flags.is_nominal() {
            *self
        } else {
            match self {
                CounterVariation::Bits32 => CounterVariation::Bits32Flags,
                CounterVariation::Bits16 => CounterVariation::Bits16Flags,
                other => *other,
            }
        }
    }

    /// Encode one counter point
    pub fn encode(&self, point: &Counter, writer: &mut ResponseWriter) -> encoding::Result<()> {
        match self {
            CounterVariation::Bits32Flags => {
                writer.write_u8(point.flags.bits())?;
                writer.write_u32_le(point.value)
            }
            CounterVariation::Bits16Flags => {
                writer.write_u8(point.flags.bits())?;
                writer.write_u16_le(clamp_u16(point.value))
            }
            CounterVariation::Bits32 => writer.write_u32_le(point.value),
            CounterVariation::Bits16 => writer.write_u16_le(clamp_u16(point.value)),
        }
    }
}

/// Event variations for counter change events (g22)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEventVariation {
    /// v1: 32-bit with flags
    Bits32,
    /// v2: 16-bit with flags
    Bits16,
    /// v5: 32-bit with flags and absolute time
    Bits32Time,
    /// v6: 16-bit with flags and absolute time
    Bits16Time,
}

impl CounterEventVariation {
    /// Map a requested variation number; variation 0 resolves to `default`
    pub fn from_request(variation: u8, default: Self) -> Option<Self> {
        match variation {
            0 => Some(default),
            1 => Some(CounterEventVariation::Bits32),
            2 => Some(CounterEventVariation::Bits16),
            5 => Some(CounterEventVariation::Bits32Time),
            6 => Some(CounterEventVariation::Bits16Time),
            _ => None,
        }
    }

    /// The variation number written to the object header
    pub fn wire_variation(&self) -> u8 {
        match self {
            CounterEventVariation::Bits32 => 1,
            CounterEventVariation::Bits16 => 2,
            CounterEventVariation::Bits32Time => 5,
            CounterEventVariation::Bits16Time => 6,
        }
    }

    /// Encoded size of one event record
    pub fn size(&self) -> usize {
        match self {
            CounterEventVariation::Bits32 => 5,
            CounterEventVariation::Bits16 => 3,
            CounterEventVariation::Bits32Time => 11,
            CounterEventVariation::Bits16Time => 9,
        }
    }

    /// Encode one counter event record
    pub fn encode(
        &self,
        value: u32,
        flags: Flags,
        timestamp: &DnpTimestamp,
        writer: &mut ResponseWriter,
    ) -> encoding::Result<()> {
        writer.write_u8(flags.bits())?;
        match self {
            CounterEventVariation::Bits32 | CounterEventVariation::Bits32Time => {
                writer.write_u32_le(value)?;
            }
            CounterEventVariation::Bits16 | CounterEventVariation::Bits16Time => {
                writer.write_u16_le(clamp_u16(value))?;
            }
        }
        match self {
            CounterEventVariation::Bits32Time | CounterEventVariation::Bits16Time => {
                writer.append(&timestamp.to_wire_bytes())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_encodings() {
        let point = Counter {
            value: 0x0001_E240, // 123456
            flags: Flags::ONLINE,
        };

        let mut writer = ResponseWriter::new(8);
        CounterVariation::Bits32Flags.encode(&point, &mut writer).unwrap();
        assert_eq!(writer.as_slice(), &[0x01, 0x40, 0xE2, 0x01, 0x00]);

        let mut writer = ResponseWriter::new(8);
        CounterVariation::Bits16Flags.encode(&point, &mut writer).unwrap();
        // Saturated at 65535
        assert_eq!(writer.as_slice(), &[0x01, 0xFF, 0xFF]);

        let mut writer = ResponseWriter::new(8);
        CounterVariation::Bits32.encode(&point, &mut writer).unwrap();
        assert_eq!(writer.as_slice(), &[0x40, 0xE2, 0x01, 0x00]);
    }

    #[test]
    fn test_bare_variation_promotes_on_flags() {
        let point = Counter {
            value: 1,
            flags: Flags::ONLINE | Flags::ROLLOVER,
        };
        assert_eq!(
            CounterVariation::Bits32.required_for(&point),
            CounterVariation::Bits32Flags
        );
        assert_eq!(
            CounterVariation::Bits32Flags.required_for(&point),
            CounterVariation::Bits32Flags
        );
    }

    #[test]
    fn test_event_record_with_time() {
        let mut writer = ResponseWriter::new(16);
        let ts = DnpTimestamp::from_millis(2);
        CounterEventVariation::Bits16Time
            .encode(7, Flags::ONLINE, &ts, &mut writer)
            .unwrap();
        assert_eq!(
            writer.as_slice(),
            &[0x01, 0x07, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
