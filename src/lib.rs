#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod app;
pub mod control;
pub mod encoding;
pub mod event;
pub mod object;
pub mod time;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use app::{AppControl, FunctionCode, Iin, OutstationConfig};
pub use control::{AnalogCommand, CommandStatus, ControlCode, ControlRelayOutputBlock};
pub use encoding::{EncodingError, Reader, ResponseWriter};
pub use event::{EventBufferConfig, OverflowPolicy};
pub use object::{Binary, ClassMask, DoubleBit, Flags, ObjectHeader, Qualifier};
pub use time::{CalendarTime, DnpTimestamp};

#[cfg(feature = "std")]
pub use app::Outstation;
#[cfg(feature = "std")]
pub use object::database::{Database, DatabaseConfig};

#[cfg(feature = "std")]
extern crate std;

#[cfg(not(feature = "std"))]
extern crate alloc;

/// Largest reassembled application-layer fragment this stack produces
pub const DNP3_MAX_FRAGMENT: usize = 2048;
/// Smallest fragment size every conformant master must accept
pub const DNP3_MIN_FRAGMENT: usize = 249;

#[cfg(test)]
mod tests {
    use crate::object::{ClassMask, Flags};
    use crate::time::DnpTimestamp;
    use crate::{CommandStatus, ControlCode, EncodingError, FunctionCode};

    #[cfg(not(feature = "std"))]
    use alloc::format;

    #[test]
    fn test_no_std_types() {
        // Core types work in both std and no-std environments
        let flags = Flags::ONLINE;
        assert!(flags.is_nominal());

        let mask = ClassMask::CLASS_2;
        assert_eq!(mask.bits(), 0b010);

        let code = ControlCode::LATCH_ON;
        assert_eq!(code.op_type(), 0x03);

        assert_eq!(FunctionCode::try_from(1), Ok(FunctionCode::Read));
        assert_eq!(CommandStatus::from(2), CommandStatus::NoSelect);
    }

    #[test]
    fn test_encoding_error() {
        let err = EncodingError::BufferOverflow;
        // In no-std, we can still format errors
        let _ = format!("{}", err);
    }

    #[test]
    fn test_timestamp_display() {
        let ts = DnpTimestamp::from_millis(0);
        assert_eq!(format!("{}", ts), "1970-01-01 00:00:00.000");
    }
}
