//! Point Provider Contract and Reference Database
//!
//! The outstation core never stores measurements itself. It reads current
//! values, polls for changes and delegates control operations through the
//! per-type provider traits defined here. A provider addresses points by
//! opaque index: `read` returning `None` means the index names a disabled or
//! nonexistent point, and the core assumes nothing about storage beyond that
//! lookup being cheap and non-blocking.
//!
//! The [`Database`] at the bottom of this module is the in-memory reference
//! implementation used by the test suite and by embedding programs that have
//! no external historian. It follows the shape of a typical field-device
//! point table: a fixed quantity per type decided at startup, updates that
//! mark a point dirty for the next event scan, and per-point event class and
//! variation settings.

#[cfg(feature = "std")]
use std::fmt;

use crate::control::{CommandStatus, ControlRelayOutputBlock};
use crate::object::{
    Analog, AnalogOutputStatus, Binary, BinaryOutputStatus, ClassMask, Counter, DoubleBit,
    DoubleBitBinary, Flags,
};

/// Provider of binary input points (g1/g2)
pub trait BinaryProvider {
    /// Number of points, contiguous indexes `0..quantity`
    fn quantity(&self) -> u16;
    /// Current value and flags; `None` for a disabled point
    fn read(&self, index: u16) -> Option<Binary>;
    /// Consume and return a pending change, if the point moved since the
    /// last poll
    fn changed(&mut self, index: u16) -> Option<Binary>;
    /// Event class membership of the point
    fn event_class(&self, index: u16) -> ClassMask;
    /// Re-assign the event class; `false` if the point does not exist
    fn assign_class(&mut self, index: u16, mask: ClassMask) -> bool;
    /// Per-point default event variation, when the provider configures one
    fn event_variation(&self, _index: u16) -> Option<u8> {
        None
    }
}

/// Provider of double-bit input points (g3/g4)
pub trait DoubleBitProvider {
    fn quantity(&self) -> u16;
    fn read(&self, index: u16) -> Option<DoubleBitBinary>;
    fn changed(&mut self, index: u16) -> Option<DoubleBitBinary>;
    fn event_class(&self, index: u16) -> ClassMask;
    fn assign_class(&mut self, index: u16, mask: ClassMask) -> bool;
    fn event_variation(&self, _index: u16) -> Option<u8> {
        None
    }
}

/// Provider of counter points (g20/g22)
pub trait CounterProvider {
    fn quantity(&self) -> u16;
    fn read(&self, index: u16) -> Option<Counter>;
    fn changed(&mut self, index: u16) -> Option<Counter>;
    fn event_class(&self, index: u16) -> ClassMask;
    fn assign_class(&mut self, index: u16, mask: ClassMask) -> bool;
    fn event_variation(&self, _index: u16) -> Option<u8> {
        None
    }
}

/// Provider of analog input points (g30/g32)
pub trait AnalogProvider {
    fn quantity(&self) -> u16;
    fn read(&self, index: u16) -> Option<Analog>;
    fn changed(&mut self, index: u16) -> Option<Analog>;
    fn event_class(&self, index: u16) -> ClassMask;
    fn assign_class(&mut self, index: u16, mask: ClassMask) -> bool;
    fn event_variation(&self, _index: u16) -> Option<u8> {
        None
    }
}

/// Provider of binary output points: g10 status plus the g12 control hooks.
///
/// The select/operate discipline itself (arming, deadlines, parameter
/// matching) lives in the core; the provider only vets and executes. Status
/// codes are passed through to the master verbatim.
pub trait BinaryOutputProvider {
    fn quantity(&self) -> u16;
    /// Current output status; `None` for a disabled point
    fn read(&self, index: u16) -> Option<BinaryOutputStatus>;
    /// Vet a control for later execution
    fn select(&mut self, index: u16, control: &ControlRelayOutputBlock) -> CommandStatus;
    /// Execute a control
    fn operate(&mut self, index: u16, control: &ControlRelayOutputBlock) -> CommandStatus;
    /// A previously vetted control will not be executed
    fn cancel_select(&mut self, _index: u16) {}
}

/// Provider of analog output points: g40 status plus the g41 control hooks
pub trait AnalogOutputProvider {
    fn quantity(&self) -> u16;
    fn read(&self, index: u16) -> Option<AnalogOutputStatus>;
    fn select(&mut self, index: u16, value: f64) -> CommandStatus;
    fn operate(&mut self, index: u16, value: f64) -> CommandStatus;
    fn cancel_select(&mut self, _index: u16) {}
}

/// The full provider surface the outstation session consumes
pub trait PointProvider:
    BinaryProvider
    + DoubleBitProvider
    + CounterProvider
    + AnalogProvider
    + BinaryOutputProvider
    + AnalogOutputProvider
{
}

impl<T> PointProvider for T where
    T: BinaryProvider
        + DoubleBitProvider
        + CounterProvider
        + AnalogProvider
        + BinaryOutputProvider
        + AnalogOutputProvider
{
}

/// One stored point of the reference database
#[cfg(feature = "std")]
#[derive(Debug, Clone)]
struct StoredPoint<T> {
    current: T,
    class: ClassMask,
    event_variation: Option<u8>,
    enabled: bool,
    dirty: bool,
}

#[cfg(feature = "std")]
impl<T: Copy + PartialEq> StoredPoint<T> {
    fn new(initial: T, class: ClassMask) -> Self {
        Self {
            current: initial,
            class,
            event_variation: None,
            enabled: true,
            dirty: false,
        }
    }

    fn read(&self) -> Option<T> {
        self.enabled.then_some(self.current)
    }

    fn update(&mut self, value: T) {
        if value != self.current {
            self.current = value;
            self.dirty = true;
        }
    }

    fn take_changed(&mut self) -> Option<T> {
        if self.enabled && self.dirty {
            self.dirty = false;
            Some(self.current)
        } else {
            None
        }
    }
}

/// Point quantities and default event classes for a [`Database`]
#[cfg(feature = "std")]
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DatabaseConfig {
    pub binaries: u16,
    pub double_bits: u16,
    pub counters: u16,
    pub analogs: u16,
    pub binary_outputs: u16,
    pub analog_outputs: u16,
    /// Event class given to every input point at startup
    pub default_class: ClassMask,
}

/// In-memory reference implementation of the provider traits.
///
/// Updates compare against the stored value and mark the point dirty on
/// change; the channel's periodic event scan drains dirty points through
/// `changed`. Output writes (from executed controls) update the matching
/// status point the same way.
#[cfg(feature = "std")]
pub struct Database {
    binaries: Vec<StoredPoint<Binary>>,
    double_bits: Vec<StoredPoint<DoubleBitBinary>>,
    counters: Vec<StoredPoint<Counter>>,
    analogs: Vec<StoredPoint<Analog>>,
    binary_outputs: Vec<StoredPoint<BinaryOutputStatus>>,
    analog_outputs: Vec<StoredPoint<AnalogOutputStatus>>,
}

#[cfg(feature = "std")]
impl Database {
    /// Create a database with every point at its restart value
    pub fn new(config: DatabaseConfig) -> Self {
        let class = config.default_class;
        Self {
            binaries: (0..config.binaries)
                .map(|_| {
                    StoredPoint::new(
                        Binary {
                            value: false,
                            flags: Flags::RESTART,
                        },
                        class,
                    )
                })
                .collect(),
            double_bits: (0..config.double_bits)
                .map(|_| {
                    StoredPoint::new(
                        DoubleBitBinary {
                            value: DoubleBit::Indeterminate,
                            flags: Flags::RESTART,
                        },
                        class,
                    )
                })
                .collect(),
            counters: (0..config.counters)
                .map(|_| {
                    StoredPoint::new(
                        Counter {
                            value: 0,
                            flags: Flags::RESTART,
                        },
                        class,
                    )
                })
                .collect(),
            analogs: (0..config.analogs)
                .map(|_| {
                    StoredPoint::new(
                        Analog {
                            value: 0.0,
                            flags: Flags::RESTART,
                        },
                        class,
                    )
                })
                .collect(),
            binary_outputs: (0..config.binary_outputs)
                .map(|_| {
                    StoredPoint::new(
                        BinaryOutputStatus {
                            value: false,
                            flags: Flags::RESTART,
                        },
                        ClassMask::empty(),
                    )
                })
                .collect(),
            analog_outputs: (0..config.analog_outputs)
                .map(|_| {
                    StoredPoint::new(
                        AnalogOutputStatus {
                            value: 0.0,
                            flags: Flags::RESTART,
                        },
                        ClassMask::empty(),
                    )
                })
                .collect(),
        }
    }

    /// Update a binary input from the field
    pub fn update_binary(&mut self, index: u16, value: bool, flags: Flags) {
        if let Some(p) = self.binaries.get_mut(index as usize) {
            p.update(Binary { value, flags });
        }
    }

    /// Update a double-bit input from the field
    pub fn update_double_bit(&mut self, index: u16, value: DoubleBit, flags: Flags) {
        if let Some(p) = self.double_bits.get_mut(index as usize) {
            p.update(DoubleBitBinary { value, flags });
        }
    }

    /// Update a counter from the field
    pub fn update_counter(&mut self, index: u16, value: u32, flags: Flags) {
        if let Some(p) = self.counters.get_mut(index as usize) {
            p.update(Counter { value, flags });
        }
    }

    /// Update an analog input from the field
    pub fn update_analog(&mut self, index: u16, value: f64, flags: Flags) {
        if let Some(p) = self.analogs.get_mut(index as usize) {
            p.update(Analog { value, flags });
        }
    }

    /// Enable or disable a binary input point
    pub fn set_binary_enabled(&mut self, index: u16, enabled: bool) {
        if let Some(p) = self.binaries.get_mut(index as usize) {
            p.enabled = enabled;
        }
    }

    /// Enable or disable an analog input point
    pub fn set_analog_enabled(&mut self, index: u16, enabled: bool) {
        if let Some(p) = self.analogs.get_mut(index as usize) {
            p.enabled = enabled;
        }
    }

    /// Configure a per-point default event variation for a binary input
    pub fn set_binary_event_variation(&mut self, index: u16, variation: u8) {
        if let Some(p) = self.binaries.get_mut(index as usize) {
            p.event_variation = Some(variation);
        }
    }
}

#[cfg(feature = "std")]
impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("binaries", &self.binaries.len())
            .field("double_bits", &self.double_bits.len())
            .field("counters", &self.counters.len())
            .field("analogs", &self.analogs.len())
            .field("binary_outputs", &self.binary_outputs.len())
            .field("analog_outputs", &self.analog_outputs.len())
            .finish()
    }
}

#[cfg(feature = "std")]
macro_rules! impl_input_provider {
    ($trait_name:ident, $field:ident, $point:ty) => {
        impl $trait_name for Database {
            fn quantity(&self) -> u16 {
                self.$field.len() as u16
            }

            fn read(&self, index: u16) -> Option<$point> {
                self.$field.get(index as usize).and_then(StoredPoint::read)
            }

            fn changed(&mut self, index: u16) -> Option<$point> {
                self.$field
                    .get_mut(index as usize)
                    .and_then(StoredPoint::take_changed)
            }

            fn event_class(&self, index: u16) -> ClassMask {
                self.$field
                    .get(index as usize)
                    .map(|p| p.class)
                    .unwrap_or_default()
            }

            fn assign_class(&mut self, index: u16, mask: ClassMask) -> bool {
                match self.$field.get_mut(index as usize) {
                    Some(p) => {
                        p.class = mask;
                        true
                    }
                    None => false,
                }
            }

            fn event_variation(&self, index: u16) -> Option<u8> {
                self.$field.get(index as usize).and_then(|p| p.event_variation)
            }
        }
    };
}

#[cfg(feature = "std")]
impl_input_provider!(BinaryProvider, binaries, Binary);
#[cfg(feature = "std")]
impl_input_provider!(DoubleBitProvider, double_bits, DoubleBitBinary);
#[cfg(feature = "std")]
impl_input_provider!(CounterProvider, counters, Counter);
#[cfg(feature = "std")]
impl_input_provider!(AnalogProvider, analogs, Analog);

#[cfg(feature = "std")]
impl BinaryOutputProvider for Database {
    fn quantity(&self) -> u16 {
        self.binary_outputs.len() as u16
    }

    fn read(&self, index: u16) -> Option<BinaryOutputStatus> {
        self.binary_outputs
            .get(index as usize)
            .and_then(StoredPoint::read)
    }

    fn select(&mut self, index: u16, control: &ControlRelayOutputBlock) -> CommandStatus {
        match self.binary_outputs.get(index as usize) {
            Some(p) if p.enabled => {
                if control.code.is_supported() {
                    CommandStatus::Success
                } else {
                    CommandStatus::NotSupported
                }
            }
            _ => CommandStatus::NotSupported,
        }
    }

    fn operate(&mut self, index: u16, control: &ControlRelayOutputBlock) -> CommandStatus {
        let Some(p) = self.binary_outputs.get_mut(index as usize) else {
            return CommandStatus::NotSupported;
        };
        if !p.enabled {
            return CommandStatus::NotSupported;
        }
        match control.code.latched_state() {
            Some(state) => {
                p.update(BinaryOutputStatus {
                    value: state,
                    flags: Flags::ONLINE,
                });
                CommandStatus::Success
            }
            None => CommandStatus::NotSupported,
        }
    }
}

#[cfg(feature = "std")]
impl AnalogOutputProvider for Database {
    fn quantity(&self) -> u16 {
        self.analog_outputs.len() as u16
    }

    fn read(&self, index: u16) -> Option<AnalogOutputStatus> {
        self.analog_outputs
            .get(index as usize)
            .and_then(StoredPoint::read)
    }

    fn select(&mut self, index: u16, _value: f64) -> CommandStatus {
        match self.analog_outputs.get(index as usize) {
            Some(p) if p.enabled => CommandStatus::Success,
            _ => CommandStatus::NotSupported,
        }
    }

    fn operate(&mut self, index: u16, value: f64) -> CommandStatus {
        let Some(p) = self.analog_outputs.get_mut(index as usize) else {
            return CommandStatus::NotSupported;
        };
        if !p.enabled {
            return CommandStatus::NotSupported;
        }
        p.update(AnalogOutputStatus {
            value,
            flags: Flags::ONLINE,
        });
        CommandStatus::Success
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::control::ControlCode;

    fn database() -> Database {
        Database::new(DatabaseConfig {
            binaries: 4,
            double_bits: 2,
            counters: 2,
            analogs: 3,
            binary_outputs: 2,
            analog_outputs: 2,
            default_class: ClassMask::CLASS_1,
        })
    }

    #[test]
    fn test_restart_values() {
        let db = database();
        let point = BinaryProvider::read(&db, 0).unwrap();
        assert!(!point.value);
        assert_eq!(point.flags, Flags::RESTART);
        assert_eq!(BinaryProvider::quantity(&db), 4);
    }

    #[test]
    fn test_change_detection() {
        let mut db = database();

        // No change yet
        assert!(BinaryProvider::changed(&mut db, 0).is_none());

        db.update_binary(0, true, Flags::ONLINE);
        let change = BinaryProvider::changed(&mut db, 0).unwrap();
        assert!(change.value);

        // Drained by the first poll
        assert!(BinaryProvider::changed(&mut db, 0).is_none());

        // Writing the same value again is not a change
        db.update_binary(0, true, Flags::ONLINE);
        assert!(BinaryProvider::changed(&mut db, 0).is_none());
    }

    #[test]
    fn test_disabled_point_reads_none() {
        let mut db = database();
        db.set_binary_enabled(1, false);
        assert!(BinaryProvider::read(&db, 1).is_none());
        assert!(BinaryProvider::read(&db, 0).is_some());

        db.update_binary(1, true, Flags::ONLINE);
        assert!(BinaryProvider::changed(&mut db, 1).is_none());
    }

    #[test]
    fn test_class_assignment() {
        let mut db = database();
        assert_eq!(BinaryProvider::event_class(&db, 2), ClassMask::CLASS_1);
        assert!(BinaryProvider::assign_class(&mut db, 2, ClassMask::CLASS_3));
        assert_eq!(BinaryProvider::event_class(&db, 2), ClassMask::CLASS_3);
        // Out of range
        assert!(!BinaryProvider::assign_class(&mut db, 99, ClassMask::CLASS_1));
    }

    #[test]
    fn test_operate_updates_status() {
        let mut db = database();
        let control = ControlRelayOutputBlock::new(ControlCode::LATCH_ON, 1, 0, 0);
        assert_eq!(
            BinaryOutputProvider::select(&mut db, 0, &control),
            CommandStatus::Success
        );
        assert_eq!(
            BinaryOutputProvider::operate(&mut db, 0, &control),
            CommandStatus::Success
        );
        let status = BinaryOutputProvider::read(&db, 0).unwrap();
        assert!(status.value);

        // Point beyond the quantity
        assert_eq!(
            BinaryOutputProvider::operate(&mut db, 9, &control),
            CommandStatus::NotSupported
        );
    }

    #[test]
    fn test_analog_operate_round_trip() {
        let mut db = database();
        assert_eq!(
            AnalogOutputProvider::operate(&mut db, 1, 42.5),
            CommandStatus::Success
        );
        let status = AnalogOutputProvider::read(&db, 1).unwrap();
        assert_eq!(status.value, 42.5);
    }

    #[test]
    fn test_per_point_event_variation() {
        let mut db = database();
        assert_eq!(BinaryProvider::event_variation(&db, 0), None);
        db.set_binary_event_variation(0, 1);
        assert_eq!(BinaryProvider::event_variation(&db, 0), Some(1));
    }
}
