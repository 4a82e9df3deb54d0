//! Control Command State Machine
//!
//! This module implements the select-before-operate discipline DNP3 requires
//! for output points. A control is first *selected* (vetted and armed with a
//! deadline), then *operated* with byte-identical parameters before the
//! deadline passes. Anything else (operating an unarmed point, operating
//! after expiry, operating with different parameters) is rejected with a
//! status code that tells the master exactly which rule it broke.
//!
//! # Overview
//!
//! - [`ControlRelayOutputBlock`] (g12v1): the binary control payload
//! - Pattern controls (g12v2 block + g12v3 mask): one shared payload applied
//!   to a bitmask-selected subset of a point range
//! - [`AnalogCommand`] (g41v1-v4): analog output payloads in the four wire
//!   widths
//! - [`ControlState`]: the per-channel table of armed selects with their
//!   deadlines
//!
//! States per point: `Unarmed -> Armed(deadline) -> {Operated | Expired |
//! Cancelled | Superseded}`. `Operated`, `Expired` and `Cancelled` all leave
//! the point `Unarmed` for future requests; controls are never queued.
//!
//! Deadlines are checked against a caller-supplied monotonic millisecond
//! tick, never against the synchronized wall clock, so a time-sync write
//! from the master cannot stretch or shrink an arm window.

#[cfg(feature = "std")]
use std::collections::HashMap;

#[cfg(not(feature = "std"))]
use alloc::{collections::BTreeMap as HashMap, vec::Vec};

use log::{debug, warn};

use crate::encoding::{self, Reader, ResponseWriter};
use crate::object::database::{AnalogOutputProvider, BinaryOutputProvider};

/// Binary output controls (CROB and pattern)
pub const GROUP_BINARY_OUTPUT_COMMAND: u8 = 12;
/// Analog output controls
pub const GROUP_ANALOG_OUTPUT_COMMAND: u8 = 41;

/// Command status codes echoed to the master.
///
/// Except for the few values the state machine itself produces
/// (`Timeout`, `NoSelect`, `FormatError`, `TooManyOps`), these are opaque
/// pass-through values from the point provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    Success = 0,
    /// Operate arrived after the select deadline
    Timeout = 1,
    /// Operate without a matching armed select
    NoSelect = 2,
    /// Request malformed (count, qualifier or mask shape)
    FormatError = 3,
    NotSupported = 4,
    AlreadyActive = 5,
    HardwareError = 6,
    /// Point is under local control
    Local = 7,
    /// Too many controls in one request
    TooManyOps = 8,
    NotAuthorized = 9,
    /// Point number beyond the output quantity
    OutOfRange = 12,
    /// Catch-all for status octets outside the defined set
    Undefined = 127,
}

impl From<u8> for CommandStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => CommandStatus::Success,
            1 => CommandStatus::Timeout,
            2 => CommandStatus::NoSelect,
            3 => CommandStatus::FormatError,
            4 => CommandStatus::NotSupported,
            5 => CommandStatus::AlreadyActive,
            6 => CommandStatus::HardwareError,
            7 => CommandStatus::Local,
            8 => CommandStatus::TooManyOps,
            9 => CommandStatus::NotAuthorized,
            12 => CommandStatus::OutOfRange,
            _ => CommandStatus::Undefined,
        }
    }
}

/// CROB control-code octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlCode(pub u8);

impl ControlCode {
    pub const NUL: ControlCode = ControlCode(0x00);
    pub const PULSE_ON: ControlCode = ControlCode(0x01);
    pub const PULSE_OFF: ControlCode = ControlCode(0x02);
    pub const LATCH_ON: ControlCode = ControlCode(0x03);
    pub const LATCH_OFF: ControlCode = ControlCode(0x04);

    /// The operation type in the low nibble
    pub fn op_type(&self) -> u8 {
        self.0 & 0x0F
    }

    /// True for the operation types the reference database executes
    pub fn is_supported(&self) -> bool {
        matches!(self.op_type(), 0x01..=0x04)
    }

    /// The latched end state this code drives the point to, if any.
    /// Pulse codes return the pulsed state; NUL returns `None`.
    pub fn latched_state(&self) -> Option<bool> {
        match self.op_type() {
            0x01 | 0x03 => Some(true),
            0x02 | 0x04 => Some(false),
            _ => None,
        }
    }
}

/// Control Relay Output Block payload (g12v1), excluding the status octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControlRelayOutputBlock {
    pub code: ControlCode,
    pub count: u8,
    /// Milliseconds the output stays active per pulse
    pub on_time: u32,
    /// Milliseconds the output stays released per pulse
    pub off_time: u32,
}

impl ControlRelayOutputBlock {
    /// Create a new CROB payload
    pub fn new(code: ControlCode, count: u8, on_time: u32, off_time: u32) -> Self {
        Self {
            code,
            count,
            on_time,
            off_time,
        }
    }

    /// Encoded size including the status octet
    pub const WIRE_SIZE: usize = 11;

    /// Decode the payload and its trailing status octet
    pub fn decode(reader: &mut Reader<'_>) -> encoding::Result<(Self, CommandStatus)> {
        let code = ControlCode(reader.read_u8()?);
        let count = reader.read_u8()?;
        let on_time = reader.read_u32_le()?;
        let off_time = reader.read_u32_le()?;
        let status = CommandStatus::from(reader.read_u8()?);
        Ok((
            Self {
                code,
                count,
                on_time,
                off_time,
            },
            status,
        ))
    }

    /// Encode the payload with the given status octet
    pub fn encode(
        &self,
        status: CommandStatus,
        writer: &mut ResponseWriter,
    ) -> encoding::Result<()> {
        writer.write_u8(self.code.0)?;
        writer.write_u8(self.count)?;
        writer.write_u32_le(self.on_time)?;
        writer.write_u32_le(self.off_time)?;
        writer.write_u8(status as u8)
    }
}

/// Analog output command payload (g41), excluding the status octet.
///
/// The variant records the wire width the master used, so an operate can be
/// compared bit-for-bit against its select.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AnalogCommand {
    /// v1: 32-bit signed
    I32(i32),
    /// v2: 16-bit signed
    I16(i16),
    /// v3: single-precision float
    F32(f32),
    /// v4: double-precision float
    F64(f64),
}

impl AnalogCommand {
    /// The variation number this payload came from
    pub fn variation(&self) -> u8 {
        match self {
            AnalogCommand::I32(_) => 1,
            AnalogCommand::I16(_) => 2,
            AnalogCommand::F32(_) => 3,
            AnalogCommand::F64(_) => 4,
        }
    }

    /// Encoded size including the status octet
    pub fn wire_size(&self) -> usize {
        match self {
            AnalogCommand::I32(_) | AnalogCommand::F32(_) => 5,
            AnalogCommand::I16(_) => 3,
            AnalogCommand::F64(_) => 9,
        }
    }

    /// The engineering value handed to the provider
    pub fn value(&self) -> f64 {
        match self {
            AnalogCommand::I32(v) => *v as f64,
            AnalogCommand::I16(v) => *v as f64,
            AnalogCommand::F32(v) => *v as f64,
            AnalogCommand::F64(v) => *v,
        }
    }

    /// Decode a payload of the given variation and its status octet
    pub fn decode(
        variation: u8,
        reader: &mut Reader<'_>,
    ) -> encoding::Result<(Self, CommandStatus)> {
        let command = match variation {
            1 => AnalogCommand::I32(reader.read_i32_le()?),
            2 => AnalogCommand::I16(reader.read_i16_le()?),
            3 => AnalogCommand::F32(reader.read_f32_le()?),
            4 => AnalogCommand::F64(reader.read_f64_le()?),
            _ => return Err(encoding::EncodingError::ValueOutOfRange),
        };
        let status = CommandStatus::from(reader.read_u8()?);
        Ok((command, status))
    }

    /// Encode the payload with the given status octet
    pub fn encode(
        &self,
        status: CommandStatus,
        writer: &mut ResponseWriter,
    ) -> encoding::Result<()> {
        match self {
            AnalogCommand::I32(v) => writer.write_i32_le(*v)?,
            AnalogCommand::I16(v) => writer.write_i16_le(*v)?,
            AnalogCommand::F32(v) => writer.write_f32_le(*v)?,
            AnalogCommand::F64(v) => writer.write_f64_le(*v)?,
        }
        writer.write_u8(status as u8)
    }
}

impl PartialEq for AnalogCommand {
    /// Bit-pattern equality: an operate matches its select only when the
    /// wire octets match, so two NaN payloads with identical bits compare
    /// equal and +0.0 differs from -0.0.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AnalogCommand::I32(a), AnalogCommand::I32(b)) => a == b,
            (AnalogCommand::I16(a), AnalogCommand::I16(b)) => a == b,
            (AnalogCommand::F32(a), AnalogCommand::F32(b)) => a.to_bits() == b.to_bits(),
            (AnalogCommand::F64(a), AnalogCommand::F64(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for AnalogCommand {}

/// Which output table a simple arm refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum OutputKind {
    Binary,
    Analog,
}

/// Parameters recorded by a simple (single-point) select
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArmedParams {
    Crob(ControlRelayOutputBlock),
    Analog(AnalogCommand),
}

#[derive(Debug, Clone)]
struct SelectArm {
    params: ArmedParams,
    expires_at: u64,
}

/// An armed pattern select over a point range
#[derive(Debug, Clone)]
struct PatternArm {
    start: u16,
    stop: u16,
    control: ControlRelayOutputBlock,
    mask: Vec<u8>,
    expires_at: u64,
}

/// Per-channel table of armed selects.
///
/// All methods take the current monotonic time in milliseconds; the session
/// calls [`tick`](Self::tick) from its timer path to purge expired arms so
/// their provider cancel hooks run promptly, but expiry is also enforced
/// lazily on every operate.
#[derive(Debug, Default)]
pub struct ControlState {
    arms: HashMap<(OutputKind, u16), SelectArm>,
    pattern: Option<PatternArm>,
}

impl ControlState {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any select is currently armed
    pub fn is_armed(&self) -> bool {
        !self.arms.is_empty() || self.pattern.is_some()
    }

    /// Purge expired arms, invoking the provider cancel hooks
    pub fn tick<P>(&mut self, provider: &mut P, now: u64)
    where
        P: BinaryOutputProvider + AnalogOutputProvider,
    {
        let expired: Vec<(OutputKind, u16)> = self
            .arms
            .iter()
            .filter(|(_, arm)| now > arm.expires_at)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            debug!("select arm expired for point {}", key.1);
            self.arms.remove(&key);
            match key.0 {
                OutputKind::Binary => BinaryOutputProvider::cancel_select(provider, key.1),
                OutputKind::Analog => AnalogOutputProvider::cancel_select(provider, key.1),
            }
        }
        if let Some(pattern) = &self.pattern {
            if now > pattern.expires_at {
                let (start, stop) = (pattern.start, pattern.stop);
                self.pattern = None;
                cancel_pattern_points(provider, start, stop);
            }
        }
    }

    /// Select a CROB on one point
    pub fn select_crob<P: BinaryOutputProvider>(
        &mut self,
        provider: &mut P,
        point: u16,
        control: ControlRelayOutputBlock,
        now: u64,
        timeout_ms: u64,
    ) -> CommandStatus {
        // A superseding select cancels whatever was armed before it
        if self.arms.remove(&(OutputKind::Binary, point)).is_some() {
            provider.cancel_select(point);
        }
        let status = provider.select(point, &control);
        if status == CommandStatus::Success {
            self.arms.insert(
                (OutputKind::Binary, point),
                SelectArm {
                    params: ArmedParams::Crob(control),
                    expires_at: now + timeout_ms,
                },
            );
        } else {
            warn!("CROB select rejected for point {}: {:?}", point, status);
        }
        status
    }

    /// Operate a previously selected CROB
    pub fn operate_crob<P: BinaryOutputProvider>(
        &mut self,
        provider: &mut P,
        point: u16,
        control: ControlRelayOutputBlock,
        now: u64,
    ) -> CommandStatus {
        let key = (OutputKind::Binary, point);
        let Some(arm) = self.arms.get(&key) else {
            return CommandStatus::NoSelect;
        };
        if now > arm.expires_at {
            self.arms.remove(&key);
            provider.cancel_select(point);
            warn!("CROB operate after deadline for point {}", point);
            return CommandStatus::Timeout;
        }
        if arm.params != ArmedParams::Crob(control) {
            warn!("CROB operate parameter mismatch for point {}", point);
            return CommandStatus::NoSelect;
        }
        self.arms.remove(&key);
        provider.operate(point, &control)
    }

    /// Execute a CROB without the select phase (direct operate)
    pub fn direct_operate_crob<P: BinaryOutputProvider>(
        &mut self,
        provider: &mut P,
        point: u16,
        control: ControlRelayOutputBlock,
    ) -> CommandStatus {
        provider.operate(point, &control)
    }

    /// Select an analog command on one point
    pub fn select_analog<P: AnalogOutputProvider>(
        &mut self,
        provider: &mut P,
        point: u16,
        command: AnalogCommand,
        now: u64,
        timeout_ms: u64,
    ) -> CommandStatus {
        if self.arms.remove(&(OutputKind::Analog, point)).is_some() {
            provider.cancel_select(point);
        }
        let status = provider.select(point, command.value());
        if status == CommandStatus::Success {
            self.arms.insert(
                (OutputKind::Analog, point),
                SelectArm {
                    params: ArmedParams::Analog(command),
                    expires_at: now + timeout_ms,
                },
            );
        } else {
            warn!("analog select rejected for point {}: {:?}", point, status);
        }
        status
    }

    /// Operate a previously selected analog command
    pub fn operate_analog<P: AnalogOutputProvider>(
        &mut self,
        provider: &mut P,
        point: u16,
        command: AnalogCommand,
        now: u64,
    ) -> CommandStatus {
        let key = (OutputKind::Analog, point);
        let Some(arm) = self.arms.get(&key) else {
            return CommandStatus::NoSelect;
        };
        if now > arm.expires_at {
            self.arms.remove(&key);
            provider.cancel_select(point);
            return CommandStatus::Timeout;
        }
        if arm.params != ArmedParams::Analog(command) {
            return CommandStatus::NoSelect;
        }
        self.arms.remove(&key);
        provider.operate(point, command.value())
    }

    /// Execute an analog command without the select phase
    pub fn direct_operate_analog<P: AnalogOutputProvider>(
        &mut self,
        provider: &mut P,
        point: u16,
        command: AnalogCommand,
    ) -> CommandStatus {
        provider.operate(point, command.value())
    }

    /// Explicitly cancel the arm on one binary output point (no-op when the
    /// point is not armed)
    pub fn cancel_crob<P: BinaryOutputProvider>(&mut self, provider: &mut P, point: u16) {
        if self.arms.remove(&(OutputKind::Binary, point)).is_some() {
            provider.cancel_select(point);
        }
    }

    /// Explicitly cancel the arm on one analog output point
    pub fn cancel_analog<P: AnalogOutputProvider>(&mut self, provider: &mut P, point: u16) {
        if self.arms.remove(&(OutputKind::Analog, point)).is_some() {
            provider.cancel_select(point);
        }
    }

    /// Select a pattern control over `start..=stop` with the given mask.
    ///
    /// Shape validation runs before any point is touched: the mask must
    /// cover exactly the range. The whole range arms atomically; a provider
    /// rejection on any masked point rolls back the points already vetted.
    pub fn select_pattern<P: BinaryOutputProvider>(
        &mut self,
        provider: &mut P,
        start: u16,
        stop: u16,
        control: ControlRelayOutputBlock,
        mask: &[u8],
        now: u64,
        timeout_ms: u64,
    ) -> CommandStatus {
        if start > stop || !mask_covers_range(mask, start, stop) {
            return CommandStatus::FormatError;
        }
        if stop >= provider.quantity() {
            return CommandStatus::NotSupported;
        }
        // Supersede any existing pattern arm
        if let Some(previous) = self.pattern.take() {
            cancel_pattern_points(provider, previous.start, previous.stop);
        }

        for point in masked_points(mask, start, stop) {
            let status = provider.select(point, &control);
            if status != CommandStatus::Success {
                for vetted in masked_points(mask, start, stop).take_while(|&p| p < point) {
                    provider.cancel_select(vetted);
                }
                warn!("pattern select rejected at point {}: {:?}", point, status);
                return status;
            }
        }

        self.pattern = Some(PatternArm {
            start,
            stop,
            control,
            mask: mask.to_vec(),
            expires_at: now + timeout_ms,
        });
        CommandStatus::Success
    }

    /// Operate a previously selected pattern control.
    ///
    /// Partial application is allowed; the aggregate status is `Success`
    /// when every masked point succeeded, otherwise the first failure.
    pub fn operate_pattern<P: BinaryOutputProvider>(
        &mut self,
        provider: &mut P,
        start: u16,
        stop: u16,
        control: ControlRelayOutputBlock,
        mask: &[u8],
        now: u64,
    ) -> CommandStatus {
        let Some(arm) = &self.pattern else {
            return CommandStatus::NoSelect;
        };
        if now > arm.expires_at {
            let (s, e) = (arm.start, arm.stop);
            self.pattern = None;
            cancel_pattern_points(provider, s, e);
            return CommandStatus::Timeout;
        }
        if arm.start != start || arm.stop != stop || arm.control != control || arm.mask != mask {
            return CommandStatus::NoSelect;
        }
        self.pattern = None;

        let mut aggregate = CommandStatus::Success;
        for point in masked_points(mask, start, stop) {
            let status = provider.operate(point, &control);
            if status != CommandStatus::Success && aggregate == CommandStatus::Success {
                aggregate = status;
            }
        }
        aggregate
    }

}

fn cancel_pattern_points<P: BinaryOutputProvider>(provider: &mut P, start: u16, stop: u16) {
    for point in start..=stop {
        provider.cancel_select(point);
    }
}

/// True when the mask length matches the range size exactly
fn mask_covers_range(mask: &[u8], start: u16, stop: u16) -> bool {
    let points = (stop - start + 1) as usize;
    mask.len() == points.div_ceil(8)
}

/// Iterate the point numbers whose mask bit is set, lowest first
fn masked_points<'a>(
    mask: &'a [u8],
    start: u16,
    stop: u16,
) -> impl Iterator<Item = u16> + 'a {
    (start..=stop).filter(move |point| {
        let offset = (point - start) as usize;
        mask.get(offset / 8)
            .is_some_and(|byte| byte & (1 << (offset % 8)) != 0)
    })
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::object::database::{Database, DatabaseConfig};
    use crate::object::ClassMask;

    const TIMEOUT: u64 = 5_000;

    fn database() -> Database {
        Database::new(DatabaseConfig {
            binary_outputs: 8,
            analog_outputs: 4,
            default_class: ClassMask::CLASS_1,
            ..Default::default()
        })
    }

    fn latch_on() -> ControlRelayOutputBlock {
        ControlRelayOutputBlock::new(ControlCode::LATCH_ON, 1, 0, 0)
    }

    fn latch_off() -> ControlRelayOutputBlock {
        ControlRelayOutputBlock::new(ControlCode::LATCH_OFF, 1, 0, 0)
    }

    #[test]
    fn test_crob_wire_round_trip() {
        let control = ControlRelayOutputBlock::new(ControlCode::PULSE_ON, 2, 500, 250);
        let mut writer = ResponseWriter::new(16);
        control.encode(CommandStatus::Success, &mut writer).unwrap();
        let frame = writer.into_vec();
        assert_eq!(frame.len(), ControlRelayOutputBlock::WIRE_SIZE);
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0xF4, 0x01, 0x00, 0x00, 0xFA, 0x00, 0x00, 0x00, 0x00]
        );

        let (decoded, status) =
            ControlRelayOutputBlock::decode(&mut Reader::new(&frame)).unwrap();
        assert_eq!(decoded, control);
        assert_eq!(status, CommandStatus::Success);
    }

    #[test]
    fn test_analog_command_round_trip() {
        for command in [
            AnalogCommand::I32(-70_000),
            AnalogCommand::I16(1234),
            AnalogCommand::F32(2.5),
            AnalogCommand::F64(-0.125),
        ] {
            let mut writer = ResponseWriter::new(16);
            command.encode(CommandStatus::Success, &mut writer).unwrap();
            let frame = writer.into_vec();
            assert_eq!(frame.len(), command.wire_size());
            let (decoded, _) =
                AnalogCommand::decode(command.variation(), &mut Reader::new(&frame)).unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn test_select_operate_happy_path() {
        let mut db = database();
        let mut state = ControlState::new();

        assert_eq!(
            state.select_crob(&mut db, 4, latch_on(), 1_000, TIMEOUT),
            CommandStatus::Success
        );
        assert!(state.is_armed());
        assert_eq!(
            state.operate_crob(&mut db, 4, latch_on(), 2_000),
            CommandStatus::Success
        );
        assert!(!state.is_armed());
        assert!(BinaryOutputProvider::read(&db, 4).unwrap().value);

        // A control is consumed by its operate
        assert_eq!(
            state.operate_crob(&mut db, 4, latch_on(), 2_500),
            CommandStatus::NoSelect
        );
    }

    #[test]
    fn test_operate_parameter_mismatch_rejected() {
        let mut db = database();
        let mut state = ControlState::new();

        state.select_crob(&mut db, 4, latch_on(), 0, TIMEOUT);
        // Mismatched code must not execute
        assert_eq!(
            state.operate_crob(&mut db, 4, latch_off(), 100),
            CommandStatus::NoSelect
        );
        assert!(!BinaryOutputProvider::read(&db, 4).unwrap().value);

        // The arm survives a mismatched operate
        assert_eq!(
            state.operate_crob(&mut db, 4, latch_on(), 200),
            CommandStatus::Success
        );
    }

    #[test]
    fn test_operate_after_deadline_rejected() {
        let mut db = database();
        let mut state = ControlState::new();

        state.select_crob(&mut db, 1, latch_on(), 1_000, TIMEOUT);
        assert_eq!(
            state.operate_crob(&mut db, 1, latch_on(), 1_000 + TIMEOUT + 1),
            CommandStatus::Timeout
        );
        assert!(!BinaryOutputProvider::read(&db, 1).unwrap().value);
        // The expired arm is gone; a retry is NoSelect, not Timeout
        assert_eq!(
            state.operate_crob(&mut db, 1, latch_on(), 1_000 + TIMEOUT + 2),
            CommandStatus::NoSelect
        );
    }

    #[test]
    fn test_superseding_select_replaces_arm() {
        let mut db = database();
        let mut state = ControlState::new();

        state.select_crob(&mut db, 2, latch_on(), 0, TIMEOUT);
        state.select_crob(&mut db, 2, latch_off(), 10, TIMEOUT);

        // Only the second select's parameters operate
        assert_eq!(
            state.operate_crob(&mut db, 2, latch_on(), 20),
            CommandStatus::NoSelect
        );
        assert_eq!(
            state.operate_crob(&mut db, 2, latch_off(), 30),
            CommandStatus::Success
        );
    }

    #[test]
    fn test_tick_purges_expired_arms() {
        let mut db = database();
        let mut state = ControlState::new();

        state.select_crob(&mut db, 0, latch_on(), 0, TIMEOUT);
        state.select_analog(&mut db, 0, AnalogCommand::I16(5), 0, TIMEOUT);
        state.tick(&mut db, TIMEOUT);
        assert!(state.is_armed());
        state.tick(&mut db, TIMEOUT + 1);
        assert!(!state.is_armed());
    }

    #[test]
    fn test_cancel_is_noop_when_unarmed() {
        let mut db = database();
        let mut state = ControlState::new();
        state.cancel_crob(&mut db, 3);
        assert!(!state.is_armed());
    }

    #[test]
    fn test_direct_operate_ignores_arm_state() {
        let mut db = database();
        let mut state = ControlState::new();
        assert_eq!(
            state.direct_operate_crob(&mut db, 6, latch_on()),
            CommandStatus::Success
        );
        assert!(BinaryOutputProvider::read(&db, 6).unwrap().value);
    }

    #[test]
    fn test_analog_select_operate_bit_exact_match() {
        let mut db = database();
        let mut state = ControlState::new();

        state.select_analog(&mut db, 2, AnalogCommand::F32(1.5), 0, TIMEOUT);
        // Same numeric value in a different width is not the same command
        assert_eq!(
            state.operate_analog(&mut db, 2, AnalogCommand::F64(1.5), 10),
            CommandStatus::NoSelect
        );
        assert_eq!(
            state.operate_analog(&mut db, 2, AnalogCommand::F32(1.5), 20),
            CommandStatus::Success
        );
        assert_eq!(AnalogOutputProvider::read(&db, 2).unwrap().value, 1.5);
    }

    #[test]
    fn test_pattern_mask_shape_validation() {
        let mut db = database();
        let mut state = ControlState::new();

        // 0..=7 needs exactly one mask octet
        assert_eq!(
            state.select_pattern(&mut db, 0, 7, latch_on(), &[0xFF, 0x00], 0, TIMEOUT),
            CommandStatus::FormatError
        );
        // Range past the database quantity
        assert_eq!(
            state.select_pattern(&mut db, 0, 8, latch_on(), &[0xFF, 0x01], 0, TIMEOUT),
            CommandStatus::NotSupported
        );
    }

    #[test]
    fn test_pattern_select_operate() {
        let mut db = database();
        let mut state = ControlState::new();
        // Points 1, 3 and 5 of range 0..=7
        let mask = [0b0010_1010];

        assert_eq!(
            state.select_pattern(&mut db, 0, 7, latch_on(), &mask, 0, TIMEOUT),
            CommandStatus::Success
        );
        assert_eq!(
            state.operate_pattern(&mut db, 0, 7, latch_on(), &mask, 100),
            CommandStatus::Success
        );

        for point in 0..8u16 {
            let expected = matches!(point, 1 | 3 | 5);
            assert_eq!(
                BinaryOutputProvider::read(&db, point).unwrap().value,
                expected,
                "point {}",
                point
            );
        }

        // Consumed by the operate
        assert_eq!(
            state.operate_pattern(&mut db, 0, 7, latch_on(), &mask, 200),
            CommandStatus::NoSelect
        );
    }

    #[test]
    fn test_pattern_operate_mask_mismatch() {
        let mut db = database();
        let mut state = ControlState::new();

        state.select_pattern(&mut db, 0, 7, latch_on(), &[0b0000_1111], 0, TIMEOUT);
        assert_eq!(
            state.operate_pattern(&mut db, 0, 7, latch_on(), &[0b1111_0000], 10),
            CommandStatus::NoSelect
        );
    }
}
