//! Event Queue and CTO Engine
//!
//! This module keeps the per-group change-event lists of one channel and
//! serializes pending events into response fragments, compressing timestamps
//! with Common-Time-of-Occurrence (CTO) objects where the event variation
//! calls for it.
//!
//! # Event lifecycle
//!
//! An event is created when the channel's scan finds a changed point,
//! marked `sent` when it is written into a response fragment, and destroyed
//! only when the master confirms that fragment. A read that arrives between
//! send and confirm sees the earlier events as already sent and skips them;
//! [`EventBuffers::reset_sent`] exists for the explicit full-retransmission
//! case. Nothing here ever destroys an event speculatively.
//!
//! # CTO compression
//!
//! The relative-time event variations carry a 16-bit offset from the most
//! recent CTO object instead of a full 48-bit timestamp. Single-bit (g2) and
//! double-bit (g4) events share one CTO stream: the writer merges both lists
//! in chronological order and starts a fresh CTO object whenever the next
//! event is earlier than the current reference, farther ahead than the
//! sub-minute window, or differs in clock-validity. A change of object
//! group or variation mid-stream closes the open object header the same way.
//!
//! Capacity is handled per record: if a record (plus whatever CTO and header
//! objects it would need) does not fit the remaining fragment space, the
//! partial bytes are rolled back and the writer reports "more data" with the
//! event still unsent.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use log::warn;

use crate::encoding::{self, EncodingError, ResponseWriter};
use crate::object::analog::AnalogEventVariation;
use crate::object::binary::{
    double_bit_octet, flags_octet, BinaryEventVariation, GROUP_BINARY_EVENT,
    GROUP_DOUBLE_BIT_EVENT,
};
use crate::object::counter::CounterEventVariation;
use crate::object::{Analog, Binary, ClassMask, Counter, DoubleBitBinary};
use crate::time::DnpTimestamp;

/// Common Time of Occurrence objects
pub const GROUP_CTO: u8 = 51;

/// Widest gap a relative-time record may span before a fresh CTO object is
/// required: the sub-minute precision window of the compressed encoding
pub const CTO_WINDOW_MS: u64 = 59_999;

/// What to do when an event list is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OverflowPolicy {
    /// Drop the oldest queued event to make room (favors recent data)
    #[default]
    DiscardOldest,
    /// Refuse the new event
    RejectNewest,
}

/// Capacity limits for the per-group event lists
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EventBufferConfig {
    pub max_binary: u16,
    pub max_double_bit: u16,
    pub max_counter: u16,
    pub max_analog: u16,
    pub policy: OverflowPolicy,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            max_binary: 100,
            max_double_bit: 50,
            max_counter: 50,
            max_analog: 100,
            policy: OverflowPolicy::default(),
        }
    }
}

/// Whether and how one event stream participates in a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSelection<V> {
    /// The read did not request this stream
    Skip,
    /// Serialize with each event's own variation
    PerEvent,
    /// The read named an explicit variation for the whole stream
    Forced(V),
}

impl<V: Copy> StreamSelection<V> {
    fn enabled(&self) -> bool {
        !matches!(self, StreamSelection::Skip)
    }

    fn resolve(&self, stored: V) -> V {
        match self {
            StreamSelection::Forced(v) => *v,
            _ => stored,
        }
    }
}

/// One queued change event
#[derive(Debug, Clone)]
struct Event<T, V> {
    point: u16,
    value: T,
    class: ClassMask,
    timestamp: DnpTimestamp,
    variation: V,
    sent: bool,
}

/// Ordered (oldest-first) event list for one object group
#[derive(Debug)]
struct EventList<T, V> {
    events: Vec<Event<T, V>>,
    max: usize,
    policy: OverflowPolicy,
}

impl<T, V: Copy> EventList<T, V> {
    fn new(max: u16, policy: OverflowPolicy) -> Self {
        Self {
            events: Vec::new(),
            max: max as usize,
            policy,
        }
    }

    /// Append an event; returns `false` on overflow (an event was lost
    /// either way, which one depends on the policy)
    fn push(&mut self, event: Event<T, V>) -> bool {
        if self.events.len() >= self.max {
            match self.policy {
                OverflowPolicy::DiscardOldest => {
                    self.events.remove(0);
                    self.events.push(event);
                }
                OverflowPolicy::RejectNewest => {}
            }
            return false;
        }
        self.events.push(event);
        true
    }

    /// Index of the next unsent event matching `classes`, at or after `from`
    fn next_unsent(&self, from: usize, classes: ClassMask) -> Option<usize> {
        self.events[from.min(self.events.len())..]
            .iter()
            .position(|e| !e.sent && e.class.intersects(classes))
            .map(|offset| from + offset)
    }

    fn count_unsent(&self, classes: ClassMask) -> usize {
        self.events
            .iter()
            .filter(|e| !e.sent && e.class.intersects(classes))
            .count()
    }

    fn confirm(&mut self) {
        self.events.retain(|e| !e.sent);
    }

    fn reset_sent(&mut self) {
        for event in &mut self.events {
            event.sent = false;
        }
    }
}

/// The event state of one channel: four per-group lists plus the overflow
/// indication
#[derive(Debug)]
pub struct EventBuffers {
    binary: EventList<Binary, BinaryEventVariation>,
    double_bit: EventList<DoubleBitBinary, BinaryEventVariation>,
    counter: EventList<Counter, CounterEventVariation>,
    analog: EventList<Analog, AnalogEventVariation>,
    overflowed: bool,
}

impl EventBuffers {
    /// Create empty buffers with the given limits
    pub fn new(config: &EventBufferConfig) -> Self {
        Self {
            binary: EventList::new(config.max_binary, config.policy),
            double_bit: EventList::new(config.max_double_bit, config.policy),
            counter: EventList::new(config.max_counter, config.policy),
            analog: EventList::new(config.max_analog, config.policy),
            overflowed: false,
        }
    }

    /// Queue a binary input change
    pub fn record_binary(
        &mut self,
        point: u16,
        value: Binary,
        class: ClassMask,
        timestamp: DnpTimestamp,
        variation: BinaryEventVariation,
    ) {
        if class.is_empty() {
            return;
        }
        if !self.binary.push(Event {
            point,
            value,
            class,
            timestamp,
            variation,
            sent: false,
        }) {
            warn!("binary event buffer overflow at point {}", point);
            self.overflowed = true;
        }
    }

    /// Queue a double-bit input change
    pub fn record_double_bit(
        &mut self,
        point: u16,
        value: DoubleBitBinary,
        class: ClassMask,
        timestamp: DnpTimestamp,
        variation: BinaryEventVariation,
    ) {
        if class.is_empty() {
            return;
        }
        if !self.double_bit.push(Event {
            point,
            value,
            class,
            timestamp,
            variation,
            sent: false,
        }) {
            warn!("double-bit event buffer overflow at point {}", point);
            self.overflowed = true;
        }
    }

    /// Queue a counter change
    pub fn record_counter(
        &mut self,
        point: u16,
        value: Counter,
        class: ClassMask,
        timestamp: DnpTimestamp,
        variation: CounterEventVariation,
    ) {
        if class.is_empty() {
            return;
        }
        if !self.counter.push(Event {
            point,
            value,
            class,
            timestamp,
            variation,
            sent: false,
        }) {
            warn!("counter event buffer overflow at point {}", point);
            self.overflowed = true;
        }
    }

    /// Queue an analog input change
    pub fn record_analog(
        &mut self,
        point: u16,
        value: Analog,
        class: ClassMask,
        timestamp: DnpTimestamp,
        variation: AnalogEventVariation,
    ) {
        if class.is_empty() {
            return;
        }
        if !self.analog.push(Event {
            point,
            value,
            class,
            timestamp,
            variation,
            sent: false,
        }) {
            warn!("analog event buffer overflow at point {}", point);
            self.overflowed = true;
        }
    }

    /// Number of unsent events in the given classes across all groups
    pub fn pending(&self, classes: ClassMask) -> usize {
        self.binary.count_unsent(classes)
            + self.double_bit.count_unsent(classes)
            + self.counter.count_unsent(classes)
            + self.analog.count_unsent(classes)
    }

    /// True when an event has been lost since the last confirm
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Destroy every event previously marked sent; called when the master's
    /// application-layer confirmation arrives
    pub fn confirm(&mut self) {
        self.binary.confirm();
        self.double_bit.confirm();
        self.counter.confirm();
        self.analog.confirm();
        self.overflowed = false;
    }

    /// Clear the sent marks so all queued events are eligible again
    /// (explicit full retransmission)
    pub fn reset_sent(&mut self) {
        self.binary.reset_sent();
        self.double_bit.reset_sent();
        self.counter.reset_sent();
        self.analog.reset_sent();
    }

    /// Serialize pending single-bit and double-bit events, merged in
    /// chronological order with shared CTO objects.
    ///
    /// The stream selections decide which of the two lists participate and
    /// whether a forced variation replaces the per-event one; `binary_first`
    /// breaks timestamp ties in favor of the group the read requested first.
    /// Written events are marked sent. Returns `true` when matching events
    /// remain for a continuation fragment.
    pub fn write_binary_events(
        &mut self,
        writer: &mut ResponseWriter,
        classes: ClassMask,
        binary: StreamSelection<BinaryEventVariation>,
        double_bit: StreamSelection<BinaryEventVariation>,
        binary_first: bool,
    ) -> encoding::Result<bool> {
        let mut state = WriteState::new();
        let mut bin_pos = 0usize;
        let mut dbl_pos = 0usize;

        loop {
            let bin_next = binary
                .enabled()
                .then(|| self.binary.next_unsent(bin_pos, classes))
                .flatten();
            let dbl_next = double_bit
                .enabled()
                .then(|| self.double_bit.next_unsent(dbl_pos, classes))
                .flatten();

            let take_binary = match (bin_next, dbl_next) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(b), Some(d)) => {
                    let bt = self.binary.events[b].timestamp.millis();
                    let dt = self.double_bit.events[d].timestamp.millis();
                    if bt == dt {
                        binary_first
                    } else {
                        bt < dt
                    }
                }
            };

            if take_binary {
                let index = bin_next.unwrap();
                let event = &self.binary.events[index];
                let variation = binary.resolve(event.variation);
                let octet = flags_octet(event.value.value, event.value.flags);
                let written = state.write_record(
                    writer,
                    GROUP_BINARY_EVENT,
                    variation,
                    event.point,
                    octet,
                    &event.timestamp,
                )?;
                if !written {
                    state.close(writer)?;
                    return Ok(true);
                }
                self.binary.events[index].sent = true;
                bin_pos = index + 1;
            } else {
                let index = dbl_next.unwrap();
                let event = &self.double_bit.events[index];
                let variation = double_bit.resolve(event.variation);
                let octet = double_bit_octet(event.value.value, event.value.flags);
                let written = state.write_record(
                    writer,
                    GROUP_DOUBLE_BIT_EVENT,
                    variation,
                    event.point,
                    octet,
                    &event.timestamp,
                )?;
                if !written {
                    state.close(writer)?;
                    return Ok(true);
                }
                self.double_bit.events[index].sent = true;
                dbl_pos = index + 1;
            }
        }

        state.close(writer)?;
        Ok(false)
    }

    /// Serialize pending counter events; same contract as
    /// [`write_binary_events`](Self::write_binary_events) without the CTO
    /// machinery (counter variations carry absolute time)
    pub fn write_counter_events(
        &mut self,
        writer: &mut ResponseWriter,
        classes: ClassMask,
        variation_override: Option<CounterEventVariation>,
    ) -> encoding::Result<bool> {
        let mut header: Option<OpenHeader> = None;
        let mut pos = 0usize;

        while let Some(index) = self.counter.next_unsent(pos, classes) {
            let event = &self.counter.events[index];
            let variation = variation_override.unwrap_or(event.variation);
            let checkpoint = writer.len();

            let result = (|| -> encoding::Result<()> {
                if header
                    .as_ref()
                    .is_none_or(|h| h.variation != variation.wire_variation())
                {
                    if let Some(h) = header.take() {
                        h.patch_count(writer)?;
                    }
                    header = Some(OpenHeader::write(
                        writer,
                        crate::object::counter::GROUP_COUNTER_EVENT,
                        variation.wire_variation(),
                    )?);
                }
                writer.write_u16_le(event.point)?;
                variation.encode(event.value.value, event.value.flags, &event.timestamp, writer)
            })();

            match result {
                Ok(()) => {
                    if let Some(h) = header.as_mut() {
                        h.count += 1;
                    }
                    self.counter.events[index].sent = true;
                    pos = index + 1;
                }
                Err(EncodingError::BufferOverflow) => {
                    writer.truncate(checkpoint);
                    if let Some(h) = header.take() {
                        if !h.rolled_back(checkpoint) {
                            h.patch_count(writer)?;
                        }
                    }
                    return Ok(true);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(h) = header.take() {
            h.patch_count(writer)?;
        }
        Ok(false)
    }

    /// Serialize pending analog events; same contract as
    /// [`write_counter_events`](Self::write_counter_events)
    pub fn write_analog_events(
        &mut self,
        writer: &mut ResponseWriter,
        classes: ClassMask,
        variation_override: Option<AnalogEventVariation>,
    ) -> encoding::Result<bool> {
        let mut header: Option<OpenHeader> = None;
        let mut pos = 0usize;

        while let Some(index) = self.analog.next_unsent(pos, classes) {
            let event = &self.analog.events[index];
            let variation = variation_override.unwrap_or(event.variation);
            let checkpoint = writer.len();

            let result = (|| -> encoding::Result<()> {
                if header
                    .as_ref()
                    .is_none_or(|h| h.variation != variation.wire_variation())
                {
                    if let Some(h) = header.take() {
                        h.patch_count(writer)?;
                    }
                    header = Some(OpenHeader::write(
                        writer,
                        crate::object::analog::GROUP_ANALOG_EVENT,
                        variation.wire_variation(),
                    )?);
                }
                writer.write_u16_le(event.point)?;
                variation.encode(event.value.value, event.value.flags, &event.timestamp, writer)
            })();

            match result {
                Ok(()) => {
                    if let Some(h) = header.as_mut() {
                        h.count += 1;
                    }
                    self.analog.events[index].sent = true;
                    pos = index + 1;
                }
                Err(EncodingError::BufferOverflow) => {
                    writer.truncate(checkpoint);
                    if let Some(h) = header.take() {
                        if !h.rolled_back(checkpoint) {
                            h.patch_count(writer)?;
                        }
                    }
                    return Ok(true);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(h) = header.take() {
            h.patch_count(writer)?;
        }
        Ok(false)
    }
}

/// An event object header whose count is patched once its records are known
#[derive(Debug)]
struct OpenHeader {
    start: usize,
    count_offset: usize,
    variation: u8,
    count: u16,
}

impl OpenHeader {
    /// Write `group / variation / 0x28 / count-placeholder`
    fn write(writer: &mut ResponseWriter, group: u8, variation: u8) -> encoding::Result<Self> {
        let start = writer.position();
        writer.write_u8(group)?;
        writer.write_u8(variation)?;
        writer.write_u8(0x28)?;
        let count_offset = writer.position();
        writer.write_u16_le(0)?;
        Ok(Self {
            start,
            count_offset,
            variation,
            count: 0,
        })
    }

    fn patch_count(&self, writer: &mut ResponseWriter) -> encoding::Result<()> {
        if self.count == 0 {
            writer.truncate(self.start);
            return Ok(());
        }
        writer.patch(self.count_offset, &self.count.to_le_bytes())
    }

    /// True when a rollback to `checkpoint` already removed this header
    fn rolled_back(&self, checkpoint: usize) -> bool {
        self.start >= checkpoint
    }
}

/// Writer state for the merged single/double-bit stream: the open object
/// header plus the CTO reference currently in force
#[derive(Debug)]
struct WriteState {
    header: Option<OpenHeader>,
    header_group: u8,
    cto: Option<DnpTimestamp>,
}

impl WriteState {
    fn new() -> Self {
        Self {
            header: None,
            header_group: 0,
            cto: None,
        }
    }

    /// Try to write one event record, opening CTO and header objects as
    /// needed. Returns `Ok(false)` when the fragment is out of space, with
    /// every partial octet rolled back.
    fn write_record(
        &mut self,
        writer: &mut ResponseWriter,
        group: u8,
        variation: BinaryEventVariation,
        point: u16,
        state_octet: u8,
        timestamp: &DnpTimestamp,
    ) -> encoding::Result<bool> {
        let checkpoint = writer.len();
        let closed_header_count = self.header.as_ref().map(|h| h.count);

        let result = self.try_write_record(writer, group, variation, point, state_octet, timestamp);
        match result {
            Ok(()) => Ok(true),
            Err(EncodingError::BufferOverflow) => {
                writer.truncate(checkpoint);
                // If the header object predates the checkpoint it survived
                // the rollback with its previous record count; restore the
                // bookkeeping to match.
                if let Some(h) = self.header.as_mut() {
                    if h.rolled_back(checkpoint) {
                        self.header = None;
                    } else if let Some(count) = closed_header_count {
                        h.count = count;
                    }
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn try_write_record(
        &mut self,
        writer: &mut ResponseWriter,
        group: u8,
        variation: BinaryEventVariation,
        point: u16,
        state_octet: u8,
        timestamp: &DnpTimestamp,
    ) -> encoding::Result<()> {
        let needs_new_cto = variation.needs_cto() && !self.cto_covers(timestamp);
        let header_matches = !needs_new_cto
            && self.header.as_ref().is_some_and(|h| {
                self.header_group == group && h.variation == variation.wire_variation()
            });

        if !header_matches {
            if let Some(h) = self.header.take() {
                h.patch_count(writer)?;
            }
            if needs_new_cto {
                self.write_cto(writer, timestamp)?;
            }
            self.header = Some(OpenHeader::write(writer, group, variation.wire_variation())?);
            self.header_group = group;
        }

        writer.write_u16_le(point)?;
        variation.encode(state_octet, timestamp, self.cto.as_ref(), writer)?;
        if let Some(h) = self.header.as_mut() {
            h.count += 1;
        }
        Ok(())
    }

    /// True when the current CTO can represent `timestamp` exactly
    fn cto_covers(&self, timestamp: &DnpTimestamp) -> bool {
        match &self.cto {
            None => false,
            Some(cto) => {
                cto.invalid == timestamp.invalid
                    && timestamp.millis() >= cto.millis()
                    && timestamp.millis() - cto.millis() <= CTO_WINDOW_MS
            }
        }
    }

    /// Write a g51 object (v1 synchronized, v2 unsynchronized) carrying the
    /// new reference time
    fn write_cto(
        &mut self,
        writer: &mut ResponseWriter,
        timestamp: &DnpTimestamp,
    ) -> encoding::Result<()> {
        let variation = if timestamp.invalid { 2 } else { 1 };
        writer.write_u8(GROUP_CTO)?;
        writer.write_u8(variation)?;
        writer.write_u8(0x07)?;
        writer.write_u8(1)?;
        writer.append(&timestamp.to_wire_bytes())?;
        self.cto = Some(*timestamp);
        Ok(())
    }

    /// Patch the count of the open header, if any
    fn close(&mut self, writer: &mut ResponseWriter) -> encoding::Result<()> {
        if let Some(h) = self.header.take() {
            h.patch_count(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Flags;

    fn binary(value: bool) -> Binary {
        Binary {
            value,
            flags: Flags::ONLINE,
        }
    }

    fn buffers() -> EventBuffers {
        EventBuffers::new(&EventBufferConfig::default())
    }

    fn record_binary_at(buffers: &mut EventBuffers, point: u16, millis: u64) {
        buffers.record_binary(
            point,
            binary(true),
            ClassMask::CLASS_1,
            DnpTimestamp::from_millis(millis),
            BinaryEventVariation::RelativeTime,
        );
    }

    #[test]
    fn test_pending_counts_by_class() {
        let mut buffers = buffers();
        buffers.record_binary(
            0,
            binary(true),
            ClassMask::CLASS_1,
            DnpTimestamp::from_millis(10),
            BinaryEventVariation::AbsoluteTime,
        );
        buffers.record_analog(
            3,
            Analog {
                value: 1.0,
                flags: Flags::ONLINE,
            },
            ClassMask::CLASS_2,
            DnpTimestamp::from_millis(20),
            AnalogEventVariation::I32,
        );

        assert_eq!(buffers.pending(ClassMask::CLASS_1), 1);
        assert_eq!(buffers.pending(ClassMask::CLASS_2), 1);
        assert_eq!(buffers.pending(ClassMask::CLASS_3), 0);
        assert_eq!(buffers.pending(ClassMask::all()), 2);
    }

    #[test]
    fn test_classless_points_produce_no_events() {
        let mut buffers = buffers();
        buffers.record_binary(
            0,
            binary(true),
            ClassMask::empty(),
            DnpTimestamp::from_millis(10),
            BinaryEventVariation::NoTime,
        );
        assert_eq!(buffers.pending(ClassMask::all()), 0);
    }

    #[test]
    fn test_single_cto_for_close_events() {
        let mut buffers = buffers();
        record_binary_at(&mut buffers, 0, 100_000);
        record_binary_at(&mut buffers, 1, 100_500);
        record_binary_at(&mut buffers, 2, 101_000);

        let mut writer = ResponseWriter::new(256);
        let more = buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        assert!(!more);

        let frame = writer.into_vec();
        // One CTO (g51v1), one g2v3 header, three records
        let mut expected = vec![51, 1, 0x07, 1];
        expected.extend_from_slice(&DnpTimestamp::from_millis(100_000).to_wire_bytes());
        expected.extend_from_slice(&[2, 3, 0x28, 3, 0]);
        expected.extend_from_slice(&[0, 0, 0x81, 0x00, 0x00]); // point 0, delta 0
        expected.extend_from_slice(&[1, 0, 0x81, 0xF4, 0x01]); // point 1, delta 500
        expected.extend_from_slice(&[2, 0, 0x81, 0xE8, 0x03]); // point 2, delta 1000
        assert_eq!(frame, expected);
    }

    #[test]
    fn test_cto_break_past_window() {
        let mut buffers = buffers();
        record_binary_at(&mut buffers, 0, 0);
        record_binary_at(&mut buffers, 1, CTO_WINDOW_MS);
        // One millisecond past the window: needs a new CTO
        record_binary_at(&mut buffers, 2, CTO_WINDOW_MS + 1);

        let mut writer = ResponseWriter::new(256);
        buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        let frame = writer.into_vec();

        let cto_objects = frame.windows(2).filter(|w| w == &[51, 1]).count();
        assert_eq!(cto_objects, 2);
    }

    #[test]
    fn test_cto_break_on_validity_change() {
        let mut buffers = buffers();
        record_binary_at(&mut buffers, 0, 1_000);
        buffers.record_binary(
            1,
            binary(false),
            ClassMask::CLASS_1,
            DnpTimestamp::from_millis(1_100).with_validity(false),
            BinaryEventVariation::RelativeTime,
        );

        let mut writer = ResponseWriter::new(256);
        buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        let frame = writer.into_vec();

        // One synchronized and one unsynchronized CTO
        assert_eq!(frame.windows(2).filter(|w| w == &[51, 1]).count(), 1);
        assert_eq!(frame.windows(2).filter(|w| w == &[51, 2]).count(), 1);
    }

    #[test]
    fn test_two_stream_merge_is_chronological() {
        let mut buffers = buffers();
        record_binary_at(&mut buffers, 0, 3_000);
        record_binary_at(&mut buffers, 1, 1_000);
        buffers.record_double_bit(
            0,
            DoubleBitBinary {
                value: crate::object::DoubleBit::DeterminedOn,
                flags: Flags::ONLINE,
            },
            ClassMask::CLASS_1,
            DnpTimestamp::from_millis(2_000),
            BinaryEventVariation::RelativeTime,
        );
        let mut writer = ResponseWriter::new(256);
        buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        let frame = writer.into_vec();

        // The double-bit event at 2000 goes out before the binary event at
        // 3000, and the out-of-order binary event at 1000 forces its own
        // CTO: headers come out g4, g2, g2
        let g2_headers = frame.windows(3).filter(|w| w == &[2, 3, 0x28]).count();
        let g4_headers = frame.windows(3).filter(|w| w == &[4, 3, 0x28]).count();
        assert_eq!(g2_headers, 2);
        assert_eq!(g4_headers, 1);
    }

    #[test]
    fn test_variation_override() {
        let mut buffers = buffers();
        record_binary_at(&mut buffers, 7, 42_000);

        let mut writer = ResponseWriter::new(64);
        buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::Forced(BinaryEventVariation::NoTime),
                StreamSelection::Skip,
                true,
            )
            .unwrap();
        // g2v1, one record: index + state octet, no CTO anywhere
        assert_eq!(writer.as_slice(), &[2, 1, 0x28, 1, 0, 7, 0, 0x81]);
    }

    #[test]
    fn test_oversized_burst_spans_fragments() {
        let mut buffers = buffers();
        for i in 0..50u16 {
            buffers.record_binary(
                i,
                binary(true),
                ClassMask::CLASS_1,
                DnpTimestamp::from_millis(1_000 + i as u64),
                BinaryEventVariation::NoTime,
            );
        }

        // Header (5) + 10 records of 3 octets each
        let mut writer = ResponseWriter::new(35);
        let more = buffers
            .write_binary_events(
                &mut writer,
                ClassMask::CLASS_1,
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        assert!(more);
        assert_eq!(buffers.pending(ClassMask::CLASS_1), 40);

        let first = writer.into_vec();
        assert_eq!(&first[..5], &[2, 1, 0x28, 10, 0]);

        // Second fragment before any confirm: the next ten, no repeats
        let mut writer = ResponseWriter::new(35);
        let more = buffers
            .write_binary_events(
                &mut writer,
                ClassMask::CLASS_1,
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        assert!(more);
        let second = writer.into_vec();
        // First record of the second fragment is point 10
        assert_eq!(&second[5..7], &[10, 0]);

        // Nothing is destroyed until the confirm arrives
        buffers.confirm();
        assert_eq!(buffers.pending(ClassMask::CLASS_1), 30);
    }

    #[test]
    fn test_no_partial_record_on_tight_buffer() {
        let mut buffers = buffers();
        record_binary_at(&mut buffers, 0, 500);

        // CTO (10) + header (5) + record (5) = 20 needed; 19 available
        let mut writer = ResponseWriter::new(19);
        let more = buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        assert!(more);
        assert!(writer.is_empty());
        // Event still unsent, retried next fragment
        assert_eq!(buffers.pending(ClassMask::all()), 1);
    }

    #[test]
    fn test_reset_sent_allows_retransmission() {
        let mut buffers = buffers();
        record_binary_at(&mut buffers, 0, 500);

        let mut writer = ResponseWriter::new(64);
        buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        assert_eq!(buffers.pending(ClassMask::all()), 0);

        buffers.reset_sent();
        assert_eq!(buffers.pending(ClassMask::all()), 1);
    }

    #[test]
    fn test_overflow_discard_oldest() {
        let config = EventBufferConfig {
            max_binary: 2,
            ..Default::default()
        };
        let mut buffers = EventBuffers::new(&config);
        for i in 0..3u16 {
            buffers.record_binary(
                i,
                binary(true),
                ClassMask::CLASS_1,
                DnpTimestamp::from_millis(i as u64),
                BinaryEventVariation::NoTime,
            );
        }
        assert!(buffers.overflowed());
        assert_eq!(buffers.pending(ClassMask::CLASS_1), 2);

        let mut writer = ResponseWriter::new(64);
        buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        // The oldest event (point 0) was discarded
        assert_eq!(&writer.as_slice()[5..7], &[1, 0]);
    }

    #[test]
    fn test_overflow_reject_newest() {
        let config = EventBufferConfig {
            max_binary: 2,
            policy: OverflowPolicy::RejectNewest,
            ..Default::default()
        };
        let mut buffers = EventBuffers::new(&config);
        for i in 0..3u16 {
            buffers.record_binary(
                i,
                binary(true),
                ClassMask::CLASS_1,
                DnpTimestamp::from_millis(i as u64),
                BinaryEventVariation::NoTime,
            );
        }
        assert!(buffers.overflowed());

        let mut writer = ResponseWriter::new(64);
        buffers
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .unwrap();
        // The newest event (point 2) was rejected; points 0 and 1 remain
        assert_eq!(&writer.as_slice()[5..7], &[0, 0]);

        buffers.confirm();
        assert!(!buffers.overflowed());
    }

    #[test]
    fn test_counter_events_with_time() {
        let mut buffers = buffers();
        buffers.record_counter(
            2,
            Counter {
                value: 1234,
                flags: Flags::ONLINE,
            },
            ClassMask::CLASS_2,
            DnpTimestamp::from_millis(5_000),
            CounterEventVariation::Bits32Time,
        );

        let mut writer = ResponseWriter::new(64);
        let more = buffers
            .write_counter_events(&mut writer, ClassMask::CLASS_2, None)
            .unwrap();
        assert!(!more);

        let mut expected = vec![22, 5, 0x28, 1, 0, 2, 0, 0x01, 0xD2, 0x04, 0x00, 0x00];
        expected.extend_from_slice(&DnpTimestamp::from_millis(5_000).to_wire_bytes());
        assert_eq!(writer.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_analog_event_variation_switch_splits_headers() {
        let mut buffers = buffers();
        let analog = |v: f64| Analog {
            value: v,
            flags: Flags::ONLINE,
        };
        buffers.record_analog(
            0,
            analog(1.0),
            ClassMask::CLASS_2,
            DnpTimestamp::from_millis(1),
            AnalogEventVariation::I16,
        );
        buffers.record_analog(
            1,
            analog(2.0),
            ClassMask::CLASS_2,
            DnpTimestamp::from_millis(2),
            AnalogEventVariation::Float,
        );

        let mut writer = ResponseWriter::new(128);
        buffers
            .write_analog_events(&mut writer, ClassMask::CLASS_2, None)
            .unwrap();
        let frame = writer.into_vec();
        assert_eq!(&frame[..3], &[32, 2, 0x28]);
        // Second header begins after the first 5-octet record (index + g32v2)
        assert_eq!(&frame[10..13], &[32, 5, 0x28]);
    }
}
