//! DNP3 Outstation Application Layer
//!
//! This module ties the object, event and control machinery into one
//! outstation session: it parses request fragments, decides what bytes go
//! into each response fragment and in what order, and carries the
//! internal-indication (IIN) bits that report session state back to the
//! master.
//!
//! # Overview
//!
//! The application layer handles:
//! - Request fragment parsing (application control octet, function code,
//!   object headers)
//! - Static reads with variation auto-selection and multi-fragment
//!   continuation
//! - Class polls serving queued events, confirmed before deletion
//! - Select / Operate / Direct-Operate control sequencing
//! - Time synchronization and assign-class writes
//! - Internal indications (IIN1/IIN2)
//!
//! # Fragment layout
//!
//! ```text
//! request:  | app control | function | object headers ... |
//! response: | app control | function | IIN1 | IIN2 | objects ... |
//! ```
//!
//! A read that does not fit one fragment parks its state in the session;
//! the transport asks for the rest with
//! [`Outstation::poll_continuation`] until the fragment with `FIN` set has
//! been produced. Re-sending the same request against an unchanged point
//! database yields byte-identical fragments, which is what makes duplicate
//! request replay safe.
//!
//! # Concurrency
//!
//! One [`Outstation`] is one channel. All session state lives behind a
//! single mutex with short critical sections; request processing, the
//! periodic event scan and the select-deadline tick may be driven from
//! different threads. Nothing in here blocks on I/O.

use bitflags::bitflags;

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

#[cfg(feature = "std")]
use std::sync::Mutex;

use log::{debug, trace, warn};

use crate::control::{
    AnalogCommand, CommandStatus, ControlRelayOutputBlock, ControlState,
    GROUP_ANALOG_OUTPUT_COMMAND, GROUP_BINARY_OUTPUT_COMMAND,
};
use crate::encoding::{EncodingError, Reader, ResponseWriter};
use crate::event::{EventBufferConfig, EventBuffers, StreamSelection};
use crate::object::analog::{
    AnalogEventVariation, AnalogOutVariation, AnalogVariation, GROUP_ANALOG_EVENT,
    GROUP_ANALOG_INPUT, GROUP_ANALOG_OUTPUT_STATUS,
};
use crate::object::binary::{
    double_bit_octet, flags_octet, BinaryEventVariation, BinaryVariation, DoubleBitVariation,
    GROUP_BINARY_EVENT, GROUP_BINARY_INPUT, GROUP_BINARY_OUTPUT_STATUS, GROUP_DOUBLE_BIT_EVENT,
    GROUP_DOUBLE_BIT_INPUT,
};
use crate::object::counter::{
    CounterEventVariation, CounterVariation, GROUP_COUNTER, GROUP_COUNTER_EVENT,
};
use crate::object::database::{
    AnalogOutputProvider, AnalogProvider, BinaryOutputProvider, BinaryProvider, CounterProvider,
    DoubleBitProvider, PointProvider,
};
use crate::object::{ClassMask, ObjectHeader, PointRange, Qualifier};
use crate::time::DnpTimestamp;

/// Class poll and assign-class designator objects
pub const GROUP_CLASS: u8 = 60;
/// Absolute time objects (time synchronization writes)
pub const GROUP_TIME: u8 = 50;
/// Internal-indication bit objects (restart clear writes)
pub const GROUP_IIN_BITS: u8 = 80;

/// Octets of app control, function code and IIN in a response fragment
pub const RESPONSE_HEADER_SIZE: usize = 4;

/// Result type for application layer operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, ApplicationError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationError {
    /// Request fragment structurally invalid (bad qualifier shape,
    /// inconsistent pattern mask, unknown control object)
    Truncated,
    /// Underlying wire-format error
    Encoding(EncodingError),
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationError::Truncated => write!(f, "Request fragment truncated"),
            ApplicationError::Encoding(e) => write!(f, "Encoding error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl Error for ApplicationError {}

impl From<EncodingError> for ApplicationError {
    fn from(value: EncodingError) -> Self {
        ApplicationError::Encoding(value)
    }
}

bitflags! {
    /// Internal indications, IIN1 in the low octet and IIN2 in the high
    /// octet; written to the wire low octet first
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Iin: u16 {
        const BROADCAST             = 0x0001;
        const CLASS_1_EVENTS        = 0x0002;
        const CLASS_2_EVENTS        = 0x0004;
        const CLASS_3_EVENTS        = 0x0008;
        const NEED_TIME             = 0x0010;
        const LOCAL_CONTROL         = 0x0020;
        const DEVICE_TROUBLE        = 0x0040;
        const DEVICE_RESTART        = 0x0080;
        const FUNC_NOT_SUPPORTED    = 0x0100;
        const OBJECT_UNKNOWN        = 0x0200;
        const PARAMETER_ERROR       = 0x0400;
        const EVENT_BUFFER_OVERFLOW = 0x0800;
        const ALREADY_EXECUTING     = 0x1000;
        const CONFIG_CORRUPT        = 0x2000;
    }
}

/// Application-layer function codes handled by this outstation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    Confirm = 0,
    Read = 1,
    Write = 2,
    Select = 3,
    Operate = 4,
    DirectOperate = 5,
    DirectOperateNoAck = 6,
    AssignClass = 22,
    Response = 129,
    UnsolicitedResponse = 130,
}

impl TryFrom<u8> for FunctionCode {
    type Error = u8;

    fn try_from(value: u8) -> core::result::Result<Self, u8> {
        match value {
            0 => Ok(FunctionCode::Confirm),
            1 => Ok(FunctionCode::Read),
            2 => Ok(FunctionCode::Write),
            3 => Ok(FunctionCode::Select),
            4 => Ok(FunctionCode::Operate),
            5 => Ok(FunctionCode::DirectOperate),
            6 => Ok(FunctionCode::DirectOperateNoAck),
            22 => Ok(FunctionCode::AssignClass),
            129 => Ok(FunctionCode::Response),
            130 => Ok(FunctionCode::UnsolicitedResponse),
            other => Err(other),
        }
    }
}

/// Application control octet: fragment position flags and sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppControl {
    /// First fragment of a response series
    pub fir: bool,
    /// Final fragment of a response series
    pub fin: bool,
    /// Confirmation requested
    pub con: bool,
    /// Unsolicited response
    pub uns: bool,
    /// Sequence number, 0-15
    pub seq: u8,
}

impl AppControl {
    const FIR: u8 = 0x80;
    const FIN: u8 = 0x40;
    const CON: u8 = 0x20;
    const UNS: u8 = 0x10;

    /// A single-fragment request control octet
    pub fn request(seq: u8) -> Self {
        Self {
            fir: true,
            fin: true,
            con: false,
            uns: false,
            seq: seq & 0x0F,
        }
    }

    /// Decode from the wire octet
    pub fn from_byte(value: u8) -> Self {
        Self {
            fir: value & Self::FIR != 0,
            fin: value & Self::FIN != 0,
            con: value & Self::CON != 0,
            uns: value & Self::UNS != 0,
            seq: value & 0x0F,
        }
    }

    /// Encode to the wire octet
    pub fn to_byte(self) -> u8 {
        let mut value = self.seq & 0x0F;
        if self.fir {
            value |= Self::FIR;
        }
        if self.fin {
            value |= Self::FIN;
        }
        if self.con {
            value |= Self::CON;
        }
        if self.uns {
            value |= Self::UNS;
        }
        value
    }
}

/// Session default variations for static reads (used when a request asks
/// for variation 0)
#[derive(Debug, Clone, Copy)]
pub struct StaticVariations {
    pub binary: BinaryVariation,
    pub double_bit: DoubleBitVariation,
    pub binary_output: BinaryVariation,
    pub counter: CounterVariation,
    pub analog: AnalogVariation,
    pub analog_output: AnalogOutVariation,
}

impl Default for StaticVariations {
    fn default() -> Self {
        Self {
            binary: BinaryVariation::Packed,
            double_bit: DoubleBitVariation::Packed,
            binary_output: BinaryVariation::Packed,
            counter: CounterVariation::Bits32Flags,
            analog: AnalogVariation::I32Flags,
            analog_output: AnalogOutVariation::I32Flags,
        }
    }
}

/// Session default event variations, overridable per point by the provider
#[derive(Debug, Clone, Copy)]
pub struct EventVariations {
    pub binary: BinaryEventVariation,
    pub double_bit: BinaryEventVariation,
    pub counter: CounterEventVariation,
    pub analog: AnalogEventVariation,
}

impl Default for EventVariations {
    fn default() -> Self {
        Self {
            binary: BinaryEventVariation::AbsoluteTime,
            double_bit: BinaryEventVariation::AbsoluteTime,
            counter: CounterEventVariation::Bits32,
            analog: AnalogEventVariation::I32,
        }
    }
}

/// Configuration of one outstation session
#[derive(Debug, Clone)]
pub struct OutstationConfig {
    /// Capacity of one outgoing application-layer fragment
    pub fragment_size: usize,
    /// Milliseconds a select stays armed
    pub select_timeout_ms: u64,
    /// Upper bound on control points in one request
    pub max_controls_per_request: u16,
    /// Whether one request may carry more than one control point
    pub allow_multiple_controls: bool,
    /// Whether unsolicited responses may be produced
    pub unsolicited_enabled: bool,
    pub event_buffers: EventBufferConfig,
    pub static_variations: StaticVariations,
    pub event_variations: EventVariations,
}

impl Default for OutstationConfig {
    fn default() -> Self {
        Self {
            fragment_size: 2048,
            select_timeout_ms: 5_000,
            max_controls_per_request: 16,
            allow_multiple_controls: true,
            unsolicited_enabled: false,
            event_buffers: EventBufferConfig::default(),
            static_variations: StaticVariations::default(),
            event_variations: EventVariations::default(),
        }
    }
}

/// One unit of work expanded from a read request. Class polls expand into
/// several items so continuation can resume mid-sweep.
#[derive(Debug, Clone)]
enum ReadItem {
    Static {
        group: u8,
        variation: u8,
        qualifier: Qualifier,
    },
    Events {
        classes: ClassMask,
        binary: StreamSelection<BinaryEventVariation>,
        double_bit: StreamSelection<BinaryEventVariation>,
        counter: Option<StreamSelection<CounterEventVariation>>,
        analog: Option<StreamSelection<AnalogEventVariation>>,
        binary_first: bool,
    },
}

/// Resumption state of an in-progress multi-fragment read
#[derive(Debug)]
struct ReadJob {
    items: Vec<ReadItem>,
    item_index: usize,
    /// Points already emitted for the current static item
    cursor: u16,
    seq: u8,
}

/// Outcome of emitting one static item into the current fragment
struct StaticEmit {
    consumed: u16,
    more: bool,
    /// Indication bit to raise (parameter error, unknown variation)
    error: Option<Iin>,
}

/// The mutable state of one channel, guarded by the [`Outstation`] mutex
struct Session<D> {
    config: OutstationConfig,
    database: D,
    events: EventBuffers,
    controls: ControlState,
    read_job: Option<ReadJob>,
    /// Latched indications (restart, trouble); transient bits are computed
    /// per response
    latched_iin: Iin,
    time_valid: bool,
    unsolicited_seq: u8,
}

/// One DNP3 outstation channel.
///
/// All mutable session state (event lists, select arms, read cursor) sits
/// behind one mutex, so the request path, the periodic event scan and the
/// select-deadline tick may run from different threads. Critical sections
/// are short and never block on I/O.
#[cfg(feature = "std")]
pub struct Outstation<D> {
    inner: Mutex<Session<D>>,
}

#[cfg(feature = "std")]
impl<D: PointProvider> Outstation<D> {
    /// Create a session over an injected point database
    pub fn new(config: OutstationConfig, database: D) -> Self {
        let events = EventBuffers::new(&config.event_buffers);
        Self {
            inner: Mutex::new(Session {
                config,
                database,
                events,
                controls: ControlState::new(),
                read_job: None,
                latched_iin: Iin::DEVICE_RESTART,
                time_valid: false,
                unsolicited_seq: 0,
            }),
        }
    }

    /// Process one request fragment; returns the response fragment, or
    /// `None` when the function produces no response (confirm,
    /// direct-operate-no-ack).
    pub fn process_fragment(&self, fragment: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().process(fragment, now_ms)
    }

    /// Produce the next fragment of an in-progress read, if one is pending
    pub fn poll_continuation(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().continue_read()
    }

    /// Build an unsolicited response fragment when events are pending and
    /// unsolicited reporting is enabled
    pub fn poll_unsolicited(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().build_unsolicited()
    }

    /// Poll every input point for changes and queue events stamped with
    /// `now` (marked unsynchronized until a time sync arrives)
    pub fn scan_events(&self, now: DnpTimestamp) {
        self.inner.lock().unwrap().scan(now);
    }

    /// Clock tick: expire overdue select arms
    pub fn tick(&self, now_ms: u64) {
        let session = &mut *self.inner.lock().unwrap();
        session.controls.tick(&mut session.database, now_ms);
    }

    /// Unsent events pending in the given classes
    pub fn pending_events(&self, classes: ClassMask) -> usize {
        self.inner.lock().unwrap().events.pending(classes)
    }

    /// Make every queued event eligible again; used when a response went
    /// unconfirmed and the master asked for full retransmission
    pub fn reset_unconfirmed_events(&self) {
        self.inner.lock().unwrap().events.reset_sent();
    }

    /// Explicitly cancel the armed select on a binary output point; a
    /// no-op when the point is not armed
    pub fn cancel_binary_select(&self, point: u16) {
        let session = &mut *self.inner.lock().unwrap();
        session.controls.cancel_crob(&mut session.database, point);
    }

    /// Explicitly cancel the armed select on an analog output point
    pub fn cancel_analog_select(&self, point: u16) {
        let session = &mut *self.inner.lock().unwrap();
        session.controls.cancel_analog(&mut session.database, point);
    }

    /// Run `f` against the point database under the channel lock.
    ///
    /// This is how embedding code feeds measurement updates in; keep the
    /// closure short, it holds up request processing.
    pub fn with_database<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.inner.lock().unwrap().database)
    }
}

impl<D: PointProvider> Session<D> {
    fn process(&mut self, fragment: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        trace!("rx fragment: {}", crate::util::fragment_dump(fragment));
        let mut reader = Reader::new(fragment);
        let control = AppControl::from_byte(reader.read_u8().ok()?);
        let raw_function = reader.read_u8().ok()?;

        let function = match FunctionCode::try_from(raw_function) {
            Ok(f) => f,
            Err(code) => {
                warn!("unsupported function code {}", code);
                return Some(self.empty_response(control.seq, Iin::FUNC_NOT_SUPPORTED));
            }
        };
        trace!("request: {:?} seq {}", function, control.seq);

        match function {
            FunctionCode::Confirm => {
                self.events.confirm();
                None
            }
            FunctionCode::Read => self.handle_read(&mut reader, control),
            FunctionCode::Write => Some(self.handle_write(&mut reader, control)),
            FunctionCode::Select | FunctionCode::Operate | FunctionCode::DirectOperate => {
                Some(self.handle_controls(function, &mut reader, control, now_ms))
            }
            FunctionCode::DirectOperateNoAck => {
                self.handle_controls(function, &mut reader, control, now_ms);
                None
            }
            FunctionCode::AssignClass => Some(self.handle_assign_class(&mut reader, control)),
            FunctionCode::Response | FunctionCode::UnsolicitedResponse => {
                warn!("response function code in a request");
                Some(self.empty_response(control.seq, Iin::FUNC_NOT_SUPPORTED))
            }
        }
    }

    /// The indications current at response-build time
    fn current_iin(&self) -> Iin {
        let mut iin = self.latched_iin;
        if !self.time_valid {
            iin |= Iin::NEED_TIME;
        }
        if self.events.overflowed() {
            iin |= Iin::EVENT_BUFFER_OVERFLOW;
        }
        if self.events.pending(ClassMask::CLASS_1) > 0 {
            iin |= Iin::CLASS_1_EVENTS;
        }
        if self.events.pending(ClassMask::CLASS_2) > 0 {
            iin |= Iin::CLASS_2_EVENTS;
        }
        if self.events.pending(ClassMask::CLASS_3) > 0 {
            iin |= Iin::CLASS_3_EVENTS;
        }
        iin
    }

    /// Start a response fragment; the IIN octets are patched when finished
    fn begin_response(&self, writer: &mut ResponseWriter, control: AppControl) {
        // The fragment capacity always covers the four header octets
        writer
            .write_u8(control.to_byte())
            .expect("fragment capacity");
        writer
            .write_u8(FunctionCode::Response as u8)
            .expect("fragment capacity");
        writer.write_u16_le(0).expect("fragment capacity");
    }

    fn finish_response(&self, mut writer: ResponseWriter, extra_iin: Iin) -> Vec<u8> {
        let iin = self.current_iin() | extra_iin;
        writer
            .patch(2, &iin.bits().to_le_bytes())
            .expect("IIN offset valid");
        writer.into_vec()
    }

    /// A response carrying only indications
    fn empty_response(&self, seq: u8, extra_iin: Iin) -> Vec<u8> {
        let mut writer = ResponseWriter::new(RESPONSE_HEADER_SIZE);
        self.begin_response(
            &mut writer,
            AppControl {
                fir: true,
                fin: true,
                con: false,
                uns: false,
                seq,
            },
        );
        self.finish_response(writer, extra_iin)
    }

    // ------------------------------------------------------------------
    // Read handling
    // ------------------------------------------------------------------

    fn handle_read(&mut self, reader: &mut Reader<'_>, control: AppControl) -> Option<Vec<u8>> {
        let mut items = Vec::new();
        let mut parse_iin = Iin::empty();

        while reader.remaining() > 0 {
            let header = match ObjectHeader::decode(reader) {
                Ok(h) => h,
                Err(e) => {
                    warn!("malformed read header: {}", e);
                    parse_iin |= Iin::PARAMETER_ERROR;
                    break;
                }
            };
            self.expand_read_header(&header, &mut items, &mut parse_iin);
        }

        // A new top-level read resets any in-progress one
        self.read_job = Some(ReadJob {
            items,
            item_index: 0,
            cursor: 0,
            seq: control.seq,
        });

        self.build_read_fragment(true, parse_iin)
    }

    /// Map one request header onto read items, expanding the class objects
    fn expand_read_header(&self, header: &ObjectHeader, items: &mut Vec<ReadItem>, iin: &mut Iin) {
        let all_events = |binary, double_bit, counter, analog| ReadItem::Events {
            classes: ClassMask::all(),
            binary,
            double_bit,
            counter,
            analog,
            binary_first: true,
        };

        match header.group {
            GROUP_CLASS => match header.variation {
                // Class 0: the full static image, group order fixed
                1 => {
                    for group in [
                        GROUP_BINARY_INPUT,
                        GROUP_DOUBLE_BIT_INPUT,
                        GROUP_BINARY_OUTPUT_STATUS,
                        GROUP_COUNTER,
                        GROUP_ANALOG_INPUT,
                        GROUP_ANALOG_OUTPUT_STATUS,
                    ] {
                        items.push(ReadItem::Static {
                            group,
                            variation: 0,
                            qualifier: Qualifier::AllPoints,
                        });
                    }
                }
                v @ 2..=4 => {
                    let class = match v {
                        2 => ClassMask::CLASS_1,
                        3 => ClassMask::CLASS_2,
                        _ => ClassMask::CLASS_3,
                    };
                    items.push(ReadItem::Events {
                        classes: class,
                        binary: StreamSelection::PerEvent,
                        double_bit: StreamSelection::PerEvent,
                        counter: Some(StreamSelection::PerEvent),
                        analog: Some(StreamSelection::PerEvent),
                        binary_first: true,
                    });
                }
                _ => *iin |= Iin::OBJECT_UNKNOWN,
            },
            GROUP_BINARY_INPUT
            | GROUP_DOUBLE_BIT_INPUT
            | GROUP_BINARY_OUTPUT_STATUS
            | GROUP_COUNTER
            | GROUP_ANALOG_INPUT
            | GROUP_ANALOG_OUTPUT_STATUS => items.push(ReadItem::Static {
                group: header.group,
                variation: header.variation,
                qualifier: header.qualifier.clone(),
            }),
            GROUP_BINARY_EVENT => {
                match variation_selection(header.variation, |v| {
                    BinaryEventVariation::from_request(v, self.config.event_variations.binary)
                }) {
                    Some(selection) => {
                        items.push(all_events(selection, StreamSelection::Skip, None, None))
                    }
                    None => *iin |= Iin::OBJECT_UNKNOWN,
                }
            }
            GROUP_DOUBLE_BIT_EVENT => {
                match variation_selection(header.variation, |v| {
                    BinaryEventVariation::from_request(v, self.config.event_variations.double_bit)
                }) {
                    Some(selection) => {
                        items.push(all_events(StreamSelection::Skip, selection, None, None))
                    }
                    None => *iin |= Iin::OBJECT_UNKNOWN,
                }
            }
            GROUP_COUNTER_EVENT => {
                match variation_selection(header.variation, |v| {
                    CounterEventVariation::from_request(v, self.config.event_variations.counter)
                }) {
                    Some(selection) => items.push(all_events(
                        StreamSelection::Skip,
                        StreamSelection::Skip,
                        Some(selection),
                        None,
                    )),
                    None => *iin |= Iin::OBJECT_UNKNOWN,
                }
            }
            GROUP_ANALOG_EVENT => {
                match variation_selection(header.variation, |v| {
                    AnalogEventVariation::from_request(v, self.config.event_variations.analog)
                }) {
                    Some(selection) => items.push(all_events(
                        StreamSelection::Skip,
                        StreamSelection::Skip,
                        None,
                        Some(selection),
                    )),
                    None => *iin |= Iin::OBJECT_UNKNOWN,
                }
            }
            other => {
                debug!("read of unknown group {}", other);
                *iin |= Iin::OBJECT_UNKNOWN;
            }
        }
    }

    /// Produce the next fragment of the pending read job
    fn continue_read(&mut self) -> Option<Vec<u8>> {
        self.read_job.as_ref()?;
        self.build_read_fragment(false, Iin::empty())
    }

    fn build_read_fragment(&mut self, first: bool, extra_iin: Iin) -> Option<Vec<u8>> {
        let mut job = self.read_job.take()?;
        let mut writer = ResponseWriter::new(self.config.fragment_size);
        let seq = if first { job.seq } else { (job.seq + 1) & 0x0F };
        job.seq = seq;

        self.begin_response(
            &mut writer,
            AppControl {
                fir: first,
                fin: true,
                con: false,
                uns: false,
                seq,
            },
        );

        let mut param_iin = extra_iin;
        let mut more = false;
        let mut wrote_events = false;

        while job.item_index < job.items.len() {
            let item = job.items[job.item_index].clone();
            match item {
                ReadItem::Static {
                    group,
                    variation,
                    qualifier,
                } => {
                    let emit =
                        self.emit_static(&mut writer, group, variation, &qualifier, job.cursor);
                    if let Some(bit) = emit.error {
                        param_iin |= bit;
                    }
                    job.cursor += emit.consumed;
                    if emit.more {
                        more = true;
                        break;
                    }
                    job.item_index += 1;
                    job.cursor = 0;
                }
                ReadItem::Events {
                    classes,
                    binary,
                    double_bit,
                    counter,
                    analog,
                    binary_first,
                } => {
                    let before = writer.len();
                    let mut item_more = false;
                    if binary != StreamSelection::Skip || double_bit != StreamSelection::Skip {
                        item_more |= self
                            .events
                            .write_binary_events(
                                &mut writer,
                                classes,
                                binary,
                                double_bit,
                                binary_first,
                            )
                            .ok()?;
                    }
                    if let Some(selection) = counter {
                        let forced = match selection {
                            StreamSelection::Forced(v) => Some(v),
                            _ => None,
                        };
                        item_more |= self
                            .events
                            .write_counter_events(&mut writer, classes, forced)
                            .ok()?;
                    }
                    if let Some(selection) = analog {
                        let forced = match selection {
                            StreamSelection::Forced(v) => Some(v),
                            _ => None,
                        };
                        item_more |= self
                            .events
                            .write_analog_events(&mut writer, classes, forced)
                            .ok()?;
                    }
                    wrote_events |= writer.len() > before;
                    if item_more {
                        more = true;
                        break;
                    }
                    job.item_index += 1;
                    job.cursor = 0;
                }
            }
        }

        if more && writer.len() == RESPONSE_HEADER_SIZE {
            // The fragment cannot make progress: not even one point fits.
            // Distinct from "more data"; the read is abandoned.
            warn!(
                "fragment of {} octets cannot hold a single point",
                self.config.fragment_size
            );
            return Some(self.empty_response(seq, param_iin | Iin::PARAMETER_ERROR));
        }

        // Patch FIR/FIN/CON now that the fragment content is known
        let control = AppControl {
            fir: first,
            fin: !more,
            con: wrote_events || more,
            uns: false,
            seq,
        };
        writer.patch(0, &[control.to_byte()]).expect("control offset");

        if more {
            self.read_job = Some(job);
        }
        Some(self.finish_response(writer, param_iin))
    }

    /// Emit one static item starting at `cursor`, dispatching on group
    fn emit_static(
        &mut self,
        writer: &mut ResponseWriter,
        group: u8,
        variation: u8,
        qualifier: &Qualifier,
        cursor: u16,
    ) -> StaticEmit {
        let strict = matches!(
            qualifier,
            Qualifier::Range8 { .. }
                | Qualifier::Range16 { .. }
                | Qualifier::Index8(_)
                | Qualifier::Index16(_)
        );

        macro_rules! resolve_range {
            ($quantity:expr) => {
                match qualifier.resolve($quantity) {
                    Ok(range) => range,
                    Err(_) => {
                        return StaticEmit {
                            consumed: 0,
                            more: false,
                            error: Some(Iin::PARAMETER_ERROR),
                        }
                    }
                }
            };
        }

        match group {
            GROUP_BINARY_INPUT => {
                let Some(initial) =
                    BinaryVariation::from_request(variation, self.config.static_variations.binary)
                else {
                    return unknown_variation();
                };
                let range = resolve_range!(BinaryProvider::quantity(&self.database));
                let db = &self.database;
                emit_packed_or_flags(
                    writer,
                    group,
                    &range,
                    cursor,
                    strict,
                    initial,
                    1,
                    |i| BinaryProvider::read(db, i),
                    |p| p.flags.is_nominal(),
                    |p| p.value as u8,
                    |p| flags_octet(p.value, p.flags),
                )
            }
            GROUP_DOUBLE_BIT_INPUT => {
                let Some(initial) = DoubleBitVariation::from_request(
                    variation,
                    self.config.static_variations.double_bit,
                ) else {
                    return unknown_variation();
                };
                // The double-bit variations mirror the single-bit ones;
                // reuse the packed emitter with two bits per point
                let initial = match initial {
                    DoubleBitVariation::Packed => BinaryVariation::Packed,
                    DoubleBitVariation::WithFlags => BinaryVariation::WithFlags,
                };
                let range = resolve_range!(DoubleBitProvider::quantity(&self.database));
                let db = &self.database;
                emit_packed_or_flags(
                    writer,
                    group,
                    &range,
                    cursor,
                    strict,
                    initial,
                    2,
                    |i| DoubleBitProvider::read(db, i),
                    |p| p.flags.is_nominal(),
                    |p| p.value as u8,
                    |p| double_bit_octet(p.value, p.flags),
                )
            }
            GROUP_BINARY_OUTPUT_STATUS => {
                let Some(initial) = BinaryVariation::from_request(
                    variation,
                    self.config.static_variations.binary_output,
                ) else {
                    return unknown_variation();
                };
                let range = resolve_range!(BinaryOutputProvider::quantity(&self.database));
                let db = &self.database;
                emit_packed_or_flags(
                    writer,
                    group,
                    &range,
                    cursor,
                    strict,
                    initial,
                    1,
                    |i| BinaryOutputProvider::read(db, i),
                    |p| p.flags.is_nominal(),
                    |p| p.value as u8,
                    |p| flags_octet(p.value, p.flags),
                )
            }
            GROUP_COUNTER => {
                let Some(initial) =
                    CounterVariation::from_request(variation, self.config.static_variations.counter)
                else {
                    return unknown_variation();
                };
                let range = resolve_range!(CounterProvider::quantity(&self.database));
                let db = &self.database;
                emit_byte_static(
                    writer,
                    group,
                    &range,
                    cursor,
                    strict,
                    initial,
                    |i| CounterProvider::read(db, i),
                    |v, p| v.required_for(p),
                    |v| v.size(),
                    |v| v.wire_variation(),
                    |v, p, w| v.encode(p, w),
                )
            }
            GROUP_ANALOG_INPUT => {
                let Some(initial) =
                    AnalogVariation::from_request(variation, self.config.static_variations.analog)
                else {
                    return unknown_variation();
                };
                let range = resolve_range!(AnalogProvider::quantity(&self.database));
                let db = &self.database;
                emit_byte_static(
                    writer,
                    group,
                    &range,
                    cursor,
                    strict,
                    initial,
                    |i| AnalogProvider::read(db, i),
                    |v, p| v.required_for(p),
                    |v| v.size(),
                    |v| v.wire_variation(),
                    |v, p, w| v.encode(p, w),
                )
            }
            GROUP_ANALOG_OUTPUT_STATUS => {
                let Some(initial) = AnalogOutVariation::from_request(
                    variation,
                    self.config.static_variations.analog_output,
                ) else {
                    return unknown_variation();
                };
                let range = resolve_range!(AnalogOutputProvider::quantity(&self.database));
                let db = &self.database;
                emit_byte_static(
                    writer,
                    group,
                    &range,
                    cursor,
                    strict,
                    initial,
                    |i| AnalogOutputProvider::read(db, i),
                    |v, _| v,
                    |v| v.size(),
                    |v| v.wire_variation(),
                    |v, p, w| v.encode(p, w),
                )
            }
            _ => unknown_variation(),
        }
    }

    // ------------------------------------------------------------------
    // Write handling (time sync, restart-bit clear)
    // ------------------------------------------------------------------

    fn handle_write(&mut self, reader: &mut Reader<'_>, control: AppControl) -> Vec<u8> {
        let mut iin = Iin::empty();

        while reader.remaining() > 0 {
            let header = match ObjectHeader::decode(reader) {
                Ok(h) => h,
                Err(e) => {
                    warn!("malformed write header: {}", e);
                    iin |= Iin::PARAMETER_ERROR;
                    break;
                }
            };
            match (header.group, header.variation) {
                (GROUP_TIME, 1) => {
                    if let Err(bad) = self.write_time(&header, reader) {
                        iin |= bad;
                        break;
                    }
                }
                (GROUP_IIN_BITS, 1) => {
                    if let Err(bad) = self.write_iin_bits(&header, reader) {
                        iin |= bad;
                        break;
                    }
                }
                (group, variation) => {
                    debug!("write of unsupported object g{}v{}", group, variation);
                    iin |= Iin::OBJECT_UNKNOWN;
                    break;
                }
            }
        }

        self.empty_response(control.seq, iin)
    }

    fn write_time(
        &mut self,
        header: &ObjectHeader,
        reader: &mut Reader<'_>,
    ) -> core::result::Result<(), Iin> {
        let count = match header.qualifier {
            Qualifier::Count8(n) => n as u16,
            Qualifier::Count16(n) => n,
            _ => return Err(Iin::PARAMETER_ERROR),
        };
        if count != 1 {
            return Err(Iin::PARAMETER_ERROR);
        }
        let bytes = reader.read_bytes(6).map_err(|_| Iin::PARAMETER_ERROR)?;
        let mut wire = [0u8; 6];
        wire.copy_from_slice(bytes);
        let timestamp = DnpTimestamp::from_wire_bytes(&wire);
        debug!("time synchronized to {}", timestamp);
        self.time_valid = true;
        Ok(())
    }

    fn write_iin_bits(
        &mut self,
        header: &ObjectHeader,
        reader: &mut Reader<'_>,
    ) -> core::result::Result<(), Iin> {
        let (start, stop) = match header.qualifier {
            Qualifier::Range8 { start, stop } => (start as u16, stop as u16),
            Qualifier::Range16 { start, stop } => (start, stop),
            _ => return Err(Iin::PARAMETER_ERROR),
        };
        let octets = ((stop - start + 1) as usize).div_ceil(8);
        let bits = reader.read_bytes(octets).map_err(|_| Iin::PARAMETER_ERROR)?;

        // Writing 0 to indication index 7 acknowledges the restart
        for index in start..=stop {
            let offset = (index - start) as usize;
            let bit = bits[offset / 8] & (1 << (offset % 8)) != 0;
            if index == 7 && !bit {
                debug!("device restart indication cleared");
                self.latched_iin.remove(Iin::DEVICE_RESTART);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Assign class
    // ------------------------------------------------------------------

    fn handle_assign_class(&mut self, reader: &mut Reader<'_>, control: AppControl) -> Vec<u8> {
        let mut iin = Iin::empty();
        let mut current_class: Option<ClassMask> = None;

        while reader.remaining() > 0 {
            let header = match ObjectHeader::decode(reader) {
                Ok(h) => h,
                Err(e) => {
                    warn!("malformed assign-class header: {}", e);
                    iin |= Iin::PARAMETER_ERROR;
                    break;
                }
            };
            if header.group == GROUP_CLASS {
                current_class = match header.variation {
                    1 => Some(ClassMask::empty()),
                    2 => Some(ClassMask::CLASS_1),
                    3 => Some(ClassMask::CLASS_2),
                    4 => Some(ClassMask::CLASS_3),
                    _ => {
                        iin |= Iin::OBJECT_UNKNOWN;
                        None
                    }
                };
                continue;
            }
            let Some(class) = current_class else {
                // Data header before any class designator
                iin |= Iin::PARAMETER_ERROR;
                break;
            };
            if !self.assign_class_to_group(header.group, &header.qualifier, class) {
                iin |= Iin::PARAMETER_ERROR;
            }
        }

        self.empty_response(control.seq, iin)
    }

    fn assign_class_to_group(
        &mut self,
        group: u8,
        qualifier: &Qualifier,
        class: ClassMask,
    ) -> bool {
        macro_rules! assign {
            ($trait_name:ident) => {{
                let quantity = $trait_name::quantity(&self.database);
                let Ok(range) = qualifier.resolve(quantity) else {
                    return false;
                };
                let mut ok = true;
                for position in 0..range.len() {
                    let point = range.point_at(position).expect("position in range");
                    ok &= $trait_name::assign_class(&mut self.database, point, class);
                }
                ok
            }};
        }

        match group {
            GROUP_BINARY_INPUT | GROUP_BINARY_EVENT => assign!(BinaryProvider),
            GROUP_DOUBLE_BIT_INPUT | GROUP_DOUBLE_BIT_EVENT => assign!(DoubleBitProvider),
            GROUP_COUNTER | GROUP_COUNTER_EVENT => assign!(CounterProvider),
            GROUP_ANALOG_INPUT | GROUP_ANALOG_EVENT => assign!(AnalogProvider),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------

    fn handle_controls(
        &mut self,
        function: FunctionCode,
        reader: &mut Reader<'_>,
        control: AppControl,
        now_ms: u64,
    ) -> Vec<u8> {
        let items = match parse_control_items(reader) {
            Ok(items) => items,
            Err(_) => {
                warn!("malformed control request");
                return self.empty_response(control.seq, Iin::PARAMETER_ERROR);
            }
        };

        let total_points: usize = items.iter().map(ControlItem::point_count).sum();
        let over_limit = total_points > self.config.max_controls_per_request as usize
            || (!self.config.allow_multiple_controls && total_points > 1);
        if over_limit {
            debug!("control request with {} points rejected", total_points);
        }

        let mut response_iin = Iin::empty();
        let mut writer = ResponseWriter::new(self.config.fragment_size);
        self.begin_response(
            &mut writer,
            AppControl {
                fir: true,
                fin: true,
                con: false,
                uns: false,
                seq: control.seq,
            },
        );

        // The echo must fit before any point is touched
        let echo_size: usize = items.iter().map(ControlItem::echo_size).sum();
        if echo_size > writer.remaining_capacity() {
            warn!("control echo of {} octets exceeds fragment", echo_size);
            return self.empty_response(control.seq, Iin::PARAMETER_ERROR);
        }

        for item in items {
            match item {
                ControlItem::Crob { wide, points } => {
                    let statuses: Vec<(u16, ControlRelayOutputBlock, CommandStatus)> = points
                        .into_iter()
                        .map(|(point, crob)| {
                            let status = if over_limit {
                                CommandStatus::TooManyOps
                            } else {
                                self.dispatch_crob(function, point, crob, now_ms)
                            };
                            response_iin |= status_iin(status);
                            (point, crob, status)
                        })
                        .collect();
                    // Echo size was validated up front
                    let _ = echo_crob_header(&mut writer, wide, &statuses);
                }
                ControlItem::Analog {
                    wide,
                    variation,
                    points,
                } => {
                    let statuses: Vec<(u16, AnalogCommand, CommandStatus)> = points
                        .into_iter()
                        .map(|(point, command)| {
                            let status = if over_limit {
                                CommandStatus::TooManyOps
                            } else {
                                self.dispatch_analog(function, point, command, now_ms)
                            };
                            response_iin |= status_iin(status);
                            (point, command, status)
                        })
                        .collect();
                    let _ = echo_analog_header(&mut writer, wide, variation, &statuses);
                }
                ControlItem::Pattern {
                    wide,
                    start,
                    stop,
                    crob,
                    mask,
                } => {
                    let status = if over_limit {
                        CommandStatus::TooManyOps
                    } else {
                        self.dispatch_pattern(function, start, stop, crob, &mask, now_ms)
                    };
                    response_iin |= status_iin(status);
                    let _ = echo_pattern(&mut writer, wide, start, stop, crob, &mask, status);
                }
            }
        }

        self.finish_response(writer, response_iin)
    }

    fn dispatch_crob(
        &mut self,
        function: FunctionCode,
        point: u16,
        crob: ControlRelayOutputBlock,
        now_ms: u64,
    ) -> CommandStatus {
        if point >= BinaryOutputProvider::quantity(&self.database) {
            return CommandStatus::OutOfRange;
        }
        match function {
            FunctionCode::Select => self.controls.select_crob(
                &mut self.database,
                point,
                crob,
                now_ms,
                self.config.select_timeout_ms,
            ),
            FunctionCode::Operate => {
                self.controls
                    .operate_crob(&mut self.database, point, crob, now_ms)
            }
            _ => self
                .controls
                .direct_operate_crob(&mut self.database, point, crob),
        }
    }

    fn dispatch_analog(
        &mut self,
        function: FunctionCode,
        point: u16,
        command: AnalogCommand,
        now_ms: u64,
    ) -> CommandStatus {
        if point >= AnalogOutputProvider::quantity(&self.database) {
            return CommandStatus::OutOfRange;
        }
        match function {
            FunctionCode::Select => self.controls.select_analog(
                &mut self.database,
                point,
                command,
                now_ms,
                self.config.select_timeout_ms,
            ),
            FunctionCode::Operate => {
                self.controls
                    .operate_analog(&mut self.database, point, command, now_ms)
            }
            _ => self
                .controls
                .direct_operate_analog(&mut self.database, point, command),
        }
    }

    fn dispatch_pattern(
        &mut self,
        function: FunctionCode,
        start: u16,
        stop: u16,
        crob: ControlRelayOutputBlock,
        mask: &[u8],
        now_ms: u64,
    ) -> CommandStatus {
        match function {
            FunctionCode::Select => self.controls.select_pattern(
                &mut self.database,
                start,
                stop,
                crob,
                mask,
                now_ms,
                self.config.select_timeout_ms,
            ),
            FunctionCode::Operate => {
                self.controls
                    .operate_pattern(&mut self.database, start, stop, crob, mask, now_ms)
            }
            _ => {
                // Direct-operate applies the pattern unconditionally
                let mut aggregate = CommandStatus::Success;
                for point in start..=stop {
                    let offset = (point - start) as usize;
                    let selected = mask
                        .get(offset / 8)
                        .is_some_and(|byte| byte & (1 << (offset % 8)) != 0);
                    if selected {
                        let status =
                            BinaryOutputProvider::operate(&mut self.database, point, &crob);
                        if status != CommandStatus::Success && aggregate == CommandStatus::Success {
                            aggregate = status;
                        }
                    }
                }
                aggregate
            }
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Poll all input points for changes and queue the resulting events
    fn scan(&mut self, now: DnpTimestamp) {
        let timestamp = now.with_validity(self.time_valid);

        for point in 0..BinaryProvider::quantity(&self.database) {
            if let Some(meas) = BinaryProvider::changed(&mut self.database, point) {
                let class = BinaryProvider::event_class(&self.database, point);
                let variation = per_point_variation(
                    BinaryProvider::event_variation(&self.database, point),
                    self.config.event_variations.binary,
                    BinaryEventVariation::from_request,
                );
                self.events
                    .record_binary(point, meas, class, timestamp, variation);
            }
        }
        for point in 0..DoubleBitProvider::quantity(&self.database) {
            if let Some(meas) = DoubleBitProvider::changed(&mut self.database, point) {
                let class = DoubleBitProvider::event_class(&self.database, point);
                let variation = per_point_variation(
                    DoubleBitProvider::event_variation(&self.database, point),
                    self.config.event_variations.double_bit,
                    BinaryEventVariation::from_request,
                );
                self.events
                    .record_double_bit(point, meas, class, timestamp, variation);
            }
        }
        for point in 0..CounterProvider::quantity(&self.database) {
            if let Some(meas) = CounterProvider::changed(&mut self.database, point) {
                let class = CounterProvider::event_class(&self.database, point);
                let variation = per_point_variation(
                    CounterProvider::event_variation(&self.database, point),
                    self.config.event_variations.counter,
                    CounterEventVariation::from_request,
                );
                self.events
                    .record_counter(point, meas, class, timestamp, variation);
            }
        }
        for point in 0..AnalogProvider::quantity(&self.database) {
            if let Some(meas) = AnalogProvider::changed(&mut self.database, point) {
                let class = AnalogProvider::event_class(&self.database, point);
                let variation = per_point_variation(
                    AnalogProvider::event_variation(&self.database, point),
                    self.config.event_variations.analog,
                    AnalogEventVariation::from_request,
                );
                self.events
                    .record_analog(point, meas, class, timestamp, variation);
            }
        }
    }

    /// Build an unsolicited response when events are pending
    fn build_unsolicited(&mut self) -> Option<Vec<u8>> {
        if !self.config.unsolicited_enabled || self.events.pending(ClassMask::all()) == 0 {
            return None;
        }
        self.unsolicited_seq = (self.unsolicited_seq + 1) & 0x0F;
        let mut writer = ResponseWriter::new(self.config.fragment_size);
        let control = AppControl {
            fir: true,
            fin: true,
            con: true,
            uns: true,
            seq: self.unsolicited_seq,
        };
        writer.write_u8(control.to_byte()).ok()?;
        writer
            .write_u8(FunctionCode::UnsolicitedResponse as u8)
            .ok()?;
        writer.write_u16_le(0).ok()?;

        self.events
            .write_binary_events(
                &mut writer,
                ClassMask::all(),
                StreamSelection::PerEvent,
                StreamSelection::PerEvent,
                true,
            )
            .ok()?;
        self.events
            .write_counter_events(&mut writer, ClassMask::all(), None)
            .ok()?;
        self.events
            .write_analog_events(&mut writer, ClassMask::all(), None)
            .ok()?;

        Some(self.finish_response(writer, Iin::empty()))
    }
}

/// Resolve a per-point variation override against the session default
fn per_point_variation<V: Copy>(
    configured: Option<u8>,
    default: V,
    from_request: impl Fn(u8, V) -> Option<V>,
) -> V {
    configured
        .and_then(|v| from_request(v, default))
        .unwrap_or(default)
}

/// Map a requested event variation number to a stream selection
fn variation_selection<V: Copy>(
    variation: u8,
    from_request: impl Fn(u8) -> Option<V>,
) -> Option<StreamSelection<V>> {
    if variation == 0 {
        return Some(StreamSelection::PerEvent);
    }
    from_request(variation).map(StreamSelection::Forced)
}

fn unknown_variation() -> StaticEmit {
    StaticEmit {
        consumed: 0,
        more: false,
        error: Some(Iin::OBJECT_UNKNOWN),
    }
}

/// Map command statuses onto session-wide indications
fn status_iin(status: CommandStatus) -> Iin {
    match status {
        CommandStatus::AlreadyActive => Iin::ALREADY_EXECUTING,
        CommandStatus::Local => Iin::LOCAL_CONTROL,
        _ => Iin::empty(),
    }
}

// ----------------------------------------------------------------------
// Static emission helpers
// ----------------------------------------------------------------------

/// Open response header for a contiguous (start/stop) object
struct RangeHeader {
    wide: bool,
    stop_offset: usize,
    last: u16,
}

impl RangeHeader {
    fn open(
        writer: &mut ResponseWriter,
        group: u8,
        variation: u8,
        wide: bool,
        first_point: u16,
    ) -> crate::encoding::Result<Self> {
        writer.write_u8(group)?;
        writer.write_u8(variation)?;
        if wide {
            writer.write_u8(0x01)?;
            writer.write_u16_le(first_point)?;
        } else {
            writer.write_u8(0x00)?;
            writer.write_u8(first_point as u8)?;
        }
        let stop_offset = writer.position();
        if wide {
            writer.write_u16_le(first_point)?;
        } else {
            writer.write_u8(first_point as u8)?;
        }
        Ok(Self {
            wide,
            stop_offset,
            last: first_point,
        })
    }

    fn size(wide: bool) -> usize {
        if wide {
            7
        } else {
            5
        }
    }

    fn close(&self, writer: &mut ResponseWriter) -> crate::encoding::Result<()> {
        if self.wide {
            writer.patch(self.stop_offset, &self.last.to_le_bytes())
        } else {
            writer.patch(self.stop_offset, &[self.last as u8])
        }
    }
}

/// Open response header for an index-qualified (0x28) object
struct IndexHeader {
    count_offset: usize,
    count: u16,
}

impl IndexHeader {
    const SIZE: usize = 5;

    fn open(
        writer: &mut ResponseWriter,
        group: u8,
        variation: u8,
    ) -> crate::encoding::Result<Self> {
        writer.write_u8(group)?;
        writer.write_u8(variation)?;
        writer.write_u8(0x28)?;
        let count_offset = writer.position();
        writer.write_u16_le(0)?;
        Ok(Self {
            count_offset,
            count: 0,
        })
    }

    fn close(&self, writer: &mut ResponseWriter) -> crate::encoding::Result<()> {
        writer.patch(self.count_offset, &self.count.to_le_bytes())
    }
}

enum OpenStatic {
    Range(RangeHeader),
    Index(IndexHeader),
}

impl OpenStatic {
    fn close(&self, writer: &mut ResponseWriter) -> crate::encoding::Result<()> {
        match self {
            OpenStatic::Range(h) => h.close(writer),
            OpenStatic::Index(h) => h.close(writer),
        }
    }
}

/// Emit a static object whose points encode to whole octets (counters,
/// analogs). Handles variation promotion, disabled-point gaps and
/// fragment-capacity continuation.
#[allow(clippy::too_many_arguments)]
fn emit_byte_static<T, V>(
    writer: &mut ResponseWriter,
    group: u8,
    range: &PointRange,
    cursor: u16,
    strict: bool,
    initial: V,
    read: impl Fn(u16) -> Option<T>,
    required_for: impl Fn(V, &T) -> V,
    size_of: impl Fn(V) -> usize,
    wire_var: impl Fn(V) -> u8,
    encode: impl Fn(V, &T, &mut ResponseWriter) -> crate::encoding::Result<()>,
) -> StaticEmit
where
    V: Copy + PartialEq,
{
    let explicit = range.is_explicit();
    let wide = range_is_wide(range);
    let mut header: Option<OpenStatic> = None;
    let mut variation = initial;
    let mut position = cursor as usize;
    let mut consumed = 0u16;

    let close = |header: &mut Option<OpenStatic>, writer: &mut ResponseWriter| {
        if let Some(h) = header.take() {
            // Patching an open header never fails
            let _ = h.close(writer);
        }
    };

    while let Some(point) = range.point_at(position) {
        let Some(value) = read(point) else {
            if strict {
                close(&mut header, writer);
                return StaticEmit {
                    consumed,
                    more: false,
                    error: Some(Iin::PARAMETER_ERROR),
                };
            }
            // A gap in an all-points sweep: skip the point, split the range
            close(&mut header, writer);
            position += 1;
            consumed += 1;
            continue;
        };

        let needed = required_for(variation, &value);
        if needed != variation {
            close(&mut header, writer);
            variation = needed;
        }

        let header_cost = if header.is_none() {
            if explicit {
                IndexHeader::SIZE
            } else {
                RangeHeader::size(wide)
            }
        } else {
            0
        };
        let index_cost = if explicit { 2 } else { 0 };
        if header_cost + index_cost + size_of(variation) > writer.remaining_capacity() {
            close(&mut header, writer);
            return StaticEmit {
                consumed,
                more: true,
                error: None,
            };
        }

        if header.is_none() {
            // Capacity verified above; open cannot fail
            let opened = if explicit {
                IndexHeader::open(writer, group, wire_var(variation)).map(OpenStatic::Index)
            } else {
                RangeHeader::open(writer, group, wire_var(variation), wide, point)
                    .map(OpenStatic::Range)
            };
            header = opened.ok();
        }

        if explicit {
            let _ = writer.write_u16_le(point);
        }
        let _ = encode(variation, &value, writer);
        match header.as_mut() {
            Some(OpenStatic::Range(h)) => h.last = point,
            Some(OpenStatic::Index(h)) => h.count += 1,
            None => {}
        }
        position += 1;
        consumed += 1;
    }

    close(&mut header, writer);
    StaticEmit {
        consumed,
        more: false,
        error: None,
    }
}

/// Emit a static object for the single-bit and double-bit groups, where the
/// packed variation shares octets between points and promotes to the
/// flags-octet variation on the first non-nominal point.
#[allow(clippy::too_many_arguments)]
fn emit_packed_or_flags<T>(
    writer: &mut ResponseWriter,
    group: u8,
    range: &PointRange,
    cursor: u16,
    strict: bool,
    initial: BinaryVariation,
    bits_per_point: u8,
    read: impl Fn(u16) -> Option<T>,
    nominal: impl Fn(&T) -> bool,
    state_bits: impl Fn(&T) -> u8,
    flags_octet_of: impl Fn(&T) -> u8,
) -> StaticEmit {
    let explicit = range.is_explicit();
    let wide = range_is_wide(range);
    let points_per_octet = (8 / bits_per_point) as usize;
    let mut header: Option<OpenStatic> = None;
    let mut variation = initial;
    let mut position = cursor as usize;
    let mut consumed = 0u16;
    // Packed-encoding state: the octet being filled and how many points it
    // already holds
    let mut packed_offset: usize = 0;
    let mut packed_used: usize = 0;
    let mut packed_octet: u8 = 0;

    let close =
        |header: &mut Option<OpenStatic>, writer: &mut ResponseWriter, packed_used: &mut usize| {
            if let Some(h) = header.take() {
                let _ = h.close(writer);
            }
            *packed_used = 0;
        };

    while let Some(point) = range.point_at(position) {
        let Some(value) = read(point) else {
            if strict {
                close(&mut header, writer, &mut packed_used);
                return StaticEmit {
                    consumed,
                    more: false,
                    error: Some(Iin::PARAMETER_ERROR),
                };
            }
            close(&mut header, writer, &mut packed_used);
            position += 1;
            consumed += 1;
            continue;
        };

        if variation == BinaryVariation::Packed && !nominal(&value) {
            // Promote for the rest of the sweep; already-written packed
            // points stay in their closed header
            close(&mut header, writer, &mut packed_used);
            variation = BinaryVariation::WithFlags;
        }

        let header_cost = if header.is_none() {
            if explicit {
                IndexHeader::SIZE
            } else {
                RangeHeader::size(wide)
            }
        } else {
            0
        };
        let index_cost = if explicit { 2 } else { 0 };
        // Packed points only need a fresh octet at an octet boundary;
        // explicit indices restart the bit offset every point
        let data_cost = match variation {
            BinaryVariation::WithFlags => 1,
            BinaryVariation::Packed => {
                if explicit || packed_used == 0 || header.is_none() {
                    1
                } else {
                    0
                }
            }
        };
        if header_cost + index_cost + data_cost > writer.remaining_capacity() {
            close(&mut header, writer, &mut packed_used);
            return StaticEmit {
                consumed,
                more: true,
                error: None,
            };
        }

        if header.is_none() {
            let opened = if explicit {
                IndexHeader::open(writer, group, variation.wire_variation()).map(OpenStatic::Index)
            } else {
                RangeHeader::open(writer, group, variation.wire_variation(), wide, point)
                    .map(OpenStatic::Range)
            };
            header = opened.ok();
            packed_used = 0;
        }

        if explicit {
            let _ = writer.write_u16_le(point);
        }
        match variation {
            BinaryVariation::WithFlags => {
                let _ = writer.write_u8(flags_octet_of(&value));
            }
            BinaryVariation::Packed => {
                if explicit || packed_used == 0 {
                    packed_offset = writer.position();
                    packed_octet = 0;
                    packed_used = 0;
                    let _ = writer.write_u8(0);
                }
                let shift = (packed_used * bits_per_point as usize) as u8;
                packed_octet |= state_bits(&value) << shift;
                let _ = writer.patch(packed_offset, &[packed_octet]);
                packed_used = (packed_used + 1) % points_per_octet;
                if explicit {
                    packed_used = 0;
                }
            }
        }
        match header.as_mut() {
            Some(OpenStatic::Range(h)) => h.last = point,
            Some(OpenStatic::Index(h)) => h.count += 1,
            None => {}
        }
        position += 1;
        consumed += 1;
    }

    close(&mut header, writer, &mut packed_used);
    StaticEmit {
        consumed,
        more: false,
        error: None,
    }
}

/// True when the range needs 16-bit start/stop octets
fn range_is_wide(range: &PointRange) -> bool {
    match range {
        PointRange::Contiguous { start, count } => {
            *count > 0 && (*start as u32 + *count as u32 - 1) > 0xFF
        }
        PointRange::Explicit(_) => true,
    }
}

// ----------------------------------------------------------------------
// Control request parsing and echo
// ----------------------------------------------------------------------

#[derive(Debug)]
enum ControlItem {
    Crob {
        wide: bool,
        points: Vec<(u16, ControlRelayOutputBlock)>,
    },
    Analog {
        wide: bool,
        variation: u8,
        points: Vec<(u16, AnalogCommand)>,
    },
    Pattern {
        wide: bool,
        start: u16,
        stop: u16,
        crob: ControlRelayOutputBlock,
        mask: Vec<u8>,
    },
}

impl ControlItem {
    fn point_count(&self) -> usize {
        match self {
            ControlItem::Crob { points, .. } => points.len(),
            ControlItem::Analog { points, .. } => points.len(),
            ControlItem::Pattern {
                start, stop, mask, ..
            } => (*start..=*stop)
                .filter(|point| {
                    let offset = (point - start) as usize;
                    mask.get(offset / 8)
                        .is_some_and(|byte| byte & (1 << (offset % 8)) != 0)
                })
                .count(),
        }
    }

    /// Octets this item occupies in the echoed response
    fn echo_size(&self) -> usize {
        match self {
            ControlItem::Crob { wide, points } => {
                let (prefix, index) = if *wide { (5, 2) } else { (4, 1) };
                prefix + points.len() * (index + ControlRelayOutputBlock::WIRE_SIZE)
            }
            ControlItem::Analog { wide, points, .. } => {
                let (prefix, index) = if *wide { (5, 2) } else { (4, 1) };
                let payload: usize = points.iter().map(|(_, c)| c.wire_size()).sum();
                prefix + points.len() * index + payload
            }
            ControlItem::Pattern { wide, mask, .. } => {
                // PCB object + mask object
                (4 + ControlRelayOutputBlock::WIRE_SIZE)
                    + (3 + if *wide { 4 } else { 2 })
                    + mask.len()
            }
        }
    }
}

/// Parse the object headers of a control request. Control payloads are
/// interleaved with their point indices, so this cannot reuse the
/// read-style header decoding.
fn parse_control_items(reader: &mut Reader<'_>) -> Result<Vec<ControlItem>> {
    let mut items = Vec::new();

    while reader.remaining() > 0 {
        let group = reader.read_u8()?;
        let variation = reader.read_u8()?;
        let qualifier = reader.read_u8()?;

        match (group, variation) {
            (GROUP_BINARY_OUTPUT_COMMAND, 1) => {
                let (wide, count) = read_index_count(reader, qualifier)?;
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    let index = read_index(reader, wide)?;
                    let (crob, _) = ControlRelayOutputBlock::decode(reader)?;
                    points.push((index, crob));
                }
                items.push(ControlItem::Crob { wide, points });
            }
            (GROUP_BINARY_OUTPUT_COMMAND, 2) => {
                // Pattern Control Block: exactly one object, then the mask
                let count = match qualifier {
                    0x07 => reader.read_u8()? as u16,
                    0x08 => reader.read_u16_le()?,
                    _ => return Err(ApplicationError::Truncated),
                };
                if count != 1 {
                    return Err(ApplicationError::Truncated);
                }
                let (crob, _) = ControlRelayOutputBlock::decode(reader)?;

                let mask_group = reader.read_u8()?;
                let mask_variation = reader.read_u8()?;
                let mask_qualifier = reader.read_u8()?;
                if mask_group != GROUP_BINARY_OUTPUT_COMMAND || mask_variation != 3 {
                    return Err(ApplicationError::Truncated);
                }
                let (wide, start, stop) = match mask_qualifier {
                    0x00 => {
                        let start = reader.read_u8()?;
                        let stop = reader.read_u8()?;
                        (false, start as u16, stop as u16)
                    }
                    0x01 => {
                        let start = reader.read_u16_le()?;
                        let stop = reader.read_u16_le()?;
                        (true, start, stop)
                    }
                    _ => return Err(ApplicationError::Truncated),
                };
                if start > stop {
                    return Err(ApplicationError::Truncated);
                }
                let octets = ((stop - start + 1) as usize).div_ceil(8);
                let mask = reader.read_bytes(octets)?.to_vec();
                items.push(ControlItem::Pattern {
                    wide,
                    start,
                    stop,
                    crob,
                    mask,
                });
            }
            (GROUP_ANALOG_OUTPUT_COMMAND, v @ 1..=4) => {
                let (wide, count) = read_index_count(reader, qualifier)?;
                let mut points = Vec::with_capacity(count);
                for _ in 0..count {
                    let index = read_index(reader, wide)?;
                    let (command, _) = AnalogCommand::decode(v, reader)?;
                    points.push((index, command));
                }
                items.push(ControlItem::Analog {
                    wide,
                    variation: v,
                    points,
                });
            }
            _ => return Err(ApplicationError::Truncated),
        }
    }

    Ok(items)
}

fn read_index_count(reader: &mut Reader<'_>, qualifier: u8) -> Result<(bool, usize)> {
    match qualifier {
        0x17 => {
            let count = reader.read_u8()?;
            Ok((false, count as usize))
        }
        0x28 => {
            let count = reader.read_u16_le()?;
            Ok((true, count as usize))
        }
        _ => Err(ApplicationError::Truncated),
    }
}

fn read_index(reader: &mut Reader<'_>, wide: bool) -> Result<u16> {
    if wide {
        Ok(reader.read_u16_le()?)
    } else {
        Ok(reader.read_u8()? as u16)
    }
}

fn echo_crob_header(
    writer: &mut ResponseWriter,
    wide: bool,
    points: &[(u16, ControlRelayOutputBlock, CommandStatus)],
) -> crate::encoding::Result<()> {
    writer.write_u8(GROUP_BINARY_OUTPUT_COMMAND)?;
    writer.write_u8(1)?;
    if wide {
        writer.write_u8(0x28)?;
        writer.write_u16_le(points.len() as u16)?;
    } else {
        writer.write_u8(0x17)?;
        writer.write_u8(points.len() as u8)?;
    }
    for (index, crob, status) in points {
        if wide {
            writer.write_u16_le(*index)?;
        } else {
            writer.write_u8(*index as u8)?;
        }
        crob.encode(*status, writer)?;
    }
    Ok(())
}

fn echo_analog_header(
    writer: &mut ResponseWriter,
    wide: bool,
    variation: u8,
    points: &[(u16, AnalogCommand, CommandStatus)],
) -> crate::encoding::Result<()> {
    writer.write_u8(GROUP_ANALOG_OUTPUT_COMMAND)?;
    writer.write_u8(variation)?;
    if wide {
        writer.write_u8(0x28)?;
        writer.write_u16_le(points.len() as u16)?;
    } else {
        writer.write_u8(0x17)?;
        writer.write_u8(points.len() as u8)?;
    }
    for (index, command, status) in points {
        if wide {
            writer.write_u16_le(*index)?;
        } else {
            writer.write_u8(*index as u8)?;
        }
        command.encode(*status, writer)?;
    }
    Ok(())
}

fn echo_pattern(
    writer: &mut ResponseWriter,
    wide: bool,
    start: u16,
    stop: u16,
    crob: ControlRelayOutputBlock,
    mask: &[u8],
    status: CommandStatus,
) -> crate::encoding::Result<()> {
    writer.write_u8(GROUP_BINARY_OUTPUT_COMMAND)?;
    writer.write_u8(2)?;
    writer.write_u8(0x07)?;
    writer.write_u8(1)?;
    crob.encode(status, writer)?;

    writer.write_u8(GROUP_BINARY_OUTPUT_COMMAND)?;
    writer.write_u8(3)?;
    if wide {
        writer.write_u8(0x01)?;
        writer.write_u16_le(start)?;
        writer.write_u16_le(stop)?;
    } else {
        writer.write_u8(0x00)?;
        writer.write_u8(start as u8)?;
        writer.write_u8(stop as u8)?;
    }
    writer.append(mask)
}
