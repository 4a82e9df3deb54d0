//! DNP3 Time Representation Module
//!
//! This module implements the 48-bit time format used throughout the DNP3
//! application layer: milliseconds since 1970-01-01 00:00:00 UTC, carried as
//! six octets least-significant first. The same value is held internally as a
//! 32-bit most-significant / 16-bit least-significant pair.
//!
//! # Overview
//!
//! The time module is responsible for:
//! - Converting calendar time to and from the 48-bit wire format
//! - The leap-year approximation valid for the 1970-2099 device lifetime
//! - Carry/borrow arithmetic on timestamps without overflow traps
//! - Tracking clock validity (an outstation that has never been time-synced
//!   reports its timestamps as unsynchronized rather than failing)
//!
//! Conversions never return errors. A calendar time outside the supported
//! range produces a timestamp with the `invalid` flag set, mirroring the
//! over-range philosophy used for analog values elsewhere in the stack.

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(feature = "std")]
use chrono::{Datelike, Timelike, Utc};

/// Mask for the 48 bits a DNP3 timestamp can carry
pub const TIMESTAMP_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Milliseconds in one minute, the precision window of the compressed
/// event-time encoding
pub const MILLIS_PER_MINUTE: u64 = 60_000;

/// Last calendar year for which the every-four-years leap rule holds
pub const MAX_YEAR: u16 = 2099;

const DAYS_PER_MONTH: [u16; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// A 48-bit DNP3 timestamp.
///
/// The value is milliseconds since the 1970 epoch, stored as the upper 32
/// and lower 16 bits. `invalid` marks a clock that has not been synchronized;
/// it travels with the value and selects between the synchronized and
/// unsynchronized variations of the time objects on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DnpTimestamp {
    /// Upper 32 bits of the millisecond count
    pub most_significant: u32,
    /// Lower 16 bits of the millisecond count
    pub least_significant: u16,
    /// Clock-not-synchronized flag
    pub invalid: bool,
}

/// Calendar-time dual representation of a [`DnpTimestamp`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalendarTime {
    pub year: u16,
    /// 1-12
    pub month: u8,
    /// 1-31
    pub day: u8,
    /// 0-23
    pub hour: u8,
    /// 0-59
    pub minute: u8,
    /// 0-59
    pub second: u8,
    /// 0-999
    pub millisecond: u16,
    /// 1 = Monday .. 7 = Sunday
    pub day_of_week: u8,
    /// Daylight-saving marker, carried but never computed here
    pub dst: bool,
}

impl DnpTimestamp {
    /// The zero timestamp with the clock marked unsynchronized
    pub const fn unsynchronized() -> Self {
        Self {
            most_significant: 0,
            least_significant: 0,
            invalid: true,
        }
    }

    /// Build a synchronized timestamp from a millisecond count.
    ///
    /// Values above the 48-bit limit wrap, as all arithmetic here does.
    pub fn from_millis(millis: u64) -> Self {
        let millis = millis & TIMESTAMP_MASK;
        Self {
            most_significant: (millis >> 16) as u32,
            least_significant: millis as u16,
            invalid: false,
        }
    }

    /// The millisecond count carried by this timestamp
    pub fn millis(&self) -> u64 {
        ((self.most_significant as u64) << 16) | self.least_significant as u64
    }

    /// True if the clock behind this timestamp has been synchronized
    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    /// Return a copy with the validity flag replaced
    pub fn with_validity(self, valid: bool) -> Self {
        Self {
            invalid: !valid,
            ..self
        }
    }

    /// The six wire octets, least-significant first
    pub fn to_wire_bytes(&self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&self.millis().to_le_bytes()[..6]);
        bytes
    }

    /// Rebuild a synchronized timestamp from its six wire octets
    pub fn from_wire_bytes(bytes: &[u8; 6]) -> Self {
        let mut buf = [0u8; 8];
        buf[..6].copy_from_slice(bytes);
        Self::from_millis(u64::from_le_bytes(buf))
    }

    /// Convert calendar time to a timestamp.
    ///
    /// Out-of-range input (a year before 1970 or after 2099, or a field
    /// beyond its calendar limit) yields the zero timestamp with `invalid`
    /// set instead of an error.
    pub fn from_calendar(cal: &CalendarTime) -> Self {
        if cal.year < 1970
            || cal.year > MAX_YEAR
            || cal.month < 1
            || cal.month > 12
            || cal.day < 1
            || cal.day as u16 > days_in_month(cal.year, cal.month)
            || cal.hour > 23
            || cal.minute > 59
            || cal.second > 59
            || cal.millisecond > 999
        {
            return Self::unsynchronized();
        }

        let days = days_to_year(cal.year) + day_of_year(cal.year, cal.month, cal.day);
        let minutes = days * 1440 + cal.hour as u64 * 60 + cal.minute as u64;
        let ms_in_minute = cal.second as u64 * 1000 + cal.millisecond as u64;
        Self::from_millis(minutes * MILLIS_PER_MINUTE + ms_in_minute)
    }

    /// Convert a timestamp to calendar time.
    ///
    /// Minute, hour and day fall out of integer division; the year is
    /// recovered by decrementing an over-estimate until its day count no
    /// longer exceeds the actual day count. The loop floor is 1970, so no
    /// 48-bit input can spin it.
    pub fn to_calendar(&self) -> CalendarTime {
        let total = self.millis();
        let ms_in_minute = total % MILLIS_PER_MINUTE;
        let total_minutes = total / MILLIS_PER_MINUTE;
        let minute = (total_minutes % 60) as u8;
        let total_hours = total_minutes / 60;
        let hour = (total_hours % 24) as u8;
        let days = total_hours / 24;

        let mut year = 1970 + (days / 365) as u16;
        while year > 1970 && days_to_year(year) > days {
            year -= 1;
        }
        let mut remaining = (days - days_to_year(year)) as u16;

        let mut month = 1u8;
        loop {
            let in_month = days_in_month(year, month);
            if remaining < in_month {
                break;
            }
            remaining -= in_month;
            month += 1;
        }

        CalendarTime {
            year,
            month,
            day: (remaining + 1) as u8,
            hour,
            minute,
            second: (ms_in_minute / 1000) as u8,
            millisecond: (ms_in_minute % 1000) as u16,
            // 1970-01-01 was a Thursday
            day_of_week: ((days + 3) % 7) as u8 + 1,
            dst: false,
        }
    }

    /// Add a millisecond offset, wrapping at the 48-bit limit.
    ///
    /// The validity flag of `self` is preserved.
    pub fn add_millis(&self, millis: u64) -> Self {
        let sum = Self::from_millis(self.millis().wrapping_add(millis));
        Self {
            invalid: self.invalid,
            ..sum
        }
    }

    /// Difference `self - other` in wrapped 48-bit milliseconds.
    ///
    /// The result is valid only when both operands are.
    pub fn sub(&self, other: &Self) -> Self {
        let diff = Self::from_millis(self.millis().wrapping_sub(other.millis()));
        Self {
            invalid: self.invalid || other.invalid,
            ..diff
        }
    }

    /// The current UTC time as a synchronized timestamp
    #[cfg(feature = "std")]
    pub fn now() -> Self {
        let now = Utc::now();
        let cal = CalendarTime {
            year: now.year() as u16,
            month: now.month() as u8,
            day: now.day() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
            millisecond: (now.timestamp_subsec_millis() % 1000) as u16,
            day_of_week: now.weekday().number_from_monday() as u8,
            dst: false,
        };
        Self::from_calendar(&cal)
    }
}

impl fmt::Display for DnpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cal = self.to_calendar();
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}{}",
            cal.year,
            cal.month,
            cal.day,
            cal.hour,
            cal.minute,
            cal.second,
            cal.millisecond,
            if self.invalid { " (unsynchronized)" } else { "" }
        )
    }
}

/// Days from the 1970 epoch to January 1st of `year`, using the
/// every-four-years leap rule. Not exact past 2099.
fn days_to_year(year: u16) -> u64 {
    let y = year as u64;
    (y - 1970) * 365 + (y - 1969) / 4
}

fn is_leap_year(year: u16) -> bool {
    year % 4 == 0
}

fn days_in_month(year: u16, month: u8) -> u16 {
    if month == 2 && is_leap_year(year) {
        29
    } else {
        DAYS_PER_MONTH[(month - 1) as usize]
    }
}

/// Zero-based day of year for a calendar date
fn day_of_year(year: u16, month: u8, day: u8) -> u64 {
    let mut days = 0u64;
    for m in 1..month {
        days += days_in_month(year, m) as u64;
    }
    days + (day as u64 - 1)
}
