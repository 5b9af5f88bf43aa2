//! Canonical timestamps.
//!
//! Every particle timestamp is expressed as seconds since
//! 1900-01-01T00:00:00Z (the NTP epoch). Instrument clocks are converted into
//! this epoch through an explicit, per-instrument [`Epoch`] or calendar
//! conversion; no instrument epoch is ever assumed.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// Seconds between 1900-01-01 and 1970-01-01.
pub const NTP_UNIX_OFFSET_S: f64 = 2_208_988_800.0;
/// Seconds between 1900-01-01 and 1904-01-01.
pub const NTP_MAC_OFFSET_S: f64 = 126_230_400.0;
/// Seconds between 1900-01-01 and 2000-01-01.
pub const NTP_Y2K_OFFSET_S: f64 = 3_155_673_600.0;

/// Instrument clock epochs that counter clocks may be declared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Epoch {
    /// 1900-01-01 (NTP).
    Ntp1900,
    /// 1904-01-01 (classic Mac OS / some SBE firmware).
    Mac1904,
    /// 1970-01-01 (Unix).
    Unix1970,
    /// 2000-01-01.
    Y2k2000,
}

impl Epoch {
    /// Offset of this epoch from the canonical 1900 epoch, in seconds.
    pub fn offset_from_ntp(self) -> f64 {
        match self {
            Epoch::Ntp1900 => 0.0,
            Epoch::Mac1904 => NTP_MAC_OFFSET_S,
            Epoch::Unix1970 => NTP_UNIX_OFFSET_S,
            Epoch::Y2k2000 => NTP_Y2K_OFFSET_S,
        }
    }
}

/// Seconds since 1900-01-01T00:00:00Z.
///
/// # Examples
/// ```
/// use seaparse_core::Timestamp;
///
/// let ts = Timestamp::from_unix_seconds(0.0);
/// assert_eq!(ts.ntp_seconds(), 2_208_988_800.0);
/// assert_eq!(ts.to_rfc3339().as_deref(), Some("1970-01-01T00:00:00Z"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    pub const fn from_ntp_seconds(seconds: f64) -> Self {
        Self(seconds)
    }

    pub fn from_unix_seconds(seconds: f64) -> Self {
        Self(seconds + NTP_UNIX_OFFSET_S)
    }

    /// Convert a counter value expressed against `epoch`.
    pub fn from_epoch_seconds(seconds: f64, epoch: Epoch) -> Self {
        Self(seconds + epoch.offset_from_ntp())
    }

    pub fn ntp_seconds(self) -> f64 {
        self.0
    }

    pub fn unix_seconds(self) -> f64 {
        self.0 - NTP_UNIX_OFFSET_S
    }

    /// Interpret a calendar date/time as UTC.
    pub fn from_datetime(datetime: PrimitiveDateTime) -> Self {
        let utc = datetime.assume_utc();
        let nanos = utc.unix_timestamp_nanos();
        Self::from_unix_seconds(nanos as f64 / 1e9)
    }

    /// Build a timestamp from calendar components, returning `None` when any
    /// component is out of range (e.g. month 13 or second 61).
    pub fn from_calendar(
        year: i32,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        nanos: u32,
    ) -> Option<Self> {
        let month = Month::try_from(month).ok()?;
        let date = Date::from_calendar_date(year, month, day).ok()?;
        let time = Time::from_hms_nano(hour, minute, second, nanos).ok()?;
        Some(Self::from_datetime(PrimitiveDateTime::new(date, time)))
    }

    pub fn to_datetime(self) -> Option<OffsetDateTime> {
        let nanos = (self.unix_seconds() * 1_000_000_000.0).round() as i128;
        OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
    }

    pub fn to_rfc3339(self) -> Option<String> {
        self.to_datetime().and_then(|dt| dt.format(&Rfc3339).ok())
    }

    /// Whole-day index (days since 1900-01-01) containing this instant.
    pub fn day_index(self) -> i64 {
        (self.0 / SECONDS_PER_DAY).floor() as i64
    }
}

pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Start of a UTC calendar day.
pub fn day_start(date: Date) -> Timestamp {
    Timestamp::from_datetime(PrimitiveDateTime::new(date, Time::MIDNIGHT))
}

#[cfg(test)]
mod tests {
    use super::{Epoch, Timestamp, day_start};
    use time::macros::date;

    #[test]
    fn epochs_are_explicit() {
        let zero_mac = Timestamp::from_epoch_seconds(0.0, Epoch::Mac1904);
        assert_eq!(zero_mac.to_rfc3339().as_deref(), Some("1904-01-01T00:00:00Z"));
        let zero_y2k = Timestamp::from_epoch_seconds(0.0, Epoch::Y2k2000);
        assert_eq!(zero_y2k.to_rfc3339().as_deref(), Some("2000-01-01T00:00:00Z"));
    }

    #[test]
    fn calendar_rejects_invalid_components() {
        assert!(Timestamp::from_calendar(2014, 13, 1, 0, 0, 0, 0).is_none());
        assert!(Timestamp::from_calendar(2014, 2, 30, 0, 0, 0, 0).is_none());
        assert!(Timestamp::from_calendar(2014, 2, 28, 24, 0, 0, 0).is_none());
    }

    #[test]
    fn calendar_matches_unix_reference() {
        let ts = Timestamp::from_calendar(2014, 8, 17, 0, 57, 10, 648_000_000).unwrap();
        assert!((ts.unix_seconds() - 1_408_237_030.648).abs() < 1e-6);
    }

    #[test]
    fn day_index_is_stable_at_midnight() {
        let start = day_start(date!(2016 - 10 - 01));
        assert_eq!(start.day_index(), Timestamp::from_ntp_seconds(start.ntp_seconds() + 86_399.9).day_index());
        assert_eq!(start.day_index() + 1, Timestamp::from_ntp_seconds(start.ntp_seconds() + 86_400.0).day_index());
    }
}
