//! MS-DOS date/time packing used by ZIP headers.
//!
//! date = ((year - 1980) << 9) | (month << 5) | day
//! time = (hour << 11) | (minute << 5) | (second / 2)
//!
//! Timestamps are interpreted as UTC.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

/// Packed DOS timestamp as written into headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub date: u16,
    pub time: u16,
}

impl DosDateTime {
    /// 1980-01-01 00:00:00, the earliest representable instant
    pub const EPOCH: DosDateTime = DosDateTime {
        date: (1 << 5) | 1,
        time: 0,
    };

    /// Pack a timestamp. Anything before 1980 clamps to [`DosDateTime::EPOCH`].
    pub fn from_datetime(ts: &DateTime<Utc>) -> Self {
        let year = ts.year();
        if year < 1980 {
            return Self::EPOCH;
        }
        // seven bits of year: 2107 is the last representable one
        let year = year.min(2107) as u16;
        let date = ((year - 1980) << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
        let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() as u16 / 2);
        Self { date, time }
    }

    /// Unpack into a timestamp. A zero or impossible date yields `None`.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if self.date == 0 {
            return None;
        }
        let year = ((self.date >> 9) & 0x7f) as i32 + 1980;
        let month = ((self.date >> 5) & 0x0f) as u32;
        let day = (self.date & 0x1f) as u32;
        let hour = ((self.time >> 11) & 0x1f) as u32;
        let minute = ((self.time >> 5) & 0x3f) as u32;
        let second = (self.time & 0x1f) as u32 * 2;

        let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
        Some(Utc.from_utc_datetime(&naive))
    }
}
