// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Contains the implementation of `DateTime`.

use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, Sub},
};

use chrono::{Duration, TimeZone, Utc};

pub type DateTimeUtc = chrono::DateTime<Utc>;

/// A date/time value. This is a wrapper around the chrono type, used for publish times and
/// value timestamps.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateTime {
    date_time: DateTimeUtc,
}

impl Default for DateTime {
    fn default() -> Self {
        DateTime::epoch()
    }
}

impl Add<Duration> for DateTime {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        DateTime::from(self.date_time + duration)
    }
}

impl Sub<DateTime> for DateTime {
    type Output = Duration;

    fn sub(self, other: Self) -> Duration {
        self.date_time - other.date_time
    }
}

impl Sub<Duration> for DateTime {
    type Output = Self;

    fn sub(self, duration: Duration) -> Self {
        DateTime::from(self.date_time - duration)
    }
}

impl PartialOrd for DateTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DateTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date_time.cmp(&other.date_time)
    }
}

impl From<DateTimeUtc> for DateTime {
    fn from(date_time: DateTimeUtc) -> Self {
        DateTime { date_time }
    }
}

impl From<DateTime> for DateTimeUtc {
    fn from(date_time: DateTime) -> Self {
        date_time.date_time
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.date_time.to_rfc3339())
    }
}

impl DateTime {
    /// Constructs from the current time
    pub fn now() -> DateTime {
        DateTime::from(Utc::now())
    }

    /// Constructs from the current time with an offset
    pub fn now_with_offset(offset: Duration) -> DateTime {
        DateTime::from(Utc::now() + offset)
    }

    /// The OPC UA epoch, Jan 1 1601, used as the null timestamp
    pub fn epoch() -> DateTime {
        DateTime::from(
            Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
        )
    }

    /// Tests if the date time is the null timestamp
    pub fn is_null(&self) -> bool {
        *self == DateTime::epoch()
    }
}

#[test]
fn date_time_ordering() {
    let a = DateTime::now();
    let b = a + Duration::milliseconds(10);
    assert!(b > a);
    assert_eq!(b - a, Duration::milliseconds(10));
    assert!(DateTime::default().is_null());
    assert!(!a.is_null());
}
