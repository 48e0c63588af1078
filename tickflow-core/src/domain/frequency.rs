//! Sampling granularity of bars.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Bar sampling period. Larger windows compare greater.
///
/// `Trade` is the tick-level sentinel for unaggregated events and is numerically negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Trade,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Frequency {
    /// Numeric value in seconds (`-1` for `Trade`).
    pub fn seconds(self) -> i64 {
        match self {
            Frequency::Trade => -1,
            Frequency::Second => 1,
            Frequency::Minute => 60,
            Frequency::Hour => 60 * 60,
            Frequency::Day => 24 * 60 * 60,
            Frequency::Week => 24 * 60 * 60 * 7,
            Frequency::Month => 24 * 60 * 60 * 31,
        }
    }

    pub fn is_intraday(self) -> bool {
        self < Frequency::Day
    }

    /// Start of the slot containing `dt`.
    ///
    /// Weeks start on Monday, months on the first day. `Trade` slots are the instant itself.
    pub fn slot_start(self, dt: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Frequency::Trade => dt,
            Frequency::Week => {
                let date = dt.date_naive()
                    - chrono::Duration::days(dt.weekday().num_days_from_monday() as i64);
                Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
            }
            Frequency::Month => {
                let date = dt.date_naive().with_day(1).unwrap_or(dt.date_naive());
                Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
            }
            _ => {
                let secs = self.seconds();
                let ts = dt.timestamp();
                let start = ts - ts.rem_euclid(secs);
                Utc.timestamp_opt(start, 0).single().unwrap_or(dt)
            }
        }
    }
}
