//! Observation clock: the single "now" every generation task agrees on.
//!
//! RULE: Nothing in the generator may read the system time directly.
//! The clock value is computed once at startup (or injected by tests)
//! and carried inside the validated configuration snapshot.

use crate::{
    error::{CohortError, CohortResult},
    types::{Timestamp, SECONDS_PER_DAY},
};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const DATE_LAYOUT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservationClock {
    now: Timestamp,
}

impl ObservationClock {
    /// Read the wall clock once.
    pub fn system() -> Self {
        Self {
            now: Utc::now().timestamp(),
        }
    }

    /// Pin "now" to midnight UTC of the given date.
    pub fn fixed(date: NaiveDate) -> Self {
        Self {
            now: date_to_timestamp(date),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn current_year(&self) -> CohortResult<i32> {
        year_of(self.now)
    }
}

pub fn date_to_timestamp(date: NaiveDate) -> Timestamp {
    date.and_time(NaiveTime::default()).and_utc().timestamp()
}

pub fn parse_date(s: &str) -> Option<Timestamp> {
    NaiveDate::parse_from_str(s.trim(), DATE_LAYOUT)
        .ok()
        .map(date_to_timestamp)
}

fn to_datetime(ts: Timestamp) -> CohortResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts, 0).ok_or(CohortError::DateOutOfRange(ts))
}

/// Calendar year of a timestamp (UTC).
pub fn year_of(ts: Timestamp) -> CohortResult<i32> {
    Ok(to_datetime(ts)?.year())
}

/// ISO-8601 calendar date, e.g. `2019-03-07`.
pub fn format_date(ts: Timestamp) -> CohortResult<String> {
    Ok(to_datetime(ts)?.format(DATE_LAYOUT).to_string())
}

/// `ts` moved forward by whole days; `None` if the result overflows.
pub fn add_days(ts: Timestamp, days: i64) -> Option<Timestamp> {
    days.checked_mul(SECONDS_PER_DAY)
        .and_then(|secs| ts.checked_add(secs))
}
