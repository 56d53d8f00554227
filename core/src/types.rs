//! Shared primitive types used across the entire generator.

/// Seconds since the Unix epoch, UTC. All dates are carried this way
/// internally and only formatted at the record boundary.
pub type Timestamp = i64;

/// A cohort member identifier. Allocated by the dispatcher, never reused.
pub type MemberId = i64;

/// The canonical run identifier.
pub type RunId = String;

pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
pub const DAYS_PER_YEAR: i64 = 365;
