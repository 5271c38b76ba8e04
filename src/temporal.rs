//! # Temporal Module
//!
//! Validity windows for versioned records.
//! All instants are UTC epoch milliseconds, the native date representation of the feature store.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

/// A temporal instant as UTC epoch milliseconds
pub type Instant = i64;

/// Current wall-clock instant.
pub fn now() -> Instant {
    to_instant(OffsetDateTime::now_utc())
}

/// Convert a UTC date-time to an instant, truncating to milliseconds.
pub fn to_instant(datetime: OffsetDateTime) -> Instant {
    (datetime.unix_timestamp_nanos() / 1_000_000) as Instant
}

/// Convert an instant back to a UTC date-time. Returns None when out of range.
pub fn from_instant(instant: Instant) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(instant as i128 * 1_000_000).ok()
}

/// Parse the textual date forms the feature store hands out or accepts.
///
/// Accepted: RFC 3339, `MM/DD/YYYY HH:MM:SS` and `MM/DD/YYYY` (both UTC).
pub fn parse_instant(raw: &str) -> Option<Instant> {
    let raw = raw.trim();
    if let Ok(datetime) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(to_instant(datetime));
    }
    if let Ok(datetime) = PrimitiveDateTime::parse(
        raw,
        format_description!("[month]/[day]/[year] [hour]:[minute]:[second]"),
    ) {
        return Some(to_instant(datetime.assume_utc()));
    }
    if let Ok(date) = Date::parse(raw, format_description!("[month]/[day]/[year]")) {
        return Some(to_instant(date.midnight().assume_utc()));
    }
    None
}

/// Render an instant in the `MM/DD/YYYY HH:MM:SS` edit form.
pub fn format_instant(instant: Instant) -> Option<String> {
    from_instant(instant)?
        .format(format_description!(
            "[month]/[day]/[year] [hour]:[minute]:[second]"
        ))
        .ok()
}

/// The validity window of a versioned record.
///
/// Either bound may be absent, meaning unbounded on that side.
/// Both bounds are exclusive with respect to "now": a record becomes active strictly after
/// its start and stops being active once its end is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub start: Option<Instant>,
    pub end: Option<Instant>,
}

impl ValidityWindow {
    pub fn new(start: Option<Instant>, end: Option<Instant>) -> Self {
        Self { start, end }
    }

    /// `(start is null or start < at) and (end is null or end > at)`
    pub fn is_active_at(&self, at: Instant) -> bool {
        self.start.map_or(true, |start| start < at) && self.end.map_or(true, |end| end > at)
    }
}

impl fmt::Display for ValidityWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.end) {
            (Some(start), Some(end)) => write!(f, "({start}, {end})"),
            (Some(start), None) => write!(f, "({start}, +inf)"),
            (None, Some(end)) => write!(f, "(-inf, {end})"),
            (None, None) => write!(f, "(-inf, +inf)"),
        }
    }
}
