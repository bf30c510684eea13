//! Reading and writing of the stored `duration` field.
//!
//! Records written before [DURATION_CUTOVER_MS] stored minutes, later ones store seconds. Every
//! consumer goes through [Seconds] so the heuristic lives in exactly one place.

use chrono::Duration;

use super::entities::{RawDuration, Record};

/// Epoch milliseconds of the switch from minutes to seconds (2025-01-01T00:00:00Z).
pub const DURATION_CUTOVER_MS: i64 = 1_735_689_600_000;

/// Largest raw value still read as minutes for pre-cutover records. Anything above would be more
/// than 60 hours, which is taken as already being seconds.
const LEGACY_MINUTES_CEILING: f64 = 3600.;

/// Canonical duration of a record in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Seconds(u64);

impl Seconds {
    pub const fn new(seconds: u64) -> Self {
        Self(seconds)
    }

    /// Resolves a raw stored value. Never fails: negative or malformed values read as 0.
    pub fn decode(id: i64, raw: RawDuration) -> Self {
        let value = raw.value();
        if !value.is_finite() || value <= 0. {
            return Self(0);
        }
        let seconds = if id > DURATION_CUTOVER_MS || value > LEGACY_MINUTES_CEILING {
            value
        } else {
            value * 60.
        };
        Self(seconds.round() as u64)
    }

    pub fn of(record: &Record) -> Self {
        Self::decode(record.id, record.duration)
    }

    /// Produces the raw value that [Seconds::decode] maps back to `self` for a record with this
    /// `id`. Pre-cutover records keep their minutes encoding unless the value is large enough to
    /// be read as seconds anyway.
    pub fn encode_for(self, id: i64) -> RawDuration {
        let seconds = self.0 as f64;
        if id > DURATION_CUTOVER_MS || seconds > LEGACY_MINUTES_CEILING {
            RawDuration::new(seconds)
        } else {
            RawDuration::new(seconds / 60.)
        }
    }

    /// Whole seconds elapsed between two epoch-millisecond instants, at least one.
    pub fn elapsed_between(start_ms: i64, end_ms: i64) -> Self {
        let elapsed = end_ms.saturating_sub(start_ms).max(0) / 1000;
        Self((elapsed as u64).max(1))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn as_millis(self) -> i64 {
        i64::try_from(self.0.saturating_mul(1000)).unwrap_or(i64::MAX)
    }

    pub fn as_duration(self) -> Duration {
        Duration::milliseconds(self.as_millis())
    }
}
