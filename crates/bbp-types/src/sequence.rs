use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Width of the zero-padded number in delta names (`delta_00001`).
pub const DELTA_DIGITS: usize = 5;

/// A contiguous range `[first, current)` of valid delta numbers on one
/// medium, plus the wall-clock time (millis since epoch) of its newest delta.
///
/// `first` is always a full delta; everything after it up to `current - 1`
/// is incremental. `current` is the number the next delta will receive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceNumbers {
    pub first: u32,
    pub current: u32,
    pub timestamp: i64,
}

impl SequenceNumbers {
    pub fn new(first: u32, current: u32, timestamp: i64) -> Self {
        Self { first, current, timestamp }
    }

    /// Number of deltas in the range.
    pub fn len(&self) -> u32 {
        self.current.saturating_sub(self.first)
    }

    pub fn is_empty(&self) -> bool {
        self.current <= self.first
    }

    /// Whether `delta` falls inside `[first, current)`.
    pub fn contains(&self, delta: u32) -> bool {
        delta >= self.first && delta < self.current
    }

    /// Delta numbers in ascending order.
    pub fn deltas(&self) -> impl Iterator<Item = u32> {
        self.first..self.current
    }

    /// Archive suffix naming this range's full snapshot (`_00005`).
    pub fn archive_suffix(&self) -> String {
        format_delta_number(self.first)
    }
}

impl Ord for SequenceNumbers {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.current.cmp(&other.current))
            .then(self.first.cmp(&other.first))
    }
}

impl PartialOrd for SequenceNumbers {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}) @ {}", self.first, self.current, self.timestamp)
    }
}

/// `_` followed by the zero-padded delta number.
pub fn format_delta_number(n: u32) -> String {
    format!("_{n:0width$}", width = DELTA_DIGITS)
}

/// Inverse of [`format_delta_number`]. Accepts any digit count after `_`.
pub fn parse_delta_suffix(suffix: &str) -> Result<u32, TypeError> {
    let digits = suffix
        .strip_prefix('_')
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| TypeError::InvalidDeltaSuffix(suffix.to_string()))?;
    digits
        .parse()
        .map_err(|_| TypeError::InvalidDeltaSuffix(suffix.to_string()))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
