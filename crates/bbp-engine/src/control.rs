//! Runtime controls of each medium.

use std::fmt;

use crate::config::{
    MAX_CONSOLIDATION_PERIOD, MAX_PERSISTENCE_INTERVAL, MIN_CONSOLIDATION_PERIOD, MIN_PERSISTENCE_INTERVAL,
};

/// Persistence interval in milliseconds.
pub const CONTROL_INTERVAL: &str = "interval";
pub const CONTROL_CONSOLIDATION_PERIOD: &str = "consolidation_period";
/// Archived snapshots to keep; the maximum keeps all of them.
pub const CONTROL_ARCHIVE_COUNT: &str = "archive_count";

pub const MEDIA_CONTROLS: &[&str] = &[CONTROL_INTERVAL, CONTROL_CONSOLIDATION_PERIOD, CONTROL_ARCHIVE_COUNT];

/// Inclusive range of values a control accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlRange {
    pub min: u64,
    pub max: u64,
}

impl ControlRange {
    pub fn contains(&self, value: u64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl fmt::Display for ControlRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

pub fn control_range(control: &str) -> Option<ControlRange> {
    match control {
        CONTROL_INTERVAL => Some(ControlRange {
            min: MIN_PERSISTENCE_INTERVAL.as_millis() as u64,
            max: MAX_PERSISTENCE_INTERVAL.as_millis() as u64,
        }),
        CONTROL_CONSOLIDATION_PERIOD => Some(ControlRange {
            min: u64::from(MIN_CONSOLIDATION_PERIOD),
            max: u64::from(MAX_CONSOLIDATION_PERIOD),
        }),
        CONTROL_ARCHIVE_COUNT => Some(ControlRange {
            min: 0,
            max: u64::from(u32::MAX),
        }),
        _ => None,
    }
}
