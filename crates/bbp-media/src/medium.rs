//! The storage medium contract.

use std::io::{Read, Write};
use std::time::Duration;

use bbp_types::{DataProtectionKey, SequenceNumbers};

use crate::config::{MediumConfig, DEFAULT_CONSOLIDATION_PERIOD, DEFAULT_PERSISTENCE_INTERVAL};
use crate::error::Result;

/// Output stream for one delta.
///
/// Bytes written are not part of the medium until [`close`](Self::close)
/// returns and the medium's `finish_output_stream` commits them.
pub trait DeltaSink: Write + Send {
    /// Flush everything and make it durable.
    fn close(self: Box<Self>) -> std::io::Result<()>;
}

/// Tunables every medium carries, adjustable at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediumSettings {
    pub name: String,
    pub persistence_interval: Duration,
    pub consolidation_period: u32,
    pub writable: bool,
    /// Archived full snapshots to keep; `None` keeps all.
    pub archive_count: Option<u32>,
}

impl MediumSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persistence_interval: DEFAULT_PERSISTENCE_INTERVAL,
            consolidation_period: DEFAULT_CONSOLIDATION_PERIOD,
            writable: true,
            archive_count: None,
        }
    }

    /// Settings from a medium config, falling back to engine-wide defaults.
    pub fn from_config(config: &MediumConfig, interval: Duration, consolidation: u32) -> Self {
        Self {
            name: config.name.clone(),
            persistence_interval: config.persistence_interval.unwrap_or(interval),
            consolidation_period: config.consolidation_period.unwrap_or(consolidation),
            writable: config.writable,
            archive_count: config.archive_count,
        }
    }
}

/// A place deltas are written to and read back from.
///
/// Deltas are numbered; a medium tracks which contiguous range of numbers
/// is currently valid through [`SequenceNumbers`], and optionally keeps
/// archived full snapshots outside that range.
pub trait StorageMedium: Send {
    fn settings(&self) -> &MediumSettings;

    fn settings_mut(&mut self) -> &mut MediumSettings;

    fn name(&self) -> &str {
        &self.settings().name
    }

    fn persistence_interval(&self) -> Duration {
        self.settings().persistence_interval
    }

    fn consolidation_period(&self) -> u32 {
        self.settings().consolidation_period
    }

    fn is_writable(&self) -> bool {
        self.settings().writable
    }

    fn archive_count(&self) -> Option<u32> {
        self.settings().archive_count
    }

    /// Candidate ranges to rehydrate from. An empty suffix lists the live
    /// range and every archive; `_NNNNN` selects one archive.
    fn read_sequence_numbers(&mut self, suffix: &str) -> Result<Vec<SequenceNumbers>>;

    /// Start writing delta `delta`.
    fn open_output_stream(&mut self, delta: u32, full: bool) -> Result<Box<dyn DeltaSink>>;

    /// Commit the delta most recently opened; `retain` is the new valid range.
    fn finish_output_stream(&mut self, retain: &SequenceNumbers, full: bool) -> Result<()>;

    /// Discard the uncommitted delta `retain.current`.
    fn abort_output_stream(&mut self, retain: &SequenceNumbers) -> Result<()>;

    fn open_input_stream(&mut self, delta: u32) -> Result<Box<dyn Read + Send>>;

    fn finish_input_stream(&mut self, _delta: u32) -> Result<()> {
        Ok(())
    }

    /// Delete deltas `[old.first, old.current)`.
    fn cleanup_old_deltas(&mut self, old: &SequenceNumbers) -> Result<()>;

    /// Delete the oldest archives beyond the archive count. The archive of
    /// the `live` range is never deleted.
    fn cleanup_archive(&mut self, live: &SequenceNumbers) -> Result<()>;

    /// Whether this instance still owns the medium.
    fn check_ownership(&mut self) -> Result<bool>;

    fn lock_ownership(&mut self) -> Result<()>;

    fn unlock_ownership(&mut self) -> Result<()>;

    fn store_data_protection_key(&mut self, delta: u32, key: &DataProtectionKey) -> Result<()>;

    fn retrieve_data_protection_key(&mut self, delta: u32) -> Result<DataProtectionKey>;

    /// Remove every persisted delta of this agent.
    fn delete_all(&mut self) -> Result<()>;
}

/// Pick the archives to drop: oldest first, keeping `keep`, never `protected`.
pub(crate) fn excess_archives(mut archives: Vec<SequenceNumbers>, keep: u32, protected: u32) -> Vec<SequenceNumbers> {
    archives.retain(|a| a.first != protected);
    archives.sort();
    let excess = archives.len().saturating_sub(keep as usize);
    archives.truncate(excess);
    archives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_engine_defaults() {
        let mut c = MediumConfig::file("P", "/tmp");
        let s = MediumSettings::from_config(&c, Duration::from_secs(9), 4);
        assert_eq!(s.persistence_interval, Duration::from_secs(9));
        assert_eq!(s.consolidation_period, 4);
        c.consolidation_period = Some(2);
        c.persistence_interval = Some(Duration::from_secs(1));
        let s = MediumSettings::from_config(&c, Duration::from_secs(9), 4);
        assert_eq!(s.persistence_interval, Duration::from_secs(1));
        assert_eq!(s.consolidation_period, 2);
    }

    #[test]
    fn excess_archives_oldest_first() {
        let archives = vec![
            SequenceNumbers::new(20, 21, 300),
            SequenceNumbers::new(1, 2, 100),
            SequenceNumbers::new(10, 11, 200),
            SequenceNumbers::new(30, 31, 400),
        ];
        let drop = excess_archives(archives.clone(), 2, 30);
        assert_eq!(drop, vec![SequenceNumbers::new(1, 2, 100)]);
        assert!(excess_archives(archives.clone(), 10, 0).is_empty());
        assert_eq!(excess_archives(archives, 0, 30).len(), 3);
    }
}
