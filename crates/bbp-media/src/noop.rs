//! A medium that stores nothing.
//!
//! The engine keeps one of these when no real medium is configured, so that
//! persistence scheduling behaves the same with or without storage.

use std::io::{self, Read, Write};

use bbp_types::{DataProtectionKey, SequenceNumbers};
use tracing::trace;

use crate::error::{MediaError, Result};
use crate::medium::{DeltaSink, MediumSettings, StorageMedium};

#[derive(Debug)]
pub struct NoOpMedium {
    settings: MediumSettings,
}

impl NoOpMedium {
    pub fn new(settings: MediumSettings) -> Self {
        Self { settings }
    }
}

struct Discard;

impl Write for Discard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DeltaSink for Discard {
    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

impl StorageMedium for NoOpMedium {
    fn settings(&self) -> &MediumSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MediumSettings {
        &mut self.settings
    }

    fn read_sequence_numbers(&mut self, _suffix: &str) -> Result<Vec<SequenceNumbers>> {
        Ok(Vec::new())
    }

    fn open_output_stream(&mut self, delta: u32, _full: bool) -> Result<Box<dyn DeltaSink>> {
        trace!(medium = %self.settings.name, delta, "discarding delta");
        Ok(Box::new(Discard))
    }

    fn finish_output_stream(&mut self, _retain: &SequenceNumbers, _full: bool) -> Result<()> {
        Ok(())
    }

    fn abort_output_stream(&mut self, _retain: &SequenceNumbers) -> Result<()> {
        Ok(())
    }

    fn open_input_stream(&mut self, delta: u32) -> Result<Box<dyn Read + Send>> {
        Err(MediaError::DeltaNotFound(delta))
    }

    fn cleanup_old_deltas(&mut self, _old: &SequenceNumbers) -> Result<()> {
        Ok(())
    }

    fn cleanup_archive(&mut self, _live: &SequenceNumbers) -> Result<()> {
        Ok(())
    }

    fn check_ownership(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn lock_ownership(&mut self) -> Result<()> {
        Ok(())
    }

    fn unlock_ownership(&mut self) -> Result<()> {
        Ok(())
    }

    fn store_data_protection_key(&mut self, _delta: u32, _key: &DataProtectionKey) -> Result<()> {
        Err(MediaError::Unsupported("data protection keys"))
    }

    fn retrieve_data_protection_key(&mut self, delta: u32) -> Result<DataProtectionKey> {
        Err(MediaError::KeyUnavailable(delta))
    }

    fn delete_all(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_forgets() {
        let mut m = NoOpMedium::new(MediumSettings::new("dummy"));
        let mut sink = m.open_output_stream(0, true).unwrap();
        sink.write_all(b"gone").unwrap();
        sink.close().unwrap();
        m.finish_output_stream(&SequenceNumbers::new(0, 1, 0), true).unwrap();
        assert!(m.read_sequence_numbers("").unwrap().is_empty());
        assert!(matches!(m.open_input_stream(0), Err(MediaError::DeltaNotFound(0))));
        assert!(m.check_ownership().unwrap());
    }
}
