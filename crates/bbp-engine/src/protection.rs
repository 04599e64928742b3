//! Data protection hook.
//!
//! The engine does no encryption itself. When a [`DataProtection`] service is
//! installed, every delta passes through it on the way to and from a medium,
//! together with a [`KeyEnvelope`] that stores the delta's key on that medium.

use bbp_media::StorageMedium;
use bbp_types::DataProtectionKey;

use crate::error::Result;

/// Wraps and unwraps delta bytes.
pub trait DataProtection: Send + Sync {
    fn protect(&self, keys: &mut KeyEnvelope<'_>, plain: Vec<u8>) -> Result<Vec<u8>>;

    fn unprotect(&self, keys: &mut KeyEnvelope<'_>, sealed: Vec<u8>) -> Result<Vec<u8>>;
}

/// Key storage for one delta on one medium.
pub struct KeyEnvelope<'a> {
    medium: &'a mut dyn StorageMedium,
    delta: u32,
    key: Option<DataProtectionKey>,
}

impl<'a> KeyEnvelope<'a> {
    pub fn new(medium: &'a mut dyn StorageMedium, delta: u32) -> Self {
        Self {
            medium,
            delta,
            key: None,
        }
    }

    pub fn delta(&self) -> u32 {
        self.delta
    }

    pub fn medium_name(&self) -> &str {
        self.medium.name()
    }

    /// Persist the key of this delta.
    pub fn set_key(&mut self, key: DataProtectionKey) -> Result<()> {
        self.medium.store_data_protection_key(self.delta, &key)?;
        self.key = Some(key);
        Ok(())
    }

    /// The key of this delta, fetched from the medium on first use.
    pub fn key(&mut self) -> Result<&DataProtectionKey> {
        if self.key.is_none() {
            self.key = Some(self.medium.retrieve_data_protection_key(self.delta)?);
        }
        match self.key.as_ref() {
            Some(key) => Ok(key),
            None => Err(bbp_media::MediaError::KeyUnavailable(self.delta).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbp_media::{MediumSettings, PlainFileMedium, DirectFs};
    use std::time::Duration;

    #[test]
    fn key_is_stored_once_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut medium =
            PlainFileMedium::open(MediumSettings::new("P"), dir.path(), "a", DirectFs, Duration::from_secs(1), false)
                .unwrap();
        let key = DataProtectionKey::new("xor", vec![1, 2, 3]);
        KeyEnvelope::new(&mut medium, 4).set_key(key.clone()).unwrap();

        let mut env = KeyEnvelope::new(&mut medium, 4);
        assert_eq!(env.medium_name(), "P");
        assert_eq!(env.key().unwrap(), &key);
        assert!(KeyEnvelope::new(&mut medium, 5).key().is_err());
    }
}
