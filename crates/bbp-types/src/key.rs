use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-delta key material produced by a data-protection service.
///
/// The persistence layer never interprets the bytes; it only stores the key
/// next to the delta it protects and hands it back on rehydration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataProtectionKey {
    pub algorithm: String,
    pub material: Vec<u8>,
}

impl DataProtectionKey {
    pub fn new(algorithm: impl Into<String>, material: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            material,
        }
    }
}

// Key bytes stay out of logs.
impl fmt::Debug for DataProtectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProtectionKey")
            .field("algorithm", &self.algorithm)
            .field("len", &self.material.len())
            .finish()
    }
}
