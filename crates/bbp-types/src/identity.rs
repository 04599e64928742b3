use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Stable, table-local identifier for a persisted object.
///
/// Ids are assigned monotonically by a reference table and are never reused
/// while that table lives. On the wire an id is a big-endian `i32`; `-1`
/// encodes "no id" inside reference arrays.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceId(u32);

impl ReferenceId {
    /// Wire encoding of an absent id.
    pub const NONE_WIRE: i32 = -1;

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Index into a dense by-id array.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The id that follows this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Encode an optional id for a reference array.
    pub fn to_wire(id: Option<Self>) -> i32 {
        match id {
            Some(id) => id.0 as i32,
            None => Self::NONE_WIRE,
        }
    }

    /// Decode an optional id from a reference array. Any negative value is "none".
    pub fn from_wire(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }
}

impl fmt::Debug for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// Identity of a persistence client (a blackboard, a subscriber, an agent
/// component). Every association records the client that owns it, and
/// rehydrated objects are handed back to that client.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistenceIdentity(String);

impl PersistenceIdentity {
    /// Create an identity. Empty names are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TypeError::EmptyIdentity);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PersistenceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistenceIdentity({})", self.0)
    }
}

impl fmt::Display for PersistenceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
