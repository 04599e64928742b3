use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Lifecycle of an association between a live object and its reference id.
///
/// Associations start `New`, become `Active` when their object is added or
/// changed, and `Inactive` once removed. Only active associations are handed
/// back to clients after rehydration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationState {
    #[default]
    New,
    Active,
    Inactive,
}

impl AssociationState {
    /// Wire code written ahead of every association in a delta.
    pub const fn code(self) -> i32 {
        match self {
            Self::New => 0,
            Self::Active => 1,
            Self::Inactive => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, TypeError> {
        match code {
            0 => Ok(Self::New),
            1 => Ok(Self::Active),
            2 => Ok(Self::Inactive),
            other => Err(TypeError::InvalidStateCode(other)),
        }
    }

    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Status of a stored delta row in a database medium.
///
/// The single-character codes match the `active CHAR(1)` column:
/// `x` full, `t` incremental, `a` archived full, `f` archived incremental.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaStatus {
    Full,
    Incremental,
    ArchivedFull,
    ArchivedIncremental,
}

impl DeltaStatus {
    pub const fn code(self) -> char {
        match self {
            Self::Full => 'x',
            Self::Incremental => 't',
            Self::ArchivedFull => 'a',
            Self::ArchivedIncremental => 'f',
        }
    }

    pub fn from_code(code: char) -> Result<Self, TypeError> {
        match code {
            'x' => Ok(Self::Full),
            't' => Ok(Self::Incremental),
            'a' => Ok(Self::ArchivedFull),
            'f' => Ok(Self::ArchivedIncremental),
            other => Err(TypeError::InvalidStatus(other)),
        }
    }

    /// Part of the live chain (not archived).
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Full | Self::Incremental)
    }

    /// Status this delta takes once it falls outside the retained range.
    pub const fn archived(self) -> Self {
        match self {
            Self::Full | Self::ArchivedFull => Self::ArchivedFull,
            Self::Incremental | Self::ArchivedIncremental => Self::ArchivedIncremental,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_roundtrip() {
        for state in [AssociationState::New, AssociationState::Active, AssociationState::Inactive] {
            assert_eq!(AssociationState::from_code(state.code()).unwrap(), state);
        }
        assert_eq!(AssociationState::from_code(9), Err(TypeError::InvalidStateCode(9)));
    }

    #[test]
    fn status_archiving() {
        assert_eq!(DeltaStatus::Full.archived(), DeltaStatus::ArchivedFull);
        assert_eq!(DeltaStatus::Incremental.archived(), DeltaStatus::ArchivedIncremental);
        assert!(DeltaStatus::Full.is_live());
        assert!(!DeltaStatus::ArchivedFull.is_live());
        assert_eq!(DeltaStatus::from_code('a').unwrap(), DeltaStatus::ArchivedFull);
        assert!(DeltaStatus::from_code('z').is_err());
    }
}
