//! Error types for reference table operations.

use bbp_types::ReferenceId;
use thiserror::Error;

/// Errors that can occur while mutating a reference table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefTableError {
    /// `create` targeted an id that already binds a live object.
    #[error("slot full: {id} is already bound to a live object")]
    SlotOccupied { id: ReferenceId },
}

/// Convenience type alias for table operations.
pub type Result<T> = std::result::Result<T, RefTableError>;
