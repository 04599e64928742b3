//! Error types for the persistence engine.

use bbp_codec::CodecError;
use bbp_media::MediaError;
use bbp_refs::RefTableError;
use bbp_types::{PersistenceIdentity, TypeError};
use thiserror::Error;

/// Errors that can occur while persisting or rehydrating.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("medium error: {0}")]
    Media(#[from] MediaError),

    #[error("reference table error: {0}")]
    Table(#[from] RefTableError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A client submitted an object another client owns.
    #[error("{client} is not the owner of an object owned by {owner}")]
    NotOwner {
        client: PersistenceIdentity,
        owner: PersistenceIdentity,
    },

    /// Another instance took over the medium; this instance must stop writing.
    #[error("ownership of medium {medium} was lost")]
    OwnershipLost { medium: String },

    #[error("no such persistence medium: {0}")]
    NoSuchMedium(String),

    #[error("medium {medium} has no control named {control}")]
    NoSuchControl { medium: String, control: String },

    #[error("value {value} out of range {min}..={max} for {control}")]
    ControlOutOfRange {
        control: String,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rehydration failed: {0}")]
    Rehydration(String),

    #[error("no writable medium")]
    NoWritableMedium,
}

/// Convenience type alias for engine operations.
pub type Result<T> = std::result::Result<T, PersistError>;
