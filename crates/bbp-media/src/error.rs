//! Error types for storage media.

use bbp_types::TypeError;
use thiserror::Error;

/// Errors that can occur while reading or writing a storage medium.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The medium configuration is unusable. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    /// Another live instance owns this medium.
    #[error("medium owned by another instance: {holder}")]
    OwnershipConflict { holder: String },

    #[error("delta {0} not found")]
    DeltaNotFound(u32),

    #[error("no data protection key stored for delta {0}")]
    KeyUnavailable(u32),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The calling thread already holds the shared database connection.
    #[error("database connection requested again by its holder")]
    ReentrantConnection,

    #[error("operation not supported by this medium: {0}")]
    Unsupported(&'static str),

    #[error("type error: {0}")]
    Type(#[from] TypeError),
}

macro_rules! database_error {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for MediaError {
            fn from(e: $ty) -> Self {
                Self::Database(e.to_string())
            }
        })*
    };
}

database_error!(
    redb::DatabaseError,
    redb::StorageError,
    redb::TableError,
    redb::TransactionError,
    redb::CommitError,
);

impl From<bincode::Error> for MediaError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience type alias for medium operations.
pub type Result<T> = std::result::Result<T, MediaError>;
