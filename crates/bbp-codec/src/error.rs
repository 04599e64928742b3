//! Error types for the graph codec.

use bbp_refs::RefTableError;
use bbp_types::{ReferenceId, TypeError};
use thiserror::Error;

/// Errors raised while encoding or decoding an object graph or delta frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The registry has no factory for this type tag.
    #[error("unknown object type: {0}")]
    UnknownType(String),

    /// A reference token names an id the table does not hold.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(ReferenceId),

    /// A back-reference names a handle not yet assigned in this stream.
    #[error("invalid stream handle: {0}")]
    InvalidHandle(u32),

    /// The table holds an object of a different type under this id.
    #[error("{id} holds a {actual}, stream expects a {expected}")]
    WrongObjectType {
        id: ReferenceId,
        expected: String,
        actual: String,
    },

    /// More inline objects were read than the reference array announced.
    #[error("reference index exhausted")]
    ReferenceIndexExhausted,

    #[error("invalid token byte: {byte:#04x}")]
    InvalidToken { byte: u8 },

    /// An object refused to be encoded. The writer skips it and continues.
    #[error("cannot serialize {type_name}: {reason}")]
    Unserializable { type_name: String, reason: String },

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("malformed delta frame: {0}")]
    Malformed(&'static str),

    #[error("not a delta frame")]
    BadMagic,

    #[error("unsupported delta frame version: {0}")]
    UnsupportedVersion(u32),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("reference table: {0}")]
    Table(#[from] RefTableError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// A rehydration validation hook rejected a freshly filled object.
    #[error("validation failed for {type_name}: {reason}")]
    Validation { type_name: String, reason: String },
}

/// Convenience type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
