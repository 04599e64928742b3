//! Foundation types for blackboard persistence (BBP).
//!
//! This crate provides the identity, numbering, and lifecycle types shared by
//! every other BBP crate. It has no I/O of its own.
//!
//! # Key Types
//!
//! - [`ReferenceId`] -- stable, table-local id substituted for an object in a delta
//! - [`PersistenceIdentity`] -- identity of a client that owns persisted objects
//! - [`AssociationState`] -- New / Active / Inactive lifecycle of an association
//! - [`SequenceNumbers`] -- a contiguous range of committed delta numbers on one medium
//! - [`DeltaStatus`] -- full / incremental / archived status of a stored delta
//! - [`DataProtectionKey`] -- per-delta key material persisted for the encryption hook

pub mod association;
pub mod error;
pub mod identity;
pub mod key;
pub mod sequence;

pub use association::{AssociationState, DeltaStatus};
pub use error::TypeError;
pub use identity::{PersistenceIdentity, ReferenceId};
pub use key::DataProtectionKey;
pub use sequence::{format_delta_number, now_millis, parse_delta_suffix, SequenceNumbers};
