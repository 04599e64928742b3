//! Reference table for blackboard persistence.
//!
//! The table binds live objects to stable [`ReferenceId`]s so that a delta can
//! substitute a compact id for any object already written. Objects are held
//! weakly: an association disappears once nothing but the table refers to its
//! object. Reclamation is lazy and happens during ordinary table operations,
//! or explicitly through [`ReferenceTable::sweep`].
//!
//! # Modules
//!
//! - [`error`] -- Error types for table operations
//! - [`table`] -- [`ReferenceTable`] and [`Association`]
//!
//! [`ReferenceId`]: bbp_types::ReferenceId

pub mod error;
pub mod table;

pub use error::{RefTableError, Result};
pub use table::{Association, ReferenceTable, INITIAL_BUCKETS};
