//! Object graph codec for blackboard persistence.
//!
//! A delta is a sequence of associations, each serialized as its lifecycle
//! state, owning client, and the object graph reachable from its object.
//! While walking a graph the [`GraphWriter`] substitutes a compact reference
//! id for every known object that is not scheduled for this delta, and
//! records, per association, the id each inline object binds to. The
//! [`GraphReader`] consumes those recorded ids in the same order so that
//! every object lands on its stable identity, reusing instances the table
//! already holds.
//!
//! Persisted types implement [`PersistObject`] and are instantiated through a
//! closed [`TypeRegistry`] keyed by type tag.
//!
//! # Modules
//!
//! - [`error`] -- [`CodecError`] and the crate `Result`
//! - [`object`] -- the [`PersistObject`] trait and [`TypeRegistry`]
//! - [`wire`] -- big-endian primitives and the [`ByteReader`] cursor
//! - [`writer`] -- [`GraphWriter`]
//! - [`reader`] -- [`GraphReader`]
//! - [`frame`] -- [`DeltaFrame`]: header, reference arrays, body, checksum
//! - [`delta`] -- whole-delta encode/decode over a reference table

pub mod delta;
pub mod error;
pub mod frame;
pub mod object;
pub mod reader;
pub mod wire;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use delta::{read_delta, write_delta, ClientMap, DeltaContents, EncodedDelta};
pub use error::{CodecError, Result};
pub use frame::{peek_header, DeltaFrame, DeltaHeader, FRAME_MAGIC, FRAME_VERSION};
pub use object::{downcast_arc, AsAny, ObjectFactory, ObjectTable, PersistObject, TypeRegistry};
pub use reader::{GraphReader, RehydratedAssociation};
pub use wire::ByteReader;
pub use writer::GraphWriter;
