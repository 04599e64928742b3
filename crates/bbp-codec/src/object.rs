//! The persisted-object contract and the closed type registry.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bbp_refs::ReferenceTable;

use crate::error::{CodecError, Result};
use crate::reader::GraphReader;
use crate::writer::GraphWriter;

/// Reference table specialised to persisted objects.
pub type ObjectTable = ReferenceTable<dyn PersistObject>;

/// Creates an empty instance of one persisted type, ready for `decode_into`.
pub type ObjectFactory = fn() -> Arc<dyn PersistObject>;

/// Dynamic-typing escape hatch for trait objects.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Downcast a persisted object to its concrete type.
pub fn downcast_arc<T: Any + Send + Sync>(object: Arc<dyn PersistObject>) -> Option<Arc<T>> {
    object.into_any_arc().downcast::<T>().ok()
}

/// A type whose instances can be written into and restored from deltas.
///
/// Restoration happens in place: the reader either reuses the instance the
/// table already holds for an id or allocates a fresh one through the
/// registry, then calls [`decode_into`](Self::decode_into) on it. Fields are
/// therefore updated through interior mutability. Implementations should read
/// every field from the reader before taking their own locks, since nested
/// reads may reach back into this object.
pub trait PersistObject: AsAny {
    /// Registry key written ahead of every inline instance.
    fn type_tag(&self) -> &'static str;

    /// Write this object's fields.
    fn encode(&self, out: &mut GraphWriter<'_>) -> Result<()>;

    /// Overwrite this object's fields from the stream.
    fn decode_into(&self, input: &mut GraphReader<'_>) -> Result<()>;

    /// Objects not yet committed by their owner veto being written.
    fn is_unpublished(&self) -> bool {
        false
    }

    /// Runs right after the object was filled in during rehydration.
    fn check_rehydration(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once per active object after a whole rehydration set succeeded.
    fn post_rehydration(&self) {}

    /// Non-persistable objects are ignored when client data is gathered.
    fn is_persistable(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn PersistObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.type_tag())
    }
}

/// Closed mapping from type tag to factory.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    factories: BTreeMap<&'static str, ObjectFactory>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Returns the factory previously bound to `tag`, if any.
    pub fn register(&mut self, tag: &'static str, factory: ObjectFactory) -> Option<ObjectFactory> {
        self.factories.insert(tag, factory)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Allocate an empty instance of `tag`.
    pub fn instantiate(&self, tag: &str) -> Result<Arc<dyn PersistObject>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| CodecError::UnknownType(tag.to_string()))?;
        Ok(factory())
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
