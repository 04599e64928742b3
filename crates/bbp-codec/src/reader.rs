//! Read path: rebuild associations in place over a reference table.

use std::collections::VecDeque;
use std::sync::Arc;

use bbp_types::{AssociationState, PersistenceIdentity, ReferenceId};
use tracing::{trace, warn};

use crate::error::{CodecError, Result};
use crate::object::{ObjectTable, PersistObject, TypeRegistry};
use crate::wire::ByteReader;
use crate::writer::{TOKEN_BACK, TOKEN_INLINE, TOKEN_NULL, TOKEN_REF};

/// One association as restored from a delta.
#[derive(Debug, Clone)]
pub struct RehydratedAssociation {
    pub object: Arc<dyn PersistObject>,
    pub id: Option<ReferenceId>,
    pub state: AssociationState,
    pub owner: Option<PersistenceIdentity>,
}

/// Deserializes a delta body written by [`GraphWriter`](crate::GraphWriter).
pub struct GraphReader<'a> {
    table: &'a mut ObjectTable,
    registry: &'a TypeRegistry,
    input: ByteReader<'a>,
    handles: Vec<Arc<dyn PersistObject>>,
    expected: Option<VecDeque<Option<ReferenceId>>>,
}

impl<'a> GraphReader<'a> {
    pub fn new(table: &'a mut ObjectTable, registry: &'a TypeRegistry, body: &'a [u8]) -> Self {
        Self {
            table,
            registry,
            input: ByteReader::new(body),
            handles: Vec::new(),
            expected: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.input.remaining()
    }

    /// Read one association, binding inline objects to `expected` in order.
    ///
    /// Returns `None` when the association's object was written as null.
    pub fn read_association(
        &mut self,
        expected: &[Option<ReferenceId>],
    ) -> Result<Option<RehydratedAssociation>> {
        let state = AssociationState::from_code(self.input.i32()?)?;
        let owner = match self.input.u8()? {
            0 => None,
            _ => Some(PersistenceIdentity::new(self.input.str()?)?),
        };

        self.expected = Some(expected.iter().copied().collect());
        let object = self.read_object();
        self.expected = None;

        let Some(object) = object? else {
            warn!(?state, ?owner, "association object is null");
            return Ok(None);
        };

        let id = match self.table.find(&object) {
            Some(assoc) => {
                assoc.set_state(state);
                assoc.set_owner(owner.clone());
                Some(assoc.id())
            }
            None => None,
        };
        trace!(?id, ?state, "read association");
        Ok(Some(RehydratedAssociation {
            object,
            id,
            state,
            owner,
        }))
    }

    /// Read one entry of the trailing client map. Null objects are dropped.
    pub fn read_client_entry(&mut self) -> Result<(PersistenceIdentity, Vec<Arc<dyn PersistObject>>)> {
        let client = PersistenceIdentity::new(self.input.str()?)?;
        let count = self.input.u32()? as usize;
        let mut objects = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if let Some(object) = self.read_object()? {
                objects.push(object);
            }
        }
        Ok((client, objects))
    }

    /// Entry count that precedes the trailing map.
    pub fn begin_client_map(&mut self) -> Result<usize> {
        Ok(self.input.u32()? as usize)
    }

    /// Read an object token.
    pub fn read_object(&mut self) -> Result<Option<Arc<dyn PersistObject>>> {
        match self.input.u8()? {
            TOKEN_NULL => Ok(None),
            TOKEN_REF => {
                let id = ReferenceId::new(self.input.u32()?);
                let object = self
                    .table
                    .get(id)
                    .and_then(|assoc| assoc.object())
                    .ok_or(CodecError::UnresolvedReference(id))?;
                Ok(Some(object))
            }
            TOKEN_BACK => {
                let handle = self.input.u32()?;
                let object = self
                    .handles
                    .get(handle as usize)
                    .cloned()
                    .ok_or(CodecError::InvalidHandle(handle))?;
                Ok(Some(object))
            }
            TOKEN_INLINE => {
                let tag = self.input.str()?;
                let object = self.instance_for(tag)?;
                self.handles.push(Arc::clone(&object));
                object.decode_into(self)?;
                object.check_rehydration()?;
                Ok(Some(object))
            }
            byte => Err(CodecError::InvalidToken { byte }),
        }
    }

    /// Length-prefixed sequence of objects. Nulls are kept out of the result.
    pub fn read_objects(&mut self) -> Result<Vec<Arc<dyn PersistObject>>> {
        let count = self.input.u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if let Some(object) = self.read_object()? {
                out.push(object);
            }
        }
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.input.u8()
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.input.u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.input.u32()
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.input.i32()
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.input.i64()
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.input.i64()? as u64))
    }

    pub fn read_str(&mut self) -> Result<String> {
        self.input.str().map(str::to_string)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.input.bytes().map(<[u8]>::to_vec)
    }

    /// Instance an inline object binds to: the table's existing object for
    /// the next expected id, a fresh one registered under that id, or a fresh
    /// unregistered one when no id was recorded.
    fn instance_for(&mut self, tag: &str) -> Result<Arc<dyn PersistObject>> {
        let expected = match self.expected.as_mut() {
            Some(queue) => queue.pop_front().ok_or(CodecError::ReferenceIndexExhausted)?,
            None => None,
        };
        let Some(id) = expected else {
            return self.registry.instantiate(tag);
        };

        if let Some(existing) = self.table.get(id).and_then(|assoc| assoc.object()) {
            if existing.type_tag() != tag {
                return Err(CodecError::WrongObjectType {
                    id,
                    expected: tag.to_string(),
                    actual: existing.type_tag().to_string(),
                });
            }
            trace!(id = id.value(), tag, "reusing live instance");
            return Ok(existing);
        }

        let object = self.registry.instantiate(tag)?;
        self.table.create(&object, id)?;
        trace!(id = id.value(), tag, "allocated instance");
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::downcast_arc;
    use crate::testing::{registry, Counter, Node};
    use crate::writer::GraphWriter;

    fn dyn_arc<T: PersistObject>(v: Arc<T>) -> Arc<dyn PersistObject> {
        v
    }

    fn mark(table: &mut ObjectTable, obj: &Arc<dyn PersistObject>) -> ReferenceId {
        let assoc = table.find_or_create(obj);
        assoc.set_marked(true);
        assoc.set_state(AssociationState::Active);
        assoc.id()
    }

    #[test]
    fn reads_into_fresh_table() {
        let reg = registry();
        let mut src = ObjectTable::new();
        let a = dyn_arc(Counter::new("a", 42));
        let id = mark(&mut src, &a);
        let mut w = GraphWriter::new(&mut src);
        let index = w.write_association(id).unwrap().unwrap();
        let body = w.finish();

        let mut dst = ObjectTable::new();
        dst.begin_retention();
        let mut r = GraphReader::new(&mut dst, &reg, &body);
        let got = r.read_association(&index).unwrap().unwrap();
        assert_eq!(got.id, Some(id));
        assert_eq!(got.state, AssociationState::Active);
        let counter = downcast_arc::<Counter>(got.object).unwrap();
        assert_eq!(counter.value(), 42);
        assert_eq!(counter.name(), "a");
    }

    #[test]
    fn reuses_existing_instance() {
        let reg = registry();
        let mut table = ObjectTable::new();
        let live = Counter::new("x", 1);
        let live_dyn = dyn_arc(Arc::clone(&live));
        let id = mark(&mut table, &live_dyn);

        live.set_value(2);
        let body_and_index = {
            let mut w = GraphWriter::new(&mut table);
            let index = w.write_association(id).unwrap().unwrap();
            (w.finish(), index)
        };
        live.set_value(99);

        let mut r = GraphReader::new(&mut table, &reg, &body_and_index.0);
        let got = r.read_association(&body_and_index.1).unwrap().unwrap();
        assert!(Arc::ptr_eq(&got.object, &live_dyn));
        assert_eq!(live.value(), 2);
    }

    #[test]
    fn wrong_type_under_id_is_an_error() {
        let reg = registry();
        let mut src = ObjectTable::new();
        let a = dyn_arc(Counter::new("a", 1));
        let id = mark(&mut src, &a);
        let mut w = GraphWriter::new(&mut src);
        let index = w.write_association(id).unwrap().unwrap();
        let body = w.finish();

        let mut dst = ObjectTable::new();
        let squatter = dyn_arc(Node::new("n", vec![]));
        dst.create(&squatter, id).unwrap();
        let mut r = GraphReader::new(&mut dst, &reg, &body);
        assert!(matches!(
            r.read_association(&index),
            Err(CodecError::WrongObjectType { .. })
        ));
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let reg = registry();
        let mut src = ObjectTable::new();
        let child = dyn_arc(Counter::new("c", 1));
        src.find_or_create(&child);
        let parent = dyn_arc(Node::new("p", vec![child]));
        let pid = mark(&mut src, &parent);
        let mut w = GraphWriter::new(&mut src);
        let index = w.write_association(pid).unwrap().unwrap();
        let body = w.finish();

        let mut dst = ObjectTable::new();
        dst.begin_retention();
        let mut r = GraphReader::new(&mut dst, &reg, &body);
        assert!(matches!(
            r.read_association(&index),
            Err(CodecError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn short_index_is_exhausted() {
        let reg = registry();
        let mut src = ObjectTable::new();
        let a = dyn_arc(Counter::new("a", 1));
        let id = mark(&mut src, &a);
        let mut w = GraphWriter::new(&mut src);
        w.write_association(id).unwrap();
        let body = w.finish();

        let mut dst = ObjectTable::new();
        let mut r = GraphReader::new(&mut dst, &reg, &body);
        assert!(matches!(
            r.read_association(&[]),
            Err(CodecError::ReferenceIndexExhausted)
        ));
    }

    #[test]
    fn cycles_resolve_through_handles() {
        let reg = registry();
        let mut src = ObjectTable::new();
        let node = Node::new("loop", vec![]);
        let node_dyn = dyn_arc(Arc::clone(&node));
        node.push_link(Arc::clone(&node_dyn));
        let id = mark(&mut src, &node_dyn);
        let mut w = GraphWriter::new(&mut src);
        let index = w.write_association(id).unwrap().unwrap();
        let body = w.finish();
        node.clear_links();

        let mut dst = ObjectTable::new();
        dst.begin_retention();
        let mut r = GraphReader::new(&mut dst, &reg, &body);
        let got = r.read_association(&index).unwrap().unwrap();
        let restored = downcast_arc::<Node>(Arc::clone(&got.object)).unwrap();
        let links = restored.links();
        assert_eq!(links.len(), 1);
        assert!(Arc::ptr_eq(&links[0], &got.object));
        restored.clear_links();
    }

    #[test]
    fn validation_hook_rejects() {
        let reg = registry();
        let mut src = ObjectTable::new();
        let a = Counter::new("a", -1);
        let a_dyn = dyn_arc(a);
        let id = mark(&mut src, &a_dyn);
        let mut w = GraphWriter::new(&mut src);
        let index = w.write_association(id).unwrap().unwrap();
        let body = w.finish();

        let mut dst = ObjectTable::new();
        dst.begin_retention();
        let mut r = GraphReader::new(&mut dst, &reg, &body);
        assert!(matches!(
            r.read_association(&index),
            Err(CodecError::Validation { .. })
        ));
    }
}
