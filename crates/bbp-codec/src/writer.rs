//! Write path: serialize associations with reference substitution.

use std::collections::HashMap;
use std::sync::Arc;

use bbp_types::{PersistenceIdentity, ReferenceId};
use tracing::{trace, warn};

use crate::error::{CodecError, Result};
use crate::object::{ObjectTable, PersistObject};
use crate::wire::{put_bytes, put_i32, put_i64, put_str, put_u32, put_u8};

pub(crate) const TOKEN_NULL: u8 = 0;
pub(crate) const TOKEN_REF: u8 = 1;
pub(crate) const TOKEN_BACK: u8 = 2;
pub(crate) const TOKEN_INLINE: u8 = 3;

/// Position the writer can rewind to when one association has to be dropped.
#[derive(Clone, Copy)]
struct Checkpoint {
    buf: usize,
    index: usize,
    handles: usize,
}

/// Serializes associations into a delta body.
///
/// For every object reached while encoding:
///
/// - an object already written earlier in this body becomes a back-reference;
/// - a known object that is not marked becomes a reference to its id;
/// - a known, marked object is written inline and its id is recorded;
/// - an unknown object is written inline with an empty record, unless it is
///   unpublished, in which case it is written as null.
///
/// Records are collected per association and returned by
/// [`write_association`](Self::write_association); the reader needs them to
/// bind inline objects to their ids.
pub struct GraphWriter<'a> {
    table: &'a mut ObjectTable,
    buf: Vec<u8>,
    handles: HashMap<usize, u32>,
    // Strong refs keep handle addresses from being reused mid-stream.
    written: Vec<Arc<dyn PersistObject>>,
    index: Option<Vec<Option<ReferenceId>>>,
}

fn address_of(object: &Arc<dyn PersistObject>) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}

impl<'a> GraphWriter<'a> {
    pub fn new(table: &'a mut ObjectTable) -> Self {
        Self {
            table,
            buf: Vec::new(),
            handles: HashMap::new(),
            written: Vec::new(),
            index: None,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer, returning the body.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Write the association bound to `id`.
    ///
    /// Returns the reference record for the association, or `None` when it
    /// was skipped: its object died, or it could not be serialized. A skipped
    /// association leaves no bytes behind.
    pub fn write_association(&mut self, id: ReferenceId) -> Result<Option<Vec<Option<ReferenceId>>>> {
        let Some(assoc) = self.table.get(id) else {
            trace!(id = id.value(), "association gone before write");
            return Ok(None);
        };
        let Some(object) = assoc.object() else {
            return Ok(None);
        };
        let state = assoc.state();
        let owner = assoc.owner().cloned();

        let cp = self.checkpoint();
        self.index = Some(Vec::new());
        put_i32(&mut self.buf, state.code());
        self.write_owner(owner.as_ref());
        let outcome = self.write_object(Some(&object));
        let index = self.index.take().unwrap_or_default();

        match outcome {
            Ok(()) => {
                trace!(id = id.value(), inline = index.len(), "wrote association");
                Ok(Some(index))
            }
            Err(CodecError::Unserializable { type_name, reason }) => {
                warn!(id = id.value(), %type_name, %reason, "skipping unserializable association");
                self.rollback(cp);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write one client's leftover objects into the trailing map.
    ///
    /// Objects that cannot be serialized are written as null and logged.
    pub fn write_client_entry(
        &mut self,
        client: &PersistenceIdentity,
        objects: &[Arc<dyn PersistObject>],
    ) -> Result<()> {
        self.index = None;
        put_str(&mut self.buf, client.as_str());
        put_u32(&mut self.buf, objects.len() as u32);
        for object in objects {
            let cp = self.checkpoint();
            match self.write_object(Some(object)) {
                Ok(()) => {}
                Err(CodecError::Unserializable { type_name, reason }) => {
                    warn!(%client, %type_name, %reason, "skipping unserializable client object");
                    self.rollback(cp);
                    put_u8(&mut self.buf, TOKEN_NULL);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write the entry count that precedes the trailing map.
    pub fn begin_client_map(&mut self, entries: usize) {
        put_u32(&mut self.buf, entries as u32);
    }

    /// Write an object reference or inline object, substituting as described
    /// on [`GraphWriter`].
    pub fn write_object(&mut self, object: Option<&Arc<dyn PersistObject>>) -> Result<()> {
        let Some(object) = object else {
            put_u8(&mut self.buf, TOKEN_NULL);
            return Ok(());
        };

        let addr = address_of(object);
        if let Some(&handle) = self.handles.get(&addr) {
            put_u8(&mut self.buf, TOKEN_BACK);
            put_u32(&mut self.buf, handle);
            return Ok(());
        }

        let known = self.table.find(object).map(|a| (a.id(), a.is_marked()));
        let slot = match known {
            Some((id, false)) => {
                put_u8(&mut self.buf, TOKEN_REF);
                put_u32(&mut self.buf, id.value());
                return Ok(());
            }
            Some((id, true)) => Some(id),
            None => {
                if object.is_unpublished() {
                    warn!(type_tag = object.type_tag(), "unpublished object written as null");
                    put_u8(&mut self.buf, TOKEN_NULL);
                    return Ok(());
                }
                None
            }
        };

        if let Some(index) = self.index.as_mut() {
            index.push(slot);
        }
        let handle = self.written.len() as u32;
        self.handles.insert(addr, handle);
        self.written.push(Arc::clone(object));

        put_u8(&mut self.buf, TOKEN_INLINE);
        put_str(&mut self.buf, object.type_tag());
        object.encode(self)
    }

    /// Length-prefixed sequence of objects.
    pub fn write_objects(&mut self, objects: &[Arc<dyn PersistObject>]) -> Result<()> {
        put_u32(&mut self.buf, objects.len() as u32);
        for object in objects {
            self.write_object(Some(object))?;
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) {
        put_u8(&mut self.buf, v);
    }

    pub fn write_bool(&mut self, v: bool) {
        put_u8(&mut self.buf, u8::from(v));
    }

    pub fn write_u32(&mut self, v: u32) {
        put_u32(&mut self.buf, v);
    }

    pub fn write_i32(&mut self, v: i32) {
        put_i32(&mut self.buf, v);
    }

    pub fn write_i64(&mut self, v: i64) {
        put_i64(&mut self.buf, v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn write_str(&mut self, v: &str) {
        put_str(&mut self.buf, v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        put_bytes(&mut self.buf, v);
    }

    fn write_owner(&mut self, owner: Option<&PersistenceIdentity>) {
        match owner {
            Some(owner) => {
                put_u8(&mut self.buf, 1);
                put_str(&mut self.buf, owner.as_str());
            }
            None => put_u8(&mut self.buf, 0),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            buf: self.buf.len(),
            index: self.index.as_ref().map_or(0, Vec::len),
            handles: self.written.len(),
        }
    }

    fn rollback(&mut self, cp: Checkpoint) {
        self.buf.truncate(cp.buf);
        if let Some(index) = self.index.as_mut() {
            index.truncate(cp.index);
        }
        for object in self.written.drain(cp.handles..) {
            self.handles.remove(&address_of(&object));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Counter, Node};

    fn dyn_arc<T: PersistObject>(v: Arc<T>) -> Arc<dyn PersistObject> {
        v
    }

    #[test]
    fn marked_objects_are_recorded() {
        let mut table = ObjectTable::new();
        let a = dyn_arc(Counter::new("a", 1));
        let id = {
            let assoc = table.find_or_create(&a);
            assoc.set_marked(true);
            assoc.id()
        };
        let mut w = GraphWriter::new(&mut table);
        let index = w.write_association(id).unwrap().unwrap();
        assert_eq!(index, vec![Some(id)]);
        assert!(!w.is_empty());
    }

    #[test]
    fn unmarked_known_objects_become_references() {
        let mut table = ObjectTable::new();
        let child = dyn_arc(Counter::new("child", 5));
        let parent = dyn_arc(Node::new("parent", vec![Arc::clone(&child)]));
        table.find_or_create(&child);
        let pid = {
            let assoc = table.find_or_create(&parent);
            assoc.set_marked(true);
            assoc.id()
        };
        let mut w = GraphWriter::new(&mut table);
        let index = w.write_association(pid).unwrap().unwrap();
        // Only the parent was inline.
        assert_eq!(index, vec![Some(pid)]);
    }

    #[test]
    fn unknown_children_get_empty_records() {
        let mut table = ObjectTable::new();
        let child = dyn_arc(Counter::new("child", 5));
        let parent = dyn_arc(Node::new("parent", vec![child]));
        let pid = {
            let assoc = table.find_or_create(&parent);
            assoc.set_marked(true);
            assoc.id()
        };
        let mut w = GraphWriter::new(&mut table);
        let index = w.write_association(pid).unwrap().unwrap();
        assert_eq!(index, vec![Some(pid), None]);
    }

    #[test]
    fn repeated_objects_are_back_references() {
        let mut table = ObjectTable::new();
        let child = dyn_arc(Counter::new("child", 5));
        let parent = dyn_arc(Node::new("p", vec![Arc::clone(&child), Arc::clone(&child)]));
        let pid = {
            let assoc = table.find_or_create(&parent);
            assoc.set_marked(true);
            assoc.id()
        };
        let mut w = GraphWriter::new(&mut table);
        let index = w.write_association(pid).unwrap().unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn unserializable_association_leaves_no_bytes() {
        let mut table = ObjectTable::new();
        let bad = Counter::new("bad", 1);
        bad.set_fail_encode(true);
        let bad = dyn_arc(bad);
        let id = {
            let assoc = table.find_or_create(&bad);
            assoc.set_marked(true);
            assoc.id()
        };
        let mut w = GraphWriter::new(&mut table);
        assert!(w.write_association(id).unwrap().is_none());
        assert!(w.is_empty());
    }

    #[test]
    fn unpublished_unknown_object_is_null() {
        let mut table = ObjectTable::new();
        let hidden = Counter::new("hidden", 1);
        hidden.set_unpublished(true);
        let mut w = GraphWriter::new(&mut table);
        w.write_object(Some(&dyn_arc(hidden))).unwrap();
        assert_eq!(w.finish(), vec![TOKEN_NULL]);
    }

    #[test]
    fn dead_association_is_skipped() {
        let mut table = ObjectTable::new();
        let id = table.find_or_create(&dyn_arc(Counter::new("gone", 0))).id();
        let mut w = GraphWriter::new(&mut table);
        assert!(w.write_association(id).unwrap().is_none());
    }
}
