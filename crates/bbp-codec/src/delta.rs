//! Whole-delta encode and decode over a reference table.

use std::collections::BTreeMap;
use std::sync::Arc;

use bbp_types::{PersistenceIdentity, ReferenceId};
use tracing::debug;

use crate::error::Result;
use crate::frame::DeltaFrame;
use crate::object::{ObjectTable, PersistObject, TypeRegistry};
use crate::reader::{GraphReader, RehydratedAssociation};
use crate::writer::GraphWriter;

/// Leftover objects per client, written after the associations.
pub type ClientMap = BTreeMap<PersistenceIdentity, Vec<Arc<dyn PersistObject>>>;

/// A framed delta ready for a storage medium.
#[derive(Debug, Clone)]
pub struct EncodedDelta {
    pub bytes: Vec<u8>,
    pub written: usize,
    pub skipped: usize,
}

/// What one delta contributed while being replayed.
#[derive(Debug, Default)]
pub struct DeltaContents {
    pub associations: Vec<RehydratedAssociation>,
    /// Present only when the trailing map was requested.
    pub clients: Option<ClientMap>,
}

/// Serialize the associations bound to `ids`, in order, followed by `clients`.
///
/// Associations are written inline only while marked; callers mark what the
/// delta must carry before calling this.
pub fn write_delta(table: &mut ObjectTable, ids: &[ReferenceId], clients: &ClientMap) -> Result<EncodedDelta> {
    let next_ref_id = table.next_id();
    let mut writer = GraphWriter::new(table);
    let mut indexes = Vec::with_capacity(ids.len());
    let mut skipped = 0;
    for &id in ids {
        match writer.write_association(id)? {
            Some(index) => indexes.push(index),
            None => skipped += 1,
        }
    }
    writer.begin_client_map(clients.len());
    for (client, objects) in clients {
        writer.write_client_entry(client, objects)?;
    }
    let body = writer.finish();

    let written = indexes.len();
    let frame = DeltaFrame {
        next_ref_id,
        indexes,
        body,
    };
    let bytes = frame.to_bytes();
    debug!(written, skipped, bytes = bytes.len(), "encoded delta");
    Ok(EncodedDelta {
        bytes,
        written,
        skipped,
    })
}

/// Replay one framed delta into `table`.
///
/// Only the last delta of a set carries a trailing map worth reading; pass
/// `read_clients` for that one.
pub fn read_delta(
    table: &mut ObjectTable,
    registry: &TypeRegistry,
    bytes: &[u8],
    read_clients: bool,
) -> Result<DeltaContents> {
    let frame = DeltaFrame::from_bytes(bytes)?;
    if frame.next_ref_id > table.next_id() {
        table.set_next_id(frame.next_ref_id);
    }

    let mut reader = GraphReader::new(table, registry, &frame.body);
    let mut associations = Vec::with_capacity(frame.indexes.len());
    for index in &frame.indexes {
        if let Some(assoc) = reader.read_association(index)? {
            associations.push(assoc);
        }
    }

    let clients = if read_clients {
        let entries = reader.begin_client_map()?;
        let mut map = ClientMap::new();
        for _ in 0..entries {
            let (client, objects) = reader.read_client_entry()?;
            map.entry(client).or_default().extend(objects);
        }
        Some(map)
    } else {
        None
    };

    debug!(associations = associations.len(), "replayed delta");
    Ok(DeltaContents {
        associations,
        clients,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::downcast_arc;
    use crate::testing::{registry, Counter, Node};
    use bbp_types::AssociationState;
    use proptest::prelude::*;

    fn dyn_arc<T: PersistObject>(v: Arc<T>) -> Arc<dyn PersistObject> {
        v
    }

    fn mark_all(table: &mut ObjectTable, objs: &[Arc<dyn PersistObject>]) -> Vec<ReferenceId> {
        objs.iter()
            .map(|o| {
                let a = table.find_or_create(o);
                a.set_marked(true);
                a.set_state(AssociationState::Active);
                a.id()
            })
            .collect()
    }

    #[test]
    fn next_ref_id_carried_over() {
        let mut src = ObjectTable::new();
        let objs: Vec<_> = (0..4).map(|i| dyn_arc(Counter::new("c", i))).collect();
        let ids = mark_all(&mut src, &objs);
        let delta = write_delta(&mut src, &ids, &ClientMap::new()).unwrap();
        assert_eq!(delta.written, 4);

        let mut dst = ObjectTable::new();
        dst.begin_retention();
        let contents = read_delta(&mut dst, &registry(), &delta.bytes, true).unwrap();
        assert_eq!(contents.associations.len(), 4);
        assert_eq!(dst.next_id(), src.next_id());
        assert!(contents.clients.unwrap().is_empty());
    }

    #[test]
    fn client_map_roundtrip() {
        let mut src = ObjectTable::new();
        let client = PersistenceIdentity::new("bb").unwrap();
        let mut clients = ClientMap::new();
        clients.insert(client.clone(), vec![dyn_arc(Counter::new("left", 3))]);
        let delta = write_delta(&mut src, &[], &clients).unwrap();

        let mut dst = ObjectTable::new();
        let contents = read_delta(&mut dst, &registry(), &delta.bytes, true).unwrap();
        let map = contents.clients.unwrap();
        let left = downcast_arc::<Counter>(Arc::clone(&map[&client][0])).unwrap();
        assert_eq!(left.value(), 3);
        assert!(dst.is_empty());
    }

    #[test]
    fn unserializable_client_object_dropped() {
        let mut src = ObjectTable::new();
        let client = PersistenceIdentity::new("bb").unwrap();
        let bad = Counter::new("bad", 1);
        bad.set_fail_encode(true);
        let mut clients = ClientMap::new();
        clients.insert(client.clone(), vec![dyn_arc(bad), dyn_arc(Counter::new("ok", 2))]);
        let delta = write_delta(&mut src, &[], &clients).unwrap();

        let mut dst = ObjectTable::new();
        let map = read_delta(&mut dst, &registry(), &delta.bytes, true)
            .unwrap()
            .clients
            .unwrap();
        assert_eq!(map[&client].len(), 1);
    }

    #[test]
    fn shared_child_keeps_one_identity() {
        let mut src = ObjectTable::new();
        let shared = dyn_arc(Counter::new("shared", 7));
        let a = dyn_arc(Node::new("a", vec![Arc::clone(&shared)]));
        let b = dyn_arc(Node::new("b", vec![Arc::clone(&shared)]));
        let ids = mark_all(&mut src, &[a, b, shared]);
        let delta = write_delta(&mut src, &ids, &ClientMap::new()).unwrap();

        let mut dst = ObjectTable::new();
        dst.begin_retention();
        let contents = read_delta(&mut dst, &registry(), &delta.bytes, false).unwrap();
        assert_eq!(contents.associations.len(), 3);
        let na = downcast_arc::<Node>(Arc::clone(&contents.associations[0].object)).unwrap();
        let nb = downcast_arc::<Node>(Arc::clone(&contents.associations[1].object)).unwrap();
        assert!(Arc::ptr_eq(&na.links()[0], &nb.links()[0]));
        assert!(Arc::ptr_eq(&na.links()[0], &contents.associations[2].object));
        assert_eq!(contents.associations[2].id, Some(ids[2]));
    }

    #[test]
    fn corrupt_delta_is_rejected() {
        let mut src = ObjectTable::new();
        let objs = vec![dyn_arc(Counter::new("c", 1))];
        let ids = mark_all(&mut src, &objs);
        let delta = write_delta(&mut src, &ids, &ClientMap::new()).unwrap();
        let mut dst = ObjectTable::new();
        let cut = &delta.bytes[..delta.bytes.len() / 2];
        assert!(read_delta(&mut dst, &registry(), cut, true).is_err());
    }

    proptest! {
        // A random forest of nodes over counters reads back with the same
        // shape, values, and sharing.
        #[test]
        fn graph_roundtrip(
            values in proptest::collection::vec(0i64..1000, 1..12),
            edges in proptest::collection::vec((0usize..8, 0usize..12), 0..24),
        ) {
            let counters: Vec<Arc<Counter>> = values.iter().map(|&v| Counter::new("c", v)).collect();
            let nodes: Vec<Arc<Node>> = (0..8).map(|i| Node::new(&format!("n{i}"), vec![])).collect();
            for &(n, c) in &edges {
                nodes[n].push_link(dyn_arc(Arc::clone(&counters[c % counters.len()])));
            }

            let mut src = ObjectTable::new();
            let roots: Vec<Arc<dyn PersistObject>> = nodes.iter().map(|n| dyn_arc(Arc::clone(n))).collect();
            let ids = mark_all(&mut src, &roots);
            let delta = write_delta(&mut src, &ids, &ClientMap::new()).unwrap();

            let mut dst = ObjectTable::new();
            dst.begin_retention();
            let contents = read_delta(&mut dst, &registry(), &delta.bytes, false).unwrap();
            prop_assert_eq!(contents.associations.len(), nodes.len());

            let mut restored_by_source = std::collections::HashMap::new();
            for (orig, got) in nodes.iter().zip(&contents.associations) {
                let got = downcast_arc::<Node>(Arc::clone(&got.object)).unwrap();
                prop_assert_eq!(got.label(), orig.label());
                let (ol, gl) = (orig.links(), got.links());
                prop_assert_eq!(ol.len(), gl.len());
                for (o, g) in ol.iter().zip(&gl) {
                    let oc = downcast_arc::<Counter>(Arc::clone(o)).unwrap();
                    let gc = downcast_arc::<Counter>(Arc::clone(g)).unwrap();
                    prop_assert_eq!(oc.value(), gc.value());
                    let key = Arc::as_ptr(&oc) as usize;
                    let prior = restored_by_source.entry(key).or_insert_with(|| Arc::clone(&gc));
                    prop_assert!(Arc::ptr_eq(prior, &gc));
                }
            }
        }
    }
}
