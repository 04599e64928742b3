//! Sample persisted types for tests.
//!
//! [`Counter`] is a leaf with a name and a value; [`Node`] holds links to
//! other objects and can form cycles. Both carry switches that drive the
//! writer's and reader's edge cases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CodecError, Result};
use crate::object::{PersistObject, TypeRegistry};
use crate::reader::GraphReader;
use crate::writer::GraphWriter;

/// Registry with [`Counter`] and [`Node`].
pub fn registry() -> TypeRegistry {
    let mut reg = TypeRegistry::new();
    reg.register(Counter::TAG, Counter::factory);
    reg.register(Node::TAG, Node::factory);
    reg
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct CounterState {
    name: String,
    value: i64,
}

/// Named integer. Negative values fail rehydration validation.
#[derive(Debug)]
pub struct Counter {
    state: Mutex<CounterState>,
    fail_encode: AtomicBool,
    unpublished: AtomicBool,
    persistable: AtomicBool,
    rehydrated: AtomicBool,
}

impl Counter {
    pub const TAG: &'static str = "test.counter";

    pub fn new(name: &str, value: i64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CounterState {
                name: name.to_string(),
                value,
            }),
            fail_encode: AtomicBool::new(false),
            unpublished: AtomicBool::new(false),
            persistable: AtomicBool::new(true),
            rehydrated: AtomicBool::new(false),
        })
    }

    pub fn factory() -> Arc<dyn PersistObject> {
        Self::new("", 0)
    }

    pub fn name(&self) -> String {
        lock(&self.state).name.clone()
    }

    pub fn value(&self) -> i64 {
        lock(&self.state).value
    }

    pub fn set_value(&self, value: i64) {
        lock(&self.state).value = value;
    }

    pub fn set_fail_encode(&self, on: bool) {
        self.fail_encode.store(on, Ordering::SeqCst);
    }

    pub fn set_unpublished(&self, on: bool) {
        self.unpublished.store(on, Ordering::SeqCst);
    }

    pub fn set_persistable(&self, on: bool) {
        self.persistable.store(on, Ordering::SeqCst);
    }

    /// Whether `post_rehydration` ran on this instance.
    pub fn was_rehydrated(&self) -> bool {
        self.rehydrated.load(Ordering::SeqCst)
    }
}

impl PersistObject for Counter {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn encode(&self, out: &mut GraphWriter<'_>) -> Result<()> {
        if self.fail_encode.load(Ordering::SeqCst) {
            return Err(CodecError::Unserializable {
                type_name: Self::TAG.into(),
                reason: "encoding disabled".into(),
            });
        }
        let (name, value) = {
            let s = lock(&self.state);
            (s.name.clone(), s.value)
        };
        out.write_str(&name);
        out.write_i64(value);
        Ok(())
    }

    fn decode_into(&self, input: &mut GraphReader<'_>) -> Result<()> {
        let name = input.read_str()?;
        let value = input.read_i64()?;
        let mut s = lock(&self.state);
        s.name = name;
        s.value = value;
        Ok(())
    }

    fn is_unpublished(&self) -> bool {
        self.unpublished.load(Ordering::SeqCst)
    }

    fn check_rehydration(&self) -> Result<()> {
        if self.value() < 0 {
            return Err(CodecError::Validation {
                type_name: Self::TAG.into(),
                reason: "negative counter".into(),
            });
        }
        Ok(())
    }

    fn post_rehydration(&self) {
        self.rehydrated.store(true, Ordering::SeqCst);
    }

    fn is_persistable(&self) -> bool {
        self.persistable.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct NodeState {
    label: String,
    links: Vec<Arc<dyn PersistObject>>,
}

/// Labelled node with outgoing links.
pub struct Node {
    state: Mutex<NodeState>,
}

impl Node {
    pub const TAG: &'static str = "test.node";

    pub fn new(label: &str, links: Vec<Arc<dyn PersistObject>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NodeState {
                label: label.to_string(),
                links,
            }),
        })
    }

    pub fn factory() -> Arc<dyn PersistObject> {
        Self::new("", Vec::new())
    }

    pub fn label(&self) -> String {
        lock(&self.state).label.clone()
    }

    pub fn set_label(&self, label: &str) {
        lock(&self.state).label = label.to_string();
    }

    pub fn links(&self) -> Vec<Arc<dyn PersistObject>> {
        lock(&self.state).links.clone()
    }

    pub fn push_link(&self, link: Arc<dyn PersistObject>) {
        lock(&self.state).links.push(link);
    }

    /// Drop all links, breaking any cycle through this node.
    pub fn clear_links(&self) {
        lock(&self.state).links.clear();
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = lock(&self.state);
        f.debug_struct("Node")
            .field("label", &s.label)
            .field("links", &s.links.len())
            .finish()
    }
}

impl PersistObject for Node {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn encode(&self, out: &mut GraphWriter<'_>) -> Result<()> {
        let (label, links) = {
            let s = lock(&self.state);
            (s.label.clone(), s.links.clone())
        };
        out.write_str(&label);
        out.write_objects(&links)
    }

    fn decode_into(&self, input: &mut GraphReader<'_>) -> Result<()> {
        let label = input.read_str()?;
        let links = input.read_objects()?;
        let mut s = lock(&self.state);
        s.label = label;
        s.links = links;
        Ok(())
    }
}
