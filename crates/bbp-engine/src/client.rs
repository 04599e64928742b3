//! The client contract: what the engine persists and what it hands back.

use std::fmt;
use std::sync::Arc;

use bbp_codec::PersistObject;
use bbp_types::PersistenceIdentity;

/// Kind of change a tuple records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Remove,
    Change,
    Bulk,
}

/// One change to a client's working set.
#[derive(Clone)]
pub enum EnvelopeTuple {
    Add(Arc<dyn PersistObject>),
    Remove(Arc<dyn PersistObject>),
    Change(Arc<dyn PersistObject>),
    /// Every member is treated as added.
    Bulk(Vec<Arc<dyn PersistObject>>),
}

impl EnvelopeTuple {
    pub fn action(&self) -> Action {
        match self {
            Self::Add(_) => Action::Add,
            Self::Remove(_) => Action::Remove,
            Self::Change(_) => Action::Change,
            Self::Bulk(_) => Action::Bulk,
        }
    }

    /// The objects this tuple touches and whether they end up active.
    pub fn objects(&self) -> Box<dyn Iterator<Item = (&Arc<dyn PersistObject>, bool)> + '_> {
        match self {
            Self::Add(o) | Self::Change(o) => Box::new(std::iter::once((o, true))),
            Self::Remove(o) => Box::new(std::iter::once((o, false))),
            Self::Bulk(objects) => Box::new(objects.iter().map(|o| (o, true))),
        }
    }
}

impl fmt::Debug for EnvelopeTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulk(objects) => write!(f, "Bulk({} objects)", objects.len()),
            Self::Add(o) | Self::Remove(o) | Self::Change(o) => write!(f, "{:?}({o:?})", self.action()),
        }
    }
}

/// An ordered batch of tuples.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    tuples: Vec<EnvelopeTuple>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: Arc<dyn PersistObject>) -> &mut Self {
        self.tuples.push(EnvelopeTuple::Add(object));
        self
    }

    pub fn remove(&mut self, object: Arc<dyn PersistObject>) -> &mut Self {
        self.tuples.push(EnvelopeTuple::Remove(object));
        self
    }

    pub fn change(&mut self, object: Arc<dyn PersistObject>) -> &mut Self {
        self.tuples.push(EnvelopeTuple::Change(object));
        self
    }

    pub fn bulk(&mut self, objects: Vec<Arc<dyn PersistObject>>) -> &mut Self {
        self.tuples.push(EnvelopeTuple::Bulk(objects));
        self
    }

    pub fn tuples(&self) -> &[EnvelopeTuple] {
        &self.tuples
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

impl IntoIterator for Envelope {
    type Item = EnvelopeTuple;
    type IntoIter = std::vec::IntoIter<EnvelopeTuple>;

    fn into_iter(self) -> Self::IntoIter {
        self.tuples.into_iter()
    }
}

/// One item of a client's pending data.
#[derive(Clone, Debug)]
pub enum PersistenceItem {
    Envelope(Envelope),
    Tuple(EnvelopeTuple),
    /// Anything else is kept as an opaque leftover and handed back as-is.
    Object(Arc<dyn PersistObject>),
}

impl From<Envelope> for PersistenceItem {
    fn from(e: Envelope) -> Self {
        Self::Envelope(e)
    }
}

impl From<EnvelopeTuple> for PersistenceItem {
    fn from(t: EnvelopeTuple) -> Self {
        Self::Tuple(t)
    }
}

/// A component whose working set is persisted.
pub trait PersistenceClient: Send + Sync {
    fn identity(&self) -> &PersistenceIdentity;

    /// Everything that changed since the last call. Called once per persist.
    fn persistence_data(&self) -> Vec<PersistenceItem>;
}

/// What rehydration recovered for one client.
#[derive(Clone, Debug, Default)]
pub struct RehydrationData {
    /// An `Add` for every object that was active.
    pub envelope: Envelope,
    /// The client's leftover objects from the last delta.
    pub objects: Vec<Arc<dyn PersistObject>>,
}
