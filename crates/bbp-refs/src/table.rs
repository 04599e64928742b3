//! Identity-keyed reference table.
//!
//! Entries live in a dense arena indexed by [`ReferenceId`]; a chained hash
//! over object addresses gives identity lookup. The table is not internally
//! synchronized: callers hold it behind one coarse lock and every operation
//! takes `&mut self`, which is also what lets lookups unlink dead entries as
//! they pass over them.

use std::fmt;
use std::sync::{Arc, Weak};

use bbp_types::{AssociationState, PersistenceIdentity, ReferenceId};
use tracing::trace;

use crate::error::{RefTableError, Result};

/// Bucket count of a fresh table.
pub const INITIAL_BUCKETS: usize = 123;

/// Binding between a live object and its reference id.
pub struct Association<T: ?Sized> {
    object: Weak<T>,
    id: ReferenceId,
    state: AssociationState,
    marked: bool,
    owner: Option<PersistenceIdentity>,
}

impl<T: ?Sized> Association<T> {
    fn new(object: &Arc<T>, id: ReferenceId) -> Self {
        Self {
            object: Arc::downgrade(object),
            id,
            state: AssociationState::New,
            marked: false,
            owner: None,
        }
    }

    pub fn id(&self) -> ReferenceId {
        self.id
    }

    /// The object, if anything besides the table still holds it.
    pub fn object(&self) -> Option<Arc<T>> {
        self.object.upgrade()
    }

    pub fn is_dead(&self) -> bool {
        self.object.strong_count() == 0
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn set_state(&mut self, state: AssociationState) {
        self.state = state;
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Marked associations are scheduled to be written in full by the next delta.
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    pub fn set_marked(&mut self, marked: bool) {
        self.marked = marked;
    }

    pub fn owner(&self) -> Option<&PersistenceIdentity> {
        self.owner.as_ref()
    }

    pub fn set_owner(&mut self, owner: Option<PersistenceIdentity>) {
        self.owner = owner;
    }
}

impl<T: ?Sized> fmt::Debug for Association<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("marked", &self.marked)
            .field("owner", &self.owner)
            .field("dead", &self.is_dead())
            .finish()
    }
}

struct Slot<T: ?Sized> {
    assoc: Association<T>,
    addr: usize,
    next: Option<usize>,
}

/// Identity-keyed table of [`Association`]s.
pub struct ReferenceTable<T: ?Sized> {
    slots: Vec<Option<Slot<T>>>,
    buckets: Vec<Option<usize>>,
    count: usize,
    next_id: ReferenceId,
    retained: Option<Vec<Arc<T>>>,
}

fn address_of<T: ?Sized>(object: &Arc<T>) -> usize {
    Arc::as_ptr(object).cast::<()>() as usize
}

impl<T: ?Sized> ReferenceTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            buckets: vec![None; INITIAL_BUCKETS],
            count: 0,
            next_id: ReferenceId::new(0),
            retained: None,
        }
    }

    /// Number of live associations (dead ones not yet swept may be counted).
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Id the next `find_or_create` will assign.
    pub fn next_id(&self) -> ReferenceId {
        self.next_id
    }

    pub fn set_next_id(&mut self, id: ReferenceId) {
        self.next_id = id;
    }

    /// Look up the association of `object` by identity.
    pub fn find(&mut self, object: &Arc<T>) -> Option<&mut Association<T>> {
        let idx = self.lookup(object)?;
        self.slots[idx].as_mut().map(|slot| &mut slot.assoc)
    }

    /// Bind `object` to a specific id.
    ///
    /// Fails if the id already binds a live object. A slot whose object has
    /// died is reclaimed first.
    pub fn create(&mut self, object: &Arc<T>, id: ReferenceId) -> Result<&mut Association<T>> {
        if let Some(Some(slot)) = self.slots.get(id.index()) {
            if !slot.assoc.is_dead() {
                return Err(RefTableError::SlotOccupied { id });
            }
            self.remove_slot(id.index());
        }
        if id >= self.next_id {
            self.next_id = id.next();
        }
        if let Some(retained) = self.retained.as_mut() {
            retained.push(Arc::clone(object));
        }
        Ok(self.insert(object, id))
    }

    /// Return the association of `object`, creating one under the next id if needed.
    pub fn find_or_create(&mut self, object: &Arc<T>) -> &mut Association<T> {
        let idx = match self.lookup(object) {
            Some(idx) => idx,
            None => {
                let id = self.next_id;
                self.next_id = id.next();
                trace!(id = id.value(), "new association");
                self.insert(object, id);
                id.index()
            }
        };
        // Slot was found or inserted just above.
        match self.slots[idx].as_mut() {
            Some(slot) => &mut slot.assoc,
            None => unreachable!("slot {idx} vanished"),
        }
    }

    /// Look up an association by id. Dead entries are unlinked and reported absent.
    pub fn get(&mut self, id: ReferenceId) -> Option<&mut Association<T>> {
        let idx = id.index();
        let dead = self.slots.get(idx)?.as_ref()?.assoc.is_dead();
        if dead {
            self.remove_slot(idx);
            return None;
        }
        self.slots[idx].as_mut().map(|slot| &mut slot.assoc)
    }

    /// Live associations in ascending id order.
    pub fn iter(&mut self) -> impl Iterator<Item = &Association<T>> {
        self.sweep();
        self.slots.iter().flatten().map(|slot| &slot.assoc)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Association<T>> {
        self.sweep();
        self.slots.iter_mut().flatten().map(|slot| &mut slot.assoc)
    }

    /// Drop every association. Id numbering is left untouched.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.buckets = vec![None; INITIAL_BUCKETS];
        self.count = 0;
    }

    /// Unlink every association whose object has died. Returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let dead: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().filter(|s| s.assoc.is_dead()).map(|_| idx))
            .collect();
        for &idx in &dead {
            self.remove_slot(idx);
        }
        if !dead.is_empty() {
            trace!(removed = dead.len(), "swept dead associations");
        }
        dead.len()
    }

    /// Clear the marked flag on every association.
    pub fn clear_marks(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.assoc.marked = false;
        }
    }

    /// Start holding strong references to every object bound through `create`.
    ///
    /// Used while rehydrating, when freshly allocated objects have no other
    /// owner until they are handed back to their clients.
    pub fn begin_retention(&mut self) {
        self.retained = Some(Vec::new());
    }

    /// Stop retaining and hand back everything retained so far.
    pub fn end_retention(&mut self) -> Vec<Arc<T>> {
        self.retained.take().unwrap_or_default()
    }

    fn bucket_of(&self, addr: usize) -> usize {
        // Arc allocations are at least word aligned; the low bits carry nothing.
        let h = (addr >> 3) ^ (addr >> 17);
        h % self.buckets.len()
    }

    fn lookup(&mut self, object: &Arc<T>) -> Option<usize> {
        let addr = address_of(object);
        let mut cursor = self.buckets[self.bucket_of(addr)];
        let mut dead = Vec::new();
        let mut found = None;
        while let Some(idx) = cursor {
            let Some(slot) = self.slots[idx].as_ref() else {
                break;
            };
            if slot.assoc.is_dead() {
                dead.push(idx);
            } else if slot.addr == addr {
                found = Some(idx);
                break;
            }
            cursor = slot.next;
        }
        for idx in dead {
            self.remove_slot(idx);
        }
        found
    }

    fn insert(&mut self, object: &Arc<T>, id: ReferenceId) -> &mut Association<T> {
        self.count += 1;
        if self.count > self.buckets.len() * 3 / 4 {
            self.rehash();
        }
        let idx = id.index();
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        let addr = address_of(object);
        let bucket = self.bucket_of(addr);
        let next = self.buckets[bucket];
        self.buckets[bucket] = Some(idx);
        let slot = self.slots[idx].insert(Slot {
            assoc: Association::new(object, id),
            addr,
            next,
        });
        &mut slot.assoc
    }

    fn rehash(&mut self) {
        let len = self.buckets.len() * 2 + 1;
        trace!(buckets = len, "rehash reference table");
        self.buckets = vec![None; len];
        for idx in 0..self.slots.len() {
            let Some(addr) = self.slots[idx].as_ref().map(|s| s.addr) else {
                continue;
            };
            let bucket = self.bucket_of(addr);
            let head = self.buckets[bucket];
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.next = head;
            }
            self.buckets[bucket] = Some(idx);
        }
    }

    fn remove_slot(&mut self, idx: usize) {
        let Some(slot) = self.slots.get_mut(idx).and_then(Option::take) else {
            return;
        };
        self.count -= 1;
        let bucket = self.bucket_of(slot.addr);
        if self.buckets[bucket] == Some(idx) {
            self.buckets[bucket] = slot.next;
            return;
        }
        let mut cursor = self.buckets[bucket];
        while let Some(prev) = cursor {
            let Some(prev_slot) = self.slots[prev].as_mut() else {
                break;
            };
            if prev_slot.next == Some(idx) {
                prev_slot.next = slot.next;
                return;
            }
            cursor = prev_slot.next;
        }
    }
}

impl<T: ?Sized> Default for ReferenceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for ReferenceTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("count", &self.count)
            .field("buckets", &self.buckets.len())
            .field("next_id", &self.next_id)
            .field("retaining", &self.retained.is_some())
            .finish()
    }
}
