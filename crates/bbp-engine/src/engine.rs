//! The persistence engine: persist and rehydrate one agent's working set.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bbp_codec::{read_delta, write_delta, ClientMap, ObjectTable, PersistObject, TypeRegistry};
use bbp_media::{open_medium, MediumSettings, NoOpMedium, StorageMedium};
use bbp_types::{format_delta_number, now_millis, AssociationState, PersistenceIdentity, ReferenceId, SequenceNumbers};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn};

use crate::client::{EnvelopeTuple, PersistenceClient, PersistenceItem, RehydrationData};
use crate::config::{PersistenceConfig, DUMMY_MEDIUM_NAME, MAX_PERSISTENCE_INTERVAL};
use crate::control::{
    control_range, ControlRange, CONTROL_ARCHIVE_COUNT, CONTROL_CONSOLIDATION_PERIOD, CONTROL_INTERVAL,
    MEDIA_CONTROLS,
};
use crate::error::{PersistError, Result};
use crate::metrics::{PersistenceMetric, PersistenceMetrics};
use crate::protection::{DataProtection, KeyEnvelope};
use crate::rehydration::{sort_for_replay, RehydrationSet};
use crate::schedule::{combined_interval, select_next, MediumSlot};

/// Serializes graph walks across every engine in the process. Object graphs
/// may be shared between agents, and a walk mutates the marks it meets.
static GRAPH_WALK_LOCK: Mutex<()> = Mutex::new(());

/// A full delta handed to the caller instead of (or as well as) a medium.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistenceSnapshot {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct Attempt {
    delta: Option<u32>,
    bytes: usize,
    /// Slot the delta went to.
    slot: Option<usize>,
}

/// What one round of gathering queued for the delta.
#[derive(Default)]
struct Pending {
    queue: Vec<ReferenceId>,
    // Strong refs keep objects only the table knows about alive until written.
    keep_alive: Vec<Arc<dyn PersistObject>>,
}

impl Pending {
    fn push(&mut self, id: ReferenceId, object: Arc<dyn PersistObject>) {
        self.queue.push(id);
        self.keep_alive.push(object);
    }
}

/// Persists the working set of one agent to its media and restores it.
pub struct PersistenceEngine {
    config: PersistenceConfig,
    registry: TypeRegistry,
    table: ObjectTable,
    slots: Vec<MediumSlot>,
    current: Option<usize>,
    sequence: Option<SequenceNumbers>,
    previous_failed: bool,
    is_dummy: bool,
    has_media: bool,
    clients: BTreeMap<PersistenceIdentity, Arc<dyn PersistenceClient>>,
    protection: Option<Arc<dyn DataProtection>>,
    rehydration: Option<HashMap<PersistenceIdentity, RehydrationData>>,
    metrics: PersistenceMetrics,
    previous_persistence_time: i64,
    next_persistence_time: Option<i64>,
}

impl PersistenceEngine {
    /// Open every configured medium and build the engine.
    pub fn open(config: PersistenceConfig, registry: TypeRegistry) -> Result<Self> {
        config.validate()?;
        if config.clear_on_start {
            info!(agent = %config.agent, "clearing old persistence data");
        }
        let mut media = Vec::with_capacity(config.media.len());
        for medium in &config.media {
            media.push(open_medium(
                medium,
                &config.agent,
                config.persistence_interval,
                config.consolidation_period,
                config.clear_on_start,
            )?);
        }
        Self::from_media(config, registry, media)
    }

    /// Build the engine over media opened by the caller. `config.media` is
    /// ignored.
    pub fn from_media(
        config: PersistenceConfig,
        registry: TypeRegistry,
        mut media: Vec<Box<dyn StorageMedium>>,
    ) -> Result<Self> {
        config.validate()?;
        let mut names: Vec<&str> = media.iter().map(|m| m.name()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(PersistError::Config(format!("duplicate medium name: {}", dup[0])));
        }

        if !config.is_writable() {
            for medium in &mut media {
                medium.settings_mut().writable = false;
            }
        }
        let has_media = !media.is_empty();
        let is_dummy = !media.iter().any(|m| m.is_writable());
        if is_dummy {
            let mut settings = MediumSettings::new(DUMMY_MEDIUM_NAME);
            settings.persistence_interval = MAX_PERSISTENCE_INTERVAL;
            settings.consolidation_period = config.consolidation_period;
            media.push(Box::new(NoOpMedium::new(settings)));
            info!(agent = %config.agent, "no writable medium, persistence disabled");
        }

        let now = now_millis();
        let slots: Vec<MediumSlot> = media.into_iter().map(|m| MediumSlot::new(m, now)).collect();
        info!(
            agent = %config.agent,
            media = ?slots.iter().map(MediumSlot::name).collect::<Vec<_>>(),
            "persistence engine ready"
        );
        Ok(Self {
            config,
            registry,
            table: ObjectTable::new(),
            slots,
            current: None,
            sequence: None,
            previous_failed: false,
            is_dummy,
            has_media,
            clients: BTreeMap::new(),
            protection: None,
            rehydration: None,
            metrics: PersistenceMetrics::new(),
            previous_persistence_time: now,
            next_persistence_time: None,
        })
    }

    pub fn with_data_protection(mut self, protection: Arc<dyn DataProtection>) -> Self {
        self.protection = Some(protection);
        self
    }

    pub fn register_client(&mut self, client: Arc<dyn PersistenceClient>) {
        debug!(client = %client.identity(), "client registered");
        self.clients.insert(client.identity().clone(), client);
    }

    pub fn unregister_client(&mut self, client: &PersistenceIdentity) -> Option<Arc<dyn PersistenceClient>> {
        self.clients.remove(client)
    }

    pub fn agent(&self) -> &str {
        &self.config.agent
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// True when no medium is writable and persisting does nothing.
    pub fn is_dummy(&self) -> bool {
        self.is_dummy
    }

    pub fn metrics(&self) -> &PersistenceMetrics {
        &self.metrics
    }

    /// Live range of the medium written last, once known.
    pub fn sequence_numbers(&self) -> Option<SequenceNumbers> {
        self.sequence
    }

    /// Medium the next incremental delta goes to.
    pub fn current_medium(&self) -> Option<&str> {
        self.current.map(|i| self.slots[i].name())
    }

    /// Associations in the reference table, including dead ones not yet swept.
    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// When the next delta is due: the previous persist plus the combined
    /// interval of all writable media.
    pub fn persistence_time(&mut self) -> DateTime<Utc> {
        let next = match self.next_persistence_time {
            Some(next) => next,
            None => {
                let interval = combined_interval(&self.slots).unwrap_or(Duration::MAX);
                let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
                debug!(interval_ms, "persistence interval");
                let next = self.previous_persistence_time.saturating_add(interval_ms);
                self.next_persistence_time = Some(next);
                next
            }
        };
        DateTime::from_timestamp_millis(next).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// What the last rehydration recovered for `client`. `None` when nothing
    /// was rehydrated.
    pub fn rehydration_data(&self, client: &PersistenceIdentity) -> Option<RehydrationData> {
        let result = self.rehydration.as_ref()?;
        Some(result.get(client).cloned().unwrap_or_default())
    }

    /// Write one delta.
    ///
    /// The delta is full when `full` or `return_bytes` is set, when it is the
    /// first one, when the previous attempt failed, or when the medium's
    /// consolidation period is up. With `return_bytes` the framed delta is
    /// also returned.
    pub fn persist(&mut self, return_bytes: bool, full: bool) -> Result<Option<PersistenceSnapshot>> {
        if self.is_dummy && !return_bytes {
            return Ok(None);
        }
        let started = Utc::now();
        let mut full = full || return_bytes;
        self.next_persistence_time = None;
        info!(agent = %self.config.agent, "persist started");

        let mut attempt = Attempt::default();
        let outcome = self.persist_delta(return_bytes, &mut full, &mut attempt);
        if let Err(PersistError::OwnershipLost { medium }) = &outcome {
            error!(agent = %self.config.agent, %medium, "medium taken over by another instance, not persisting");
            return outcome;
        }

        if self.is_dummy {
            self.table.clear();
        }
        self.previous_persistence_time = now_millis();
        let medium = match attempt.slot.or(self.current) {
            Some(cur) => {
                self.slots[cur].advance();
                self.slots[cur].name().to_string()
            }
            None => "-".to_string(),
        };
        if let Err(e) = &outcome {
            error!(agent = %self.config.agent, error = %e, "persist failed");
            self.previous_failed = true;
        }

        let metric = PersistenceMetric {
            name: attempt.delta.map_or_else(|| "-".to_string(), format_delta_number),
            medium,
            started,
            finished: Utc::now(),
            bytes: attempt.bytes,
            full,
            failure: outcome.as_ref().err().map(ToString::to_string),
        };
        info!(agent = %self.config.agent, %metric, "persist finished");
        self.metrics.record(metric);
        outcome
    }

    /// One persist attempt. Nothing but the marks of newly gathered objects
    /// changes unless the delta commits.
    fn persist_delta(
        &mut self,
        return_bytes: bool,
        full: &mut bool,
        attempt: &mut Attempt,
    ) -> Result<Option<PersistenceSnapshot>> {
        let chain = self.current;
        let outcome = self.write_next_delta(return_bytes, full, attempt);
        if outcome.is_err() {
            self.current = chain;
        }
        outcome
    }

    fn write_next_delta(
        &mut self,
        return_bytes: bool,
        full: &mut bool,
        attempt: &mut Attempt,
    ) -> Result<Option<PersistenceSnapshot>> {
        let mut pending = Pending::default();
        for assoc in self.table.iter() {
            if !assoc.is_marked() {
                continue;
            }
            if let Some(object) = assoc.object() {
                info!(id = %assoc.id(), "previously marked");
                pending.push(assoc.id(), object);
            }
        }

        let (mut seq, mut superseded) = match self.sequence {
            Some(seq) => (seq, Vec::new()),
            None => self.initial_sequence_numbers(),
        };
        if self.previous_failed {
            *full = true;
            self.previous_failed = false;
        }
        if seq.current == 0 {
            *full = true;
        }
        if !*full {
            if let Some(cur) = self.current {
                let period = self.slots[cur].medium.consolidation_period();
                if seq.len() + 1 >= period {
                    debug!(medium = %self.slots[cur].name(), period, "consolidating");
                    *full = true;
                }
            }
        }
        if *full || self.current.is_none() {
            if let Some(cur) = self.current {
                // The full delta supersedes this chain; its first delta stays as an archive.
                superseded.push((cur, SequenceNumbers::new(seq.first + 1, seq.current, seq.timestamp)));
            }
            seq.first = seq.current;
            self.current = select_next(&mut self.slots, now_millis());
        }
        let cur = self.current.ok_or(PersistError::NoWritableMedium)?;
        attempt.slot = Some(cur);
        if !self.slots[cur].medium.check_ownership()? {
            return Err(PersistError::OwnershipLost {
                medium: self.slots[cur].name().to_string(),
            });
        }
        if seq.current == seq.first {
            *full = true;
        }

        let clients = self.gather_client_data(*full, &mut pending);
        if *full {
            let swept = self.table.sweep();
            trace!(swept, "swept before full delta");
            for assoc in self.table.iter_mut() {
                if assoc.is_marked() {
                    continue;
                }
                if let Some(object) = assoc.object() {
                    assoc.set_marked(true);
                    pending.push(assoc.id(), object);
                }
            }
        }

        let delta = seq.current;
        attempt.delta = Some(delta);
        let encoded = {
            info!(delta, "obtaining graph walk lock");
            let _walk = GRAPH_WALK_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
            write_delta(&mut self.table, &pending.queue, &clients)?
        };
        attempt.bytes = encoded.bytes.len();
        info!(
            delta,
            full = *full,
            bytes = encoded.bytes.len(),
            written = encoded.written,
            skipped = encoded.skipped,
            "serialized delta"
        );

        let snapshot = return_bytes.then(|| PersistenceSnapshot {
            name: format!("Persistence state {delta}"),
            bytes: encoded.bytes.clone(),
        });

        let slot = &mut self.slots[cur];
        match write_and_commit(slot, self.protection.as_deref(), seq, *full, encoded.bytes) {
            Ok(committed) => seq = committed,
            Err(e) => {
                if let Err(abort) = slot.medium.abort_output_stream(&seq) {
                    warn!(medium = %slot.name(), error = %abort, "abort failed");
                }
                return Err(e);
            }
        }
        self.sequence = Some(seq);
        for (old, range) in superseded {
            self.slots[old].schedule_cleanup(range);
        }

        let slot = &mut self.slots[cur];
        if !slot.cleanup.is_empty() {
            for cleanup in std::mem::take(&mut slot.cleanup) {
                info!(medium = %slot.name(), %cleanup, "consolidated deltas");
                if let Err(e) = slot.medium.cleanup_old_deltas(&cleanup) {
                    error!(medium = %slot.name(), error = %e, "failed to delete old deltas");
                }
            }
            if let Err(e) = slot.medium.cleanup_archive(&seq) {
                error!(medium = %slot.name(), error = %e, "failed to delete old archives");
            }
        }

        for id in &pending.queue {
            if let Some(assoc) = self.table.get(*id) {
                assoc.set_marked(false);
            }
        }
        Ok(snapshot)
    }

    /// Start numbering after the highest delta any medium has. Also returns
    /// the incrementals of each writable medium's live chain, which the first
    /// full delta supersedes.
    fn initial_sequence_numbers(&mut self) -> (SequenceNumbers, Vec<(usize, SequenceNumbers)>) {
        let mut highest = 0;
        let mut superseded = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot.medium.read_sequence_numbers("") {
                Ok(sets) => {
                    highest = sets.iter().map(|s| s.current).fold(highest, u32::max);
                    // Archives are copies of earlier live ranges, so the live one reaches furthest.
                    let Some(live) = sets.iter().max_by_key(|s| (s.current, s.first)) else {
                        continue;
                    };
                    if slot.medium.is_writable() {
                        superseded.push((i, SequenceNumbers::new(live.first + 1, live.current, live.timestamp)));
                    }
                }
                Err(e) => warn!(medium = %slot.name(), error = %e, "cannot read sequence numbers"),
            }
        }
        (SequenceNumbers::new(highest, highest, now_millis()), superseded)
    }

    /// Route every client's pending data through the table. Returns the
    /// leftover objects per client.
    fn gather_client_data(&mut self, full: bool, pending: &mut Pending) -> ClientMap {
        let mut data = ClientMap::new();
        for (id, client) in &self.clients {
            let items = client.persistence_data();
            trace!(client = %id, items = items.len(), "client data");
            let leftovers = data.entry(id.clone()).or_default();
            if let Err(e) = add_items(&mut self.table, id, items, full, pending, leftovers) {
                error!(client = %id, error = %e, "failed to gather persistence data");
            }
        }
        data
    }

    /// Restore state from `snapshot`, or else from the newest rehydration set
    /// that replays cleanly. Returns whether anything was restored.
    ///
    /// A candidate that fails part way is discarded and the next older one
    /// is tried; when all fail the engine starts empty.
    pub fn rehydrate(&mut self, snapshot: Option<&PersistenceSnapshot>) -> Result<bool> {
        if snapshot.is_none() && !self.has_media {
            return Ok(false);
        }
        self.table.begin_retention();
        let replayed = self.replay(snapshot);
        let restored = match replayed {
            Ok(Some(clients)) => {
                self.distribute(clients);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.table = ObjectTable::new();
                return Err(e);
            }
        };
        let retained = self.table.end_retention();
        trace!(retained = retained.len(), "rehydration retention released");
        Ok(restored)
    }

    fn replay(&mut self, snapshot: Option<&PersistenceSnapshot>) -> Result<Option<ClientMap>> {
        if let Some(snapshot) = snapshot {
            info!(agent = %self.config.agent, snapshot = %snapshot.name, "rehydrating from snapshot");
            let contents = read_delta(&mut self.table, &self.registry, &snapshot.bytes, true)?;
            return Ok(Some(contents.clients.unwrap_or_default()));
        }

        let suffix = self.config.archive_suffix().to_string();
        let sets = self.rehydration_sets(&suffix);
        for set in &sets {
            info!(agent = %self.config.agent, %set, "rehydrating");
            match self.replay_set(set) {
                Ok(clients) => return Ok(Some(clients)),
                Err(e) => {
                    error!(agent = %self.config.agent, %set, error = %e, "rehydration failed");
                    self.table = ObjectTable::new();
                    self.table.begin_retention();
                }
            }
        }
        if !sets.is_empty() {
            error!(agent = %self.config.agent, "rehydration failed, starting over from scratch");
        }
        Ok(None)
    }

    /// Every candidate on every medium, in replay order.
    pub fn rehydration_sets(&mut self, suffix: &str) -> Vec<RehydrationSet> {
        let mut sets = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            match slot.medium.read_sequence_numbers(suffix) {
                Ok(found) => sets.extend(found.into_iter().map(|sequence| RehydrationSet {
                    slot: i,
                    medium: slot.name().to_string(),
                    sequence,
                })),
                Err(e) => warn!(medium = %slot.name(), suffix, error = %e, "cannot read sequence numbers"),
            }
        }
        sort_for_replay(&mut sets);
        sets
    }

    fn replay_set(&mut self, set: &RehydrationSet) -> Result<ClientMap> {
        let seq = set.sequence;
        if seq.is_empty() {
            return Err(PersistError::Rehydration(format!("empty range {seq}")));
        }
        let last = seq.current - 1;
        let slot = &mut self.slots[set.slot];
        for delta in seq.deltas() {
            let mut bytes = Vec::new();
            slot.medium.open_input_stream(delta)?.read_to_end(&mut bytes)?;
            slot.medium.finish_input_stream(delta)?;
            if let Some(protection) = &self.protection {
                let mut keys = KeyEnvelope::new(slot.medium.as_mut(), delta);
                bytes = protection.unprotect(&mut keys, bytes)?;
            }
            let contents = read_delta(&mut self.table, &self.registry, &bytes, delta == last)?;
            debug!(medium = %set.medium, delta, associations = contents.associations.len(), "delta replayed");
            if delta == last {
                return Ok(contents.clients.unwrap_or_default());
            }
        }
        Err(PersistError::Rehydration(format!("no final delta in {seq}")))
    }

    /// Hand active objects and leftovers back to their owners.
    fn distribute(&mut self, clients: ClientMap) {
        let mut result: HashMap<PersistenceIdentity, RehydrationData> = HashMap::new();
        for assoc in self.table.iter() {
            let (Some(object), Some(owner)) = (assoc.object(), assoc.owner()) else {
                continue;
            };
            if assoc.is_active() {
                trace!(client = %owner, id = %assoc.id(), "restored");
                object.post_rehydration();
                result.entry(owner.clone()).or_default().envelope.add(object);
            } else {
                trace!(client = %owner, id = %assoc.id(), "inactive");
            }
        }
        for (client, objects) in clients {
            result.entry(client).or_default().objects = objects;
        }
        self.table.clear_marks();
        info!(agent = %self.config.agent, clients = result.len(), "rehydrated");
        self.rehydration = Some(result);
    }

    /// Visit the key envelope of every delta that can still be replayed.
    pub fn visit_key_envelopes(&mut self, mut visit: impl FnMut(&mut KeyEnvelope<'_>) -> Result<()>) -> Result<()> {
        for set in self.rehydration_sets("") {
            let slot = &mut self.slots[set.slot];
            for delta in set.sequence.deltas() {
                visit(&mut KeyEnvelope::new(slot.medium.as_mut(), delta))?;
            }
        }
        Ok(())
    }

    pub fn media_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn media_control_names(&self, medium: &str) -> Result<&'static [&'static str]> {
        self.slot_index(medium)?;
        Ok(MEDIA_CONTROLS)
    }

    pub fn media_control_range(&self, medium: &str, control: &str) -> Result<ControlRange> {
        self.slot_index(medium)?;
        control_range(control).ok_or_else(|| PersistError::NoSuchControl {
            medium: medium.to_string(),
            control: control.to_string(),
        })
    }

    pub fn media_control_value(&self, medium: &str, control: &str) -> Result<u64> {
        let range = self.media_control_range(medium, control)?;
        let m = &self.slots[self.slot_index(medium)?].medium;
        Ok(match control {
            CONTROL_INTERVAL => m.persistence_interval().as_millis() as u64,
            CONTROL_CONSOLIDATION_PERIOD => u64::from(m.consolidation_period()),
            _ => m.archive_count().map_or(range.max, u64::from),
        })
    }

    /// Change one control of one medium. Interval changes keep the medium
    /// proportionally as far ahead or behind schedule as it was.
    pub fn set_media_control(&mut self, medium: &str, control: &str, value: u64) -> Result<()> {
        let range = self.media_control_range(medium, control)?;
        if !range.contains(value) {
            return Err(PersistError::ControlOutOfRange {
                control: control.to_string(),
                value,
                min: range.min,
                max: range.max,
            });
        }
        let i = self.slot_index(medium)?;
        let slot = &mut self.slots[i];
        match control {
            CONTROL_INTERVAL => {
                slot.set_interval(Duration::from_millis(value), now_millis());
                self.next_persistence_time = None;
            }
            CONTROL_CONSOLIDATION_PERIOD => {
                slot.medium.settings_mut().consolidation_period = value as u32;
            }
            CONTROL_ARCHIVE_COUNT => {
                slot.medium.settings_mut().archive_count = (value < range.max).then_some(value as u32);
            }
            _ => unreachable!("range lookup accepted an unknown control"),
        }
        info!(medium, control, value, "media control changed");
        Ok(())
    }

    fn slot_index(&self, medium: &str) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| s.name() == medium)
            .ok_or_else(|| PersistError::NoSuchMedium(medium.to_string()))
    }
}

/// Write the framed delta to the slot's medium and commit it. Returns the
/// sequence numbers advanced past the new delta.
fn write_and_commit(
    slot: &mut MediumSlot,
    protection: Option<&dyn DataProtection>,
    seq: SequenceNumbers,
    full: bool,
    mut bytes: Vec<u8>,
) -> Result<SequenceNumbers> {
    let delta = seq.current;
    if let Some(protection) = protection {
        let mut keys = KeyEnvelope::new(slot.medium.as_mut(), delta);
        bytes = protection.protect(&mut keys, bytes)?;
    }
    let mut sink = slot.medium.open_output_stream(delta, full)?;
    sink.write_all(&bytes)?;
    sink.close()?;

    let mut next = seq;
    next.current += 1;
    next.timestamp = now_millis();
    slot.medium.lock_ownership()?;
    let committed = slot.medium.finish_output_stream(&next, full);
    let unlocked = slot.medium.unlock_ownership();
    committed?;
    unlocked?;
    debug!(medium = %slot.name(), %next, full, "delta committed");
    Ok(next)
}

fn add_items(
    table: &mut ObjectTable,
    client: &PersistenceIdentity,
    items: Vec<PersistenceItem>,
    full: bool,
    pending: &mut Pending,
    leftovers: &mut Vec<Arc<dyn PersistObject>>,
) -> Result<()> {
    for item in items {
        match item {
            PersistenceItem::Envelope(envelope) => {
                for tuple in envelope {
                    add_tuple(table, client, &tuple, full, pending)?;
                }
            }
            PersistenceItem::Tuple(tuple) => add_tuple(table, client, &tuple, full, pending)?,
            PersistenceItem::Object(object) => {
                if object.is_persistable() {
                    leftovers.push(object);
                }
            }
        }
    }
    Ok(())
}

fn add_tuple(
    table: &mut ObjectTable,
    client: &PersistenceIdentity,
    tuple: &EnvelopeTuple,
    full: bool,
    pending: &mut Pending,
) -> Result<()> {
    for (object, active) in tuple.objects() {
        if !object.is_persistable() {
            continue;
        }
        let assoc = table.find_or_create(object);
        match assoc.owner() {
            None => assoc.set_owner(Some(client.clone())),
            Some(owner) if owner != client => {
                return Err(PersistError::NotOwner {
                    client: client.clone(),
                    owner: owner.clone(),
                });
            }
            Some(_) => {}
        }
        assoc.set_state(if active {
            AssociationState::Active
        } else {
            AssociationState::Inactive
        });
        trace!(%client, id = %assoc.id(), action = ?tuple.action(), "gathered");
        let id = assoc.id();
        if !full && !assoc.is_marked() {
            assoc.set_marked(true);
            pending.queue.push(id);
        }
        pending.keep_alive.push(Arc::clone(object));
    }
    Ok(())
}
