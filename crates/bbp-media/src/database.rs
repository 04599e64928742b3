//! Database medium backed by redb.
//!
//! Every agent gets its own delta table named `{medium}_{agent}` (dashes in
//! the agent name become underscores), keyed by delta number. Each row is a
//! `(status, timestamp, data)` tuple: the one-letter [`DeltaStatus`] code,
//! the write time in epoch millis, and the delta bytes.
//! Keys of the data protection hook live in a companion `{table}_keys`
//! table, and a shared `bbp_owners` table records which instance owns each
//! delta table.
//!
//! A redb file can only be opened once per process, so all media using the
//! same file share one [`ConnectionGate`]. Its [`Connection`] guard gives one
//! caller at a time exclusive use of the database.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::ThreadId;

use bbp_types::{now_millis, parse_delta_suffix, DataProtectionKey, DeltaStatus, SequenceNumbers};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MediaError, Result};
use crate::medium::{excess_archives, DeltaSink, MediumSettings, StorageMedium};

const OWNERS: TableDefinition<&str, &str> = TableDefinition::new("bbp_owners");

type BlobTable<'a> = TableDefinition<'a, u32, &'static [u8]>;

type DeltaTable<'a> = TableDefinition<'a, u32, (&'static str, i64, &'static [u8])>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn status_of(code: &str) -> Result<DeltaStatus> {
    let mut chars = code.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(DeltaStatus::from_code(c)?),
        _ => Err(MediaError::Serialization(format!("bad delta status {code:?}"))),
    }
}

/// The single shared handle to one redb file.
pub struct ConnectionGate {
    path: PathBuf,
    db: Database,
    holder: Mutex<Option<ThreadId>>,
    released: Condvar,
}

fn gates() -> &'static Mutex<HashMap<PathBuf, Weak<ConnectionGate>>> {
    static GATES: OnceLock<Mutex<HashMap<PathBuf, Weak<ConnectionGate>>>> = OnceLock::new();
    GATES.get_or_init(|| Mutex::new(HashMap::new()))
}

impl ConnectionGate {
    /// The process-wide gate for the database at `path`, opening it if needed.
    pub fn shared(path: &Path) -> Result<Arc<Self>> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| MediaError::Configuration(format!("not a database file: {}", path.display())))?;
        let key = parent.canonicalize()?.join(file_name);

        let mut gates = lock(gates());
        if let Some(gate) = gates.get(&key).and_then(Weak::upgrade) {
            return Ok(gate);
        }
        let db = Database::create(&key)?;
        info!(path = %key.display(), "database opened");
        let gate = Arc::new(Self {
            path: key.clone(),
            db,
            holder: Mutex::new(None),
            released: Condvar::new(),
        });
        gates.insert(key, Arc::downgrade(&gate));
        Ok(gate)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take exclusive use of the database, waiting for the current holder.
    ///
    /// Asking again from the thread that already holds it is an error.
    pub fn acquire(self: &Arc<Self>) -> Result<Connection> {
        let me = std::thread::current().id();
        let mut holder = lock(&self.holder);
        loop {
            match *holder {
                None => break,
                Some(t) if t == me => return Err(MediaError::ReentrantConnection),
                Some(_) => {
                    holder = self
                        .released
                        .wait(holder)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        *holder = Some(me);
        Ok(Connection {
            gate: Arc::clone(self),
        })
    }
}

impl std::fmt::Debug for ConnectionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGate").field("path", &self.path).finish()
    }
}

/// Exclusive use of a shared database; released on drop.
pub struct Connection {
    gate: Arc<ConnectionGate>,
}

impl Deref for Connection {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.gate.db
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        *lock(&self.gate.holder) = None;
        self.gate.released.notify_one();
    }
}

/// Storage medium keeping deltas as rows of a redb table.
pub struct DatabaseMedium {
    settings: MediumSettings,
    gate: Arc<ConnectionGate>,
    table: String,
    keys_table: String,
    instance_id: String,
}

impl DatabaseMedium {
    pub fn open(settings: MediumSettings, path: &Path, agent: &str, clear: bool) -> Result<Self> {
        let gate = ConnectionGate::shared(path)?;
        let table = format!("{}_{}", settings.name, agent.replace('-', "_"));
        let keys_table = format!("{table}_keys");
        let mut medium = Self {
            settings,
            gate,
            table,
            keys_table,
            instance_id: Uuid::now_v7().simple().to_string(),
        };

        {
            let conn = medium.connection()?;
            let txn = conn.begin_write()?;
            {
                let _t = txn.open_table(medium.deltas())?;
                let _k = txn.open_table(medium.keys())?;
                let mut owners = txn.open_table(OWNERS)?;
                owners.insert(medium.table.as_str(), medium.instance_id.as_str())?;
            }
            txn.commit()?;
        }
        if clear {
            medium.delete_all()?;
        }
        info!(medium = %medium.settings.name, table = %medium.table, "database medium opened");
        Ok(medium)
    }

    /// Exclusive use of the shared database handle.
    pub fn connection(&self) -> Result<Connection> {
        self.gate.acquire()
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn deltas(&self) -> DeltaTable<'_> {
        TableDefinition::new(&self.table)
    }

    fn keys(&self) -> BlobTable<'_> {
        TableDefinition::new(&self.keys_table)
    }

    fn rows(&self) -> Result<Vec<(u32, DeltaStatus, i64)>> {
        let conn = self.connection()?;
        let txn = conn.begin_read()?;
        let table = txn.open_table(self.deltas())?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (code, timestamp, _) = v.value();
            out.push((k.value(), status_of(code)?, timestamp));
        }
        Ok(out)
    }

    fn delete_rows(&self, deltas: impl Iterator<Item = u32>) -> Result<usize> {
        let conn = self.connection()?;
        let txn = conn.begin_write()?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(self.deltas())?;
            let mut keys = txn.open_table(self.keys())?;
            for delta in deltas {
                if table.remove(delta)?.is_some() {
                    removed += 1;
                }
                keys.remove(delta)?;
            }
        }
        txn.commit()?;
        Ok(removed)
    }
}

struct DatabaseSink {
    conn: Connection,
    table: String,
    delta: u32,
    full: bool,
    buf: Vec<u8>,
}

impl Write for DatabaseSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DatabaseSink {
    fn store(self) -> Result<()> {
        let status = if self.full {
            DeltaStatus::Full
        } else {
            DeltaStatus::Incremental
        };
        let len = self.buf.len();
        let code = status.code().to_string();
        let txn = self.conn.begin_write()?;
        {
            let def: DeltaTable<'_> = TableDefinition::new(&self.table);
            let mut table = txn.open_table(def)?;
            table.insert(self.delta, (code.as_str(), now_millis(), self.buf.as_slice()))?;
        }
        txn.commit()?;
        debug!(table = %self.table, delta = self.delta, bytes = len, "delta row stored");
        Ok(())
    }
}

impl DeltaSink for DatabaseSink {
    fn close(self: Box<Self>) -> io::Result<()> {
        self.store().map_err(|e| match e {
            MediaError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        })
    }
}

impl StorageMedium for DatabaseMedium {
    fn settings(&self) -> &MediumSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MediumSettings {
        &mut self.settings
    }

    fn read_sequence_numbers(&mut self, suffix: &str) -> Result<Vec<SequenceNumbers>> {
        let rows = self.rows()?;
        if !suffix.is_empty() {
            let delta = parse_delta_suffix(suffix)?;
            return rows
                .iter()
                .find(|(n, status, _)| {
                    *n == delta && matches!(status, DeltaStatus::Full | DeltaStatus::ArchivedFull)
                })
                .map(|&(n, _, ts)| vec![SequenceNumbers::new(n, n + 1, ts)])
                .ok_or(MediaError::DeltaNotFound(delta));
        }

        let mut result = Vec::new();
        let live: Vec<_> = rows.iter().filter(|(_, s, _)| s.is_live()).collect();
        if !live.is_empty() {
            let first = live.iter().map(|r| r.0).min().unwrap_or(0);
            let current = live.iter().map(|r| r.0).max().map_or(0, |m| m + 1);
            let timestamp = live.iter().map(|r| r.2).max().unwrap_or(0);
            result.push(SequenceNumbers::new(first, current, timestamp));
        }
        for &(n, status, ts) in &rows {
            if status == DeltaStatus::ArchivedFull {
                result.push(SequenceNumbers::new(n, n + 1, ts));
            }
        }
        Ok(result)
    }

    fn open_output_stream(&mut self, delta: u32, full: bool) -> Result<Box<dyn DeltaSink>> {
        let conn = self.connection()?;
        Ok(Box::new(DatabaseSink {
            conn,
            table: self.table.clone(),
            delta,
            full,
            buf: Vec::with_capacity(8192),
        }))
    }

    fn finish_output_stream(&mut self, retain: &SequenceNumbers, _full: bool) -> Result<()> {
        let conn = self.connection()?;
        let txn = conn.begin_write()?;
        {
            let mut table = txn.open_table(self.deltas())?;
            let mut archived = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let delta = k.value();
                let (code, timestamp, data) = v.value();
                let status = status_of(code)?;
                if status.is_live() && !retain.contains(delta) {
                    archived.push((delta, status.archived().code().to_string(), timestamp, data.to_vec()));
                }
            }
            for (delta, code, timestamp, data) in &archived {
                table.insert(*delta, (code.as_str(), *timestamp, data.as_slice()))?;
            }
        }
        txn.commit()?;
        debug!(table = %self.table, %retain, "sequence numbers written");
        Ok(())
    }

    fn abort_output_stream(&mut self, retain: &SequenceNumbers) -> Result<()> {
        self.delete_rows(std::iter::once(retain.current))?;
        Ok(())
    }

    fn open_input_stream(&mut self, delta: u32) -> Result<Box<dyn Read + Send>> {
        let conn = self.connection()?;
        let txn = conn.begin_read()?;
        let table = txn.open_table(self.deltas())?;
        let guard = table.get(delta)?.ok_or(MediaError::DeltaNotFound(delta))?;
        let (_, _, data) = guard.value();
        info!(table = %self.table, delta, "rehydrate");
        Ok(Box::new(Cursor::new(data.to_vec())))
    }

    fn cleanup_old_deltas(&mut self, old: &SequenceNumbers) -> Result<()> {
        let removed = self.delete_rows(old.deltas())?;
        debug!(table = %self.table, %old, removed, "old deltas deleted");
        Ok(())
    }

    fn cleanup_archive(&mut self, live: &SequenceNumbers) -> Result<()> {
        let Some(keep) = self.settings.archive_count else {
            debug!(medium = %self.settings.name, "keeping all archives");
            return Ok(());
        };
        let archives = self
            .rows()?
            .into_iter()
            .filter(|(_, s, _)| *s == DeltaStatus::ArchivedFull)
            .map(|(n, _, ts)| SequenceNumbers::new(n, n + 1, ts))
            .collect();
        let excess = excess_archives(archives, keep, live.first);
        info!(medium = %self.settings.name, excess = excess.len(), "excess archives to delete");
        for seq in excess {
            self.cleanup_old_deltas(&seq)?;
        }
        Ok(())
    }

    fn check_ownership(&mut self) -> Result<bool> {
        let conn = self.connection()?;
        let txn = conn.begin_read()?;
        let owners = txn.open_table(OWNERS)?;
        let owner = owners.get(self.table.as_str())?.map(|g| g.value().to_string());
        Ok(owner.as_deref() == Some(self.instance_id.as_str()))
    }

    // Write transactions are already serialized by the connection gate.
    fn lock_ownership(&mut self) -> Result<()> {
        Ok(())
    }

    fn unlock_ownership(&mut self) -> Result<()> {
        Ok(())
    }

    fn store_data_protection_key(&mut self, delta: u32, key: &DataProtectionKey) -> Result<()> {
        let bytes = bincode::serialize(key)?;
        let conn = self.connection()?;
        let txn = conn.begin_write()?;
        {
            let mut keys = txn.open_table(self.keys())?;
            keys.insert(delta, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn retrieve_data_protection_key(&mut self, delta: u32) -> Result<DataProtectionKey> {
        let conn = self.connection()?;
        let txn = conn.begin_read()?;
        let keys = txn.open_table(self.keys())?;
        let guard = keys.get(delta)?.ok_or(MediaError::KeyUnavailable(delta))?;
        Ok(bincode::deserialize(guard.value())?)
    }

    fn delete_all(&mut self) -> Result<()> {
        let all: Vec<u32> = self.rows()?.into_iter().map(|r| r.0).collect();
        let removed = self.delete_rows(all.into_iter())?;
        info!(table = %self.table, removed, "deleted old persistence data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(path: &Path, agent: &str) -> DatabaseMedium {
        DatabaseMedium::open(MediumSettings::new("db"), path, agent, false).unwrap()
    }

    fn write(m: &mut DatabaseMedium, seq: &mut SequenceNumbers, full: bool, body: &[u8]) {
        let mut sink = m.open_output_stream(seq.current, full).unwrap();
        sink.write_all(body).unwrap();
        sink.close().unwrap();
        seq.current += 1;
        m.finish_output_stream(seq, full).unwrap();
    }

    #[test]
    fn table_name_derives_from_agent() {
        let dir = tempfile::tempdir().unwrap();
        let m = open(&dir.path().join("p.redb"), "agent-one");
        assert_eq!(m.table_name(), "db_agent_one");
    }

    #[test]
    fn live_range_and_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir.path().join("p.redb"), "a");
        let mut seq = SequenceNumbers::new(0, 0, 0);
        write(&mut m, &mut seq, true, b"f0");
        write(&mut m, &mut seq, false, b"i1");
        // Start a new chain at 2: delta 0 becomes an archive, 1 goes inactive.
        seq.first = seq.current;
        write(&mut m, &mut seq, true, b"f2");

        let mut sets = m.read_sequence_numbers("").unwrap();
        sets.sort_by_key(|s| s.first);
        assert_eq!(sets.len(), 2);
        assert_eq!((sets[0].first, sets[0].current), (0, 1));
        assert_eq!((sets[1].first, sets[1].current), (2, 3));

        let rows = m.rows().unwrap();
        assert_eq!(rows[0].1, DeltaStatus::ArchivedFull);
        assert_eq!(rows[1].1, DeltaStatus::ArchivedIncremental);
        assert_eq!(rows[2].1, DeltaStatus::Full);

        assert_eq!(m.read_sequence_numbers("_00000").unwrap().len(), 1);
        assert!(matches!(
            m.read_sequence_numbers("_00001"),
            Err(MediaError::DeltaNotFound(1))
        ));

        let mut out = Vec::new();
        m.open_input_stream(2).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"f2");
    }

    #[test]
    fn rows_store_one_letter_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir.path().join("p.redb"), "a");
        let mut seq = SequenceNumbers::new(0, 0, 0);
        write(&mut m, &mut seq, true, b"f0");
        write(&mut m, &mut seq, false, b"i1");
        seq.first = seq.current;
        write(&mut m, &mut seq, true, b"f2");
        write(&mut m, &mut seq, false, b"i3");

        let conn = m.connection().unwrap();
        let txn = conn.begin_read().unwrap();
        let table = txn.open_table(m.deltas()).unwrap();
        let codes: Vec<String> = table
            .iter()
            .unwrap()
            .map(|entry| entry.unwrap().1.value().0.to_string())
            .collect();
        assert_eq!(codes, ["a", "f", "x", "t"]);
        assert_eq!(table.get(3).unwrap().unwrap().value().2, b"i3");
    }

    #[test]
    fn archive_cleanup_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir.path().join("p.redb"), "a");
        m.settings_mut().archive_count = Some(1);
        let mut seq = SequenceNumbers::new(0, 0, 0);
        for _ in 0..3 {
            seq.first = seq.current;
            write(&mut m, &mut seq, true, b"full");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        m.cleanup_archive(&seq).unwrap();
        let remaining: Vec<u32> = m.rows().unwrap().into_iter().map(|r| r.0).collect();
        assert_eq!(remaining, vec![1, 2]);
    }

    #[test]
    fn abort_removes_stored_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir.path().join("p.redb"), "a");
        let seq = SequenceNumbers::new(0, 0, 0);
        let mut sink = m.open_output_stream(0, true).unwrap();
        sink.write_all(b"x").unwrap();
        sink.close().unwrap();
        m.abort_output_stream(&seq).unwrap();
        assert!(m.read_sequence_numbers("").unwrap().is_empty());
    }

    #[test]
    fn media_share_one_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.redb");
        let mut a = open(&path, "alpha");
        let mut b = open(&path, "beta");
        let mut seq = SequenceNumbers::new(0, 0, 0);
        write(&mut a, &mut seq, true, b"a");
        assert_eq!(a.read_sequence_numbers("").unwrap().len(), 1);
        assert!(b.read_sequence_numbers("").unwrap().is_empty());
        assert!(Arc::ptr_eq(&a.gate, &b.gate));
    }

    #[test]
    fn reentrant_connection_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir.path().join("p.redb"), "a");
        let sink = m.open_output_stream(0, true).unwrap();
        assert!(matches!(
            m.read_sequence_numbers(""),
            Err(MediaError::ReentrantConnection)
        ));
        drop(sink);
        assert!(m.read_sequence_numbers("").is_ok());
    }

    #[test]
    fn connection_blocks_other_threads() {
        let dir = tempfile::tempdir().unwrap();
        let m = open(&dir.path().join("p.redb"), "a");
        let held = m.connection().unwrap();
        let gate = Arc::clone(&m.gate);
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let _conn = gate.acquire().unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn ownership_moves_to_latest_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.redb");
        let mut first = open(&path, "a");
        assert!(first.check_ownership().unwrap());
        let mut second = open(&path, "a");
        assert!(!first.check_ownership().unwrap());
        assert!(second.check_ownership().unwrap());
    }

    #[test]
    fn keys_roundtrip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = open(&dir.path().join("p.redb"), "a");
        let key = DataProtectionKey::new("xor", vec![5]);
        m.store_data_protection_key(3, &key).unwrap();
        assert_eq!(m.retrieve_data_protection_key(3).unwrap(), key);
        m.cleanup_old_deltas(&SequenceNumbers::new(3, 4, 0)).unwrap();
        assert!(matches!(
            m.retrieve_data_protection_key(3),
            Err(MediaError::KeyUnavailable(3))
        ));
    }
}
