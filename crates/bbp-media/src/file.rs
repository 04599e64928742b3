//! File-backed media.
//!
//! Layout of one agent directory below the persistence root:
//!
//! ```text
//! sequence            first:i32 current:i32 of the live range (mtime = timestamp)
//! sequence_NNNNN      archive: the full delta NNNNN
//! newSequence<sfx>    sequence file being replaced; finished on the next read
//! delta_NNNNN         committed delta
//! <instance>_NNNNN    delta being written
//! key_NNNNN           data protection key of delta NNNNN
//! owner               u16 length + UTF-8 instance id of the owner
//! mutex               ownership lock file
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bbp_types::{format_delta_number, parse_delta_suffix, DataProtectionKey, SequenceNumbers};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::buffered::BufferedFileSystem;
use crate::error::{MediaError, Result};
use crate::fsops::{DirectFs, FileOps};
use crate::medium::{excess_archives, DeltaSink, MediumSettings, StorageMedium};
use crate::mutex::FileMutex;

const SEQUENCE: &str = "sequence";
const NEW_SEQUENCE: &str = "newSequence";
const DELTA: &str = "delta";
const KEY: &str = "key";
const OWNER: &str = "owner";
const MUTEX: &str = "mutex";

/// Plain file medium: synchronous writes, fsync on close.
pub type PlainFileMedium = FileMedium<DirectFs>;

/// Queued file medium: writes go through a [`BufferedFileSystem`].
pub type QueuedFileMedium = FileMedium<BufferedFileSystem>;

/// Storage medium keeping each agent's deltas in its own directory.
pub struct FileMedium<F: FileOps> {
    settings: MediumSettings,
    dir: PathBuf,
    ops: F,
    instance_id: String,
    mutex: FileMutex,
    open_delta: Option<u32>,
}

impl<F: FileOps> FileMedium<F> {
    /// Open the directory of `agent` below `root` and claim ownership of it.
    pub fn open(
        settings: MediumSettings,
        root: &Path,
        agent: &str,
        ops: F,
        lock_timeout: Duration,
        clear: bool,
    ) -> Result<Self> {
        let dir = root.join(agent);
        fs::create_dir_all(&dir)?;
        if !dir.is_dir() {
            return Err(MediaError::Configuration(format!(
                "not a directory: {}",
                dir.display()
            )));
        }
        let instance_id = Uuid::now_v7().simple().to_string();
        let mutex = FileMutex::new(&dir, MUTEX, instance_id.clone(), lock_timeout);
        let mut medium = Self {
            settings,
            dir,
            ops,
            instance_id,
            mutex,
            open_delta: None,
        };
        if clear {
            medium.delete_all()?;
        }

        medium.lock_ownership()?;
        let claimed = write_owner(&medium.dir.join(OWNER), &medium.instance_id);
        medium.unlock_ownership()?;
        claimed?;

        info!(
            medium = %medium.settings.name,
            dir = %medium.dir.display(),
            instance = %medium.instance_id,
            "file medium opened"
        );
        Ok(medium)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn file_ops(&self) -> &F {
        &self.ops
    }

    fn delta_path(&self, delta: u32) -> PathBuf {
        self.dir.join(format!("{DELTA}{}", format_delta_number(delta)))
    }

    fn temp_path(&self, delta: u32) -> PathBuf {
        self.dir.join(format!("{}{}", self.instance_id, format_delta_number(delta)))
    }

    fn key_path(&self, delta: u32) -> PathBuf {
        self.dir.join(format!("{KEY}{}", format_delta_number(delta)))
    }

    fn read_sequence_file(&self, path: &Path) -> Result<SequenceNumbers> {
        debug!(path = %path.display(), "reading sequence file");
        let mut raw = [0u8; 8];
        self.ops.open(path)?.read_exact(&mut raw)?;
        decode_sequence(&raw, path)
    }

    fn write_sequence_numbers(&self, seq: &SequenceNumbers, suffix: &str) -> Result<()> {
        let target = self.dir.join(format!("{SEQUENCE}{suffix}"));
        let staged = self.dir.join(format!("{NEW_SEQUENCE}{suffix}"));
        let mut sink = self.ops.create(&staged)?;
        sink.write_all(&(seq.first as i32).to_be_bytes())?;
        sink.write_all(&(seq.current as i32).to_be_bytes())?;
        sink.close()?;
        self.ops.rename(&staged, &target)?;
        Ok(())
    }

    fn remove_quietly(&self, path: &Path) {
        match self.ops.remove(path) {
            Ok(()) => debug!(path = %path.display(), "deleted"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(path = %path.display(), error = %e, "failed to delete"),
        }
    }

    fn file_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

impl<F: FileOps> StorageMedium for FileMedium<F> {
    fn settings(&self) -> &MediumSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MediumSettings {
        &mut self.settings
    }

    fn read_sequence_numbers(&mut self, suffix: &str) -> Result<Vec<SequenceNumbers>> {
        if !suffix.is_empty() {
            parse_delta_suffix(suffix)?;
        }
        self.ops.barrier();

        let mut targets = BTreeSet::new();
        let mut finished_any = false;
        for name in self.file_names()? {
            if !name.ends_with(suffix) {
                continue;
            }
            if let Some(rest) = name.strip_prefix(NEW_SEQUENCE) {
                let target = format!("{SEQUENCE}{rest}");
                info!(from = %name, to = %target, "finishing interrupted sequence update");
                self.ops.rename(&self.dir.join(&name), &self.dir.join(&target))?;
                finished_any = true;
                targets.insert(target);
            } else if name.starts_with(SEQUENCE) {
                targets.insert(name);
            }
        }
        if finished_any {
            self.ops.barrier();
        }

        let mut result = Vec::with_capacity(targets.len());
        for name in targets {
            match self.read_sequence_file(&self.dir.join(&name)) {
                Ok(seq) => result.push(seq),
                Err(e) => error!(file = %name, error = %e, "unreadable sequence file"),
            }
        }
        Ok(result)
    }

    fn open_output_stream(&mut self, delta: u32, full: bool) -> Result<Box<dyn DeltaSink>> {
        let path = self.temp_path(delta);
        info!(medium = %self.settings.name, path = %path.display(), full, "persist to");
        let sink = self.ops.create(&path)?;
        self.open_delta = Some(delta);
        Ok(sink)
    }

    fn finish_output_stream(&mut self, retain: &SequenceNumbers, full: bool) -> Result<()> {
        let delta = self
            .open_delta
            .take()
            .unwrap_or_else(|| retain.current.saturating_sub(1));
        self.ops.rename(&self.temp_path(delta), &self.delta_path(delta))?;
        self.write_sequence_numbers(retain, "")?;
        if full {
            self.write_sequence_numbers(retain, &format_delta_number(retain.first))?;
        }
        debug!(medium = %self.settings.name, delta, %retain, "delta committed");
        Ok(())
    }

    fn abort_output_stream(&mut self, retain: &SequenceNumbers) -> Result<()> {
        let delta = self.open_delta.take().unwrap_or(retain.current);
        self.remove_quietly(&self.temp_path(delta));
        Ok(())
    }

    fn open_input_stream(&mut self, delta: u32) -> Result<Box<dyn Read + Send>> {
        let path = self.delta_path(delta);
        info!(path = %path.display(), "rehydrate");
        match self.ops.open(&path) {
            Ok(stream) => Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(MediaError::DeltaNotFound(delta)),
            Err(e) => Err(e.into()),
        }
    }

    fn cleanup_old_deltas(&mut self, old: &SequenceNumbers) -> Result<()> {
        self.ops.barrier();
        for delta in old.deltas() {
            self.remove_quietly(&self.delta_path(delta));
            let key = self.key_path(delta);
            if key.exists() {
                self.remove_quietly(&key);
            }
        }
        Ok(())
    }

    fn cleanup_archive(&mut self, live: &SequenceNumbers) -> Result<()> {
        let Some(keep) = self.settings.archive_count else {
            debug!(medium = %self.settings.name, "keeping all archives");
            return Ok(());
        };
        self.ops.barrier();
        let mut archives = Vec::new();
        for name in self.file_names()? {
            let Some(suffix) = name.strip_prefix(SEQUENCE) else {
                continue;
            };
            if suffix.is_empty() || parse_delta_suffix(suffix).is_err() {
                continue;
            }
            match self.read_sequence_file(&self.dir.join(&name)) {
                Ok(seq) => archives.push(seq),
                Err(e) => error!(file = %name, error = %e, "unreadable archive"),
            }
        }
        let excess = excess_archives(archives, keep, live.first);
        info!(medium = %self.settings.name, excess = excess.len(), "excess archives to delete");
        for seq in excess {
            self.cleanup_old_deltas(&seq)?;
            let file = self.dir.join(format!("{SEQUENCE}{}", format_delta_number(seq.first)));
            self.remove_quietly(&file);
        }
        Ok(())
    }

    fn check_ownership(&mut self) -> Result<bool> {
        self.lock_ownership()?;
        let owner = read_owner(&self.dir.join(OWNER));
        self.unlock_ownership()?;
        Ok(owner? == self.instance_id)
    }

    fn lock_ownership(&mut self) -> Result<()> {
        self.mutex.lock()?;
        Ok(())
    }

    fn unlock_ownership(&mut self) -> Result<()> {
        self.mutex.unlock()?;
        Ok(())
    }

    fn store_data_protection_key(&mut self, delta: u32, key: &DataProtectionKey) -> Result<()> {
        let bytes = bincode::serialize(key)?;
        let mut sink = self.ops.create(&self.key_path(delta))?;
        sink.write_all(&bytes)?;
        sink.close()?;
        Ok(())
    }

    fn retrieve_data_protection_key(&mut self, delta: u32) -> Result<DataProtectionKey> {
        let mut bytes = Vec::new();
        match self.ops.open(&self.key_path(delta)) {
            Ok(mut stream) => stream.read_to_end(&mut bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(MediaError::KeyUnavailable(delta)),
            Err(e) => return Err(e.into()),
        };
        Ok(bincode::deserialize(&bytes)?)
    }

    fn delete_all(&mut self) -> Result<()> {
        self.ops.barrier();
        for name in self.file_names()? {
            if name == OWNER || name == MUTEX {
                continue;
            }
            let path = self.dir.join(&name);
            if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        info!(medium = %self.settings.name, dir = %self.dir.display(), "deleted old persistence data");
        Ok(())
    }
}

fn decode_sequence(raw: &[u8; 8], path: &Path) -> Result<SequenceNumbers> {
    let first = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let current = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let modified = fs::metadata(path)?.modified()?;
    let timestamp = DateTime::<Utc>::from(modified).timestamp_millis();
    Ok(SequenceNumbers::new(first.max(0) as u32, current.max(0) as u32, timestamp))
}

/// A sequence file found in an agent directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SequenceFile {
    pub name: String,
    /// Archive files carry the number of their full delta as suffix.
    pub archive: bool,
    pub sequence: SequenceNumbers,
}

/// A committed delta file found in an agent directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeltaFile {
    pub delta: u32,
    pub path: PathBuf,
    pub size: u64,
    pub has_key: bool,
}

/// Read-only view of one agent directory.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DirectoryListing {
    pub owner: Option<String>,
    pub sequences: Vec<SequenceFile>,
    pub deltas: Vec<DeltaFile>,
}

/// List an agent directory without opening it as a medium, so neither
/// ownership nor unfinished sequence updates are touched.
pub fn inspect_directory(dir: &Path) -> Result<DirectoryListing> {
    if !dir.is_dir() {
        return Err(MediaError::Configuration(format!("not a directory: {}", dir.display())));
    }
    let mut listing = DirectoryListing {
        owner: read_owner(&dir.join(OWNER)).ok(),
        ..Default::default()
    };
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok()?.file_name().into_string().ok())
        .collect();
    names.sort();
    for name in &names {
        let path = dir.join(name);
        if let Some(suffix) = name.strip_prefix(SEQUENCE) {
            if !suffix.is_empty() && parse_delta_suffix(suffix).is_err() {
                continue;
            }
            let mut raw = [0u8; 8];
            let read = fs::File::open(&path).and_then(|mut f| f.read_exact(&mut raw));
            match read.map_err(MediaError::from).and_then(|()| decode_sequence(&raw, &path)) {
                Ok(sequence) => listing.sequences.push(SequenceFile {
                    name: name.clone(),
                    archive: !suffix.is_empty(),
                    sequence,
                }),
                Err(e) => error!(file = %name, error = %e, "unreadable sequence file"),
            }
        } else if let Some(suffix) = name.strip_prefix(DELTA) {
            let Ok(delta) = parse_delta_suffix(suffix) else {
                continue;
            };
            listing.deltas.push(DeltaFile {
                delta,
                size: fs::metadata(&path)?.len(),
                has_key: names.iter().any(|n| n.strip_prefix(KEY) == Some(suffix)),
                path,
            });
        }
    }
    Ok(listing)
}

fn write_owner(path: &Path, instance_id: &str) -> Result<()> {
    let bytes = instance_id.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| MediaError::Configuration("instance id too long".into()))?;
    let mut file = fs::File::create(path)?;
    file.write_all(&len.to_be_bytes())?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn read_owner(path: &Path) -> Result<String> {
    let raw = fs::read(path)?;
    if raw.len() < 2 {
        return Err(MediaError::Serialization("owner file truncated".into()));
    }
    let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    let body = raw
        .get(2..2 + len)
        .ok_or_else(|| MediaError::Serialization("owner file truncated".into()))?;
    String::from_utf8(body.to_vec()).map_err(|e| MediaError::Serialization(e.to_string()))
}
