//! # raft-storage
//!
//! why: give a raft node state that survives a process restart using plain std::fs
//! relations: implements raft_core::Storage; the driver writes to it after each Ready
//! what: FileStorage, StorageFileError
//!
//! A directory holds three JSON files. `meta.json` keeps the hard state and
//! the membership, `log.json` the entries after the last compaction point,
//! and `snapshot.json` the latest snapshot. Every file is replaced by
//! writing a temp file, syncing it and renaming it over the old one, so a
//! crash leaves either the old or the new version of each file.
//!
//! Installing a snapshot touches all three files in turn, and a crash in
//! between leaves them out of step. The snapshot is written first and is
//! authoritative: `open` lifts a hard state that is behind it and drops
//! log entries that disagree with it.
//!
//! Reads are served from an in-memory [`MemStorage`] mirror that is loaded
//! on open and kept in step with every write.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raft_core::{
    ConfState, HardState, LogEntry, MemStorage, RaftState, Ready, Snapshot, Storage,
    StorageError, StorageResult,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";
const SNAPSHOT_FILE: &str = "snapshot.json";

/// Failures of the durable write path and of recovery.
#[derive(Debug, Error)]
pub enum StorageFileError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("log in {path} starts at {first} but the snapshot ends at {snapshot}")]
    Gap {
        path: PathBuf,
        first: u64,
        snapshot: u64,
    },

    #[error("cannot compact to {index}: the snapshot only covers up to {snapshot}")]
    Uncovered { index: u64, snapshot: u64 },

    #[error(transparent)]
    Raft(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, StorageFileError>;

#[derive(Serialize, Deserialize, Default)]
struct Meta {
    hard_state: HardState,
    conf_state: ConfState,
}

/// Durable [`Storage`] backed by a directory.
pub struct FileStorage {
    dir: PathBuf,
    cache: MemStorage,
}

impl FileStorage {
    /// Opens the storage in `dir`, creating the directory if needed and
    /// reloading whatever a previous process left there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let snapshot: Snapshot = read_json(&dir.join(SNAPSHOT_FILE))?;
        let mut entries: Vec<LogEntry> = read_json(&dir.join(LOG_FILE))?;
        let mut meta: Meta = read_json(&dir.join(META_FILE))?;
        let repaired = reconcile(&snapshot, &mut entries, &mut meta);

        let mut cache = MemStorage::new();
        let snap_index = snapshot.metadata.index;
        if !snapshot.is_empty() {
            cache.apply_snapshot(snapshot)?;
        }
        if let Some(first) = entries.first() {
            if first.index > snap_index + 1 {
                return Err(StorageFileError::Gap {
                    path: dir.join(LOG_FILE),
                    first: first.index,
                    snapshot: snap_index,
                });
            }
        }
        cache.append(&entries)?;
        cache.set_hard_state(meta.hard_state);
        cache.set_conf_state(meta.conf_state);

        info!(
            dir = %dir.display(),
            term = meta.hard_state.term,
            commit = meta.hard_state.commit,
            snapshot = snap_index,
            entries = entries.len(),
            repaired,
            "opened file storage"
        );
        let s = Self { dir, cache };
        if repaired {
            s.write_log()?;
            s.write_meta()?;
        }
        Ok(s)
    }

    /// Opens a fresh directory with an initial membership. An existing
    /// membership on disk is overwritten.
    pub fn open_with_conf_state(dir: impl Into<PathBuf>, cs: ConfState) -> Result<Self> {
        let mut s = Self::open(dir)?;
        s.set_conf_state(cs)?;
        Ok(s)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hard_state(&self) -> HardState {
        self.cache.hard_state()
    }

    pub fn set_hard_state(&mut self, hs: HardState) -> Result<()> {
        self.cache.set_hard_state(hs);
        self.write_meta()
    }

    pub fn set_conf_state(&mut self, cs: ConfState) -> Result<()> {
        self.cache.set_conf_state(cs);
        self.write_meta()
    }

    pub fn commit_to(&mut self, index: u64) -> Result<()> {
        self.cache.commit_to(index)?;
        self.write_meta()
    }

    /// Appends `entries`, truncating any suffix they conflict with.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.cache.append(entries)?;
        self.write_log()
    }

    /// Replaces the log with `snapshot`, as received from a leader.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.cache.apply_snapshot(snapshot)?;
        self.write_snapshot()?;
        self.write_log()?;
        self.write_meta()
    }

    /// Records a local snapshot at `index`; see [`compact`](Self::compact)
    /// for dropping the entries it covers.
    pub fn create_snapshot(
        &mut self,
        index: u64,
        conf_state: Option<ConfState>,
        data: Vec<u8>,
    ) -> Result<Snapshot> {
        let snap = self.cache.create_snapshot(index, conf_state, data)?;
        self.write_snapshot()?;
        Ok(snap)
    }

    /// Drops entries up to `compact_index`. Only entries covered by the
    /// persisted snapshot may go, otherwise a restart could not rebuild the
    /// log.
    pub fn compact(&mut self, compact_index: u64) -> Result<()> {
        let snapshot = self.cache.snapshot()?.metadata.index;
        if compact_index > snapshot {
            return Err(StorageFileError::Uncovered {
                index: compact_index,
                snapshot,
            });
        }
        self.cache.compact(compact_index)?;
        self.write_log()
    }

    /// Persists everything a Ready asks for, in the order a restart needs:
    /// snapshot first, then entries, then the hard state that may commit
    /// them.
    pub fn write_ready(&mut self, rd: &Ready) -> Result<()> {
        if let Some(snap) = &rd.snapshot {
            self.apply_snapshot(snap.clone())?;
        }
        self.append(&rd.entries)?;
        if let Some(hs) = rd.hard_state {
            self.set_hard_state(hs)?;
        }
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let state = self.cache.initial_state()?;
        let meta = Meta {
            hard_state: state.hard_state,
            conf_state: state.conf_state,
        };
        write_json(&self.dir, META_FILE, &meta)
    }

    fn write_log(&self) -> Result<()> {
        let first = self.cache.first_index()?;
        let last = self.cache.last_index()?;
        let entries = if first <= last {
            self.cache.entries(first, last + 1, u64::MAX)?
        } else {
            Vec::new()
        };
        write_json(&self.dir, LOG_FILE, &entries)
    }

    fn write_snapshot(&self) -> Result<()> {
        write_json(&self.dir, SNAPSHOT_FILE, &self.cache.snapshot()?)
    }
}

impl Storage for FileStorage {
    fn initial_state(&self) -> StorageResult<RaftState> {
        self.cache.initial_state()
    }

    fn entries(&self, low: u64, high: u64, max_size: u64) -> StorageResult<Vec<LogEntry>> {
        self.cache.entries(low, high, max_size)
    }

    fn term(&self, idx: u64) -> StorageResult<u64> {
        self.cache.term(idx)
    }

    fn first_index(&self) -> StorageResult<u64> {
        self.cache.first_index()
    }

    fn last_index(&self) -> StorageResult<u64> {
        self.cache.last_index()
    }

    fn snapshot(&self) -> StorageResult<Snapshot> {
        self.cache.snapshot()
    }
}

/// Brings the log and meta read from disk in line with the snapshot after
/// an interrupted install. Returns whether anything changed.
fn reconcile(snapshot: &Snapshot, entries: &mut Vec<LogEntry>, meta: &mut Meta) -> bool {
    if snapshot.is_empty() {
        return false;
    }
    let (index, term) = (snapshot.metadata.index, snapshot.metadata.term);
    let mut repaired = false;

    // the entry at the snapshot index decides whether the tail above it
    // belongs to the same history
    let diverged = entries.iter().any(|e| e.index == index && e.term != term);
    if diverged {
        warn!(index, term, "log disagrees with snapshot, dropping it");
        entries.clear();
        repaired = true;
    }

    let hs = &mut meta.hard_state;
    if hs.commit < index {
        warn!(commit = hs.commit, index, "hard state is behind snapshot, lifting it");
        hs.commit = index;
        if hs.term < term {
            // a vote is persisted before it is sent, so none was cast in
            // any term this node never durably reached
            hs.term = term;
            hs.vote = 0;
        }
        meta.conf_state = snapshot.metadata.conf_state.clone();
        repaired = true;
    }
    repaired
}

/// Missing files read as the default value.
fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|source| StorageFileError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

// write to temp, fsync, rename over the old file
fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let path = dir.join(name);
    let json = serde_json::to_vec_pretty(value).map_err(|source| StorageFileError::Corrupt {
        path: path.clone(),
        source,
    })?;
    let tmp = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    debug!(file = name, bytes = json.len(), "persisted");
    Ok(())
}
