//! Durable storage for the consensus engine.
//!
//! The engine hands over opaque byte blobs (encoded node state and the
//! application snapshot). A persister only has to store and return them; it
//! must not return from a save before the data would survive a crash.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{RaftError, Result};

const STATE_FILE: &str = "raft-state.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";

pub trait Persister: Send + Sync + 'static {
    /// Durably replace the saved node state.
    fn save_state(&self, state: Vec<u8>) -> Result<()>;

    /// Saved node state, empty if nothing was saved yet.
    fn read_state(&self) -> Result<Vec<u8>>;

    /// Durably replace node state and snapshot together.
    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()>;

    /// Saved snapshot, empty if there is none.
    fn read_snapshot(&self) -> Result<Vec<u8>>;

    /// Size in bytes of the saved node state.
    fn state_size(&self) -> Result<usize> {
        Ok(self.read_state()?.len())
    }
}

#[derive(Debug, Default)]
struct Stored {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// In-memory persister. Clones share the same storage, so a node rebuilt from
/// a clone sees exactly what its predecessor saved (a simulated restart).
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    inner: Arc<Mutex<Stored>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent copy of the current contents.
    pub fn deep_copy(&self) -> Self {
        let stored = self.inner.lock();
        Self {
            inner: Arc::new(Mutex::new(Stored {
                state: stored.state.clone(),
                snapshot: stored.snapshot.clone(),
            })),
        }
    }

    pub fn snapshot_size(&self) -> usize {
        self.inner.lock().snapshot.len()
    }
}

impl Persister for MemoryPersister {
    fn save_state(&self, state: Vec<u8>) -> Result<()> {
        self.inner.lock().state = state;
        Ok(())
    }

    fn read_state(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().state.clone())
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        let mut stored = self.inner.lock();
        stored.state = state;
        stored.snapshot = snapshot;
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().snapshot.clone())
    }

    fn state_size(&self) -> Result<usize> {
        Ok(self.inner.lock().state.len())
    }
}

/// File-backed persister keeping state and snapshot in a data directory.
///
/// Each blob is written to a temporary file, synced, then renamed over the
/// previous version.
#[derive(Debug)]
pub struct FilePersister {
    dir: PathBuf,
    // Serializes writers so state and snapshot saves never interleave
    write_lock: Mutex<()>,
}

impl FilePersister {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        tracing::info!(dir = %dir.display(), "Opened raft data directory");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        let target = self.dir.join(name);
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)
        };
        write().map_err(|e| {
            RaftError::Persistence(format!("failed to write {}: {}", target.display(), e))
        })
    }

    fn read_or_empty(&self, name: &str) -> Result<Vec<u8>> {
        match fs::read(self.dir.join(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Persister for FilePersister {
    fn save_state(&self, state: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_atomic(STATE_FILE, &state)
    }

    fn read_state(&self) -> Result<Vec<u8>> {
        self.read_or_empty(STATE_FILE)
    }

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock();
        // Snapshot first: state referencing a missing snapshot is never visible
        self.write_atomic(SNAPSHOT_FILE, &snapshot)?;
        self.write_atomic(STATE_FILE, &state)
    }

    fn read_snapshot(&self) -> Result<Vec<u8>> {
        self.read_or_empty(SNAPSHOT_FILE)
    }
}
