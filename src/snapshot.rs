//! Snapshot persistence: opaque processor state keyed by (name, position).
//!
//! A snapshot at position P means "state equals the result of applying every
//! record with position <= P". Writes are atomic via write-to-temp + fsync +
//! rename; old snapshots may be pruned but the newest one always survives.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;

use crate::processor::StateResource;
use crate::record::Position;

const SNAPSHOT_EXT: &str = "snapshot";
const TMP_EXT: &str = "tmp";

/// Keep this many snapshots per controller when pruning.
const DEFAULT_KEEP: usize = 3;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot state serialization failed: {source}")]
    State {
        #[source]
        source: io::Error,
    },
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// A readable snapshot of processor state at a position.
pub trait Snapshot: Send {
    fn position(&self) -> Position;

    /// Restore the snapshot blob into the given state resource.
    fn restore(&self, state: &mut dyn StateResource) -> SnapshotResult<()>;
}

/// Write handle for a snapshot under construction.
///
/// Nothing is visible to readers until [`SnapshotWriter::commit`] succeeds;
/// `abort` (and a failed commit) leaves no trace.
pub trait SnapshotWriter: Send {
    /// Serialize the state resource into the snapshot. Returns the blob
    /// size in bytes.
    fn write(&mut self, state: &dyn StateResource) -> SnapshotResult<u64>;

    /// Atomically publish the snapshot. Cleans up after itself on failure.
    fn commit(self: Box<Self>) -> SnapshotResult<()>;

    /// Discard the partial snapshot.
    fn abort(self: Box<Self>);
}

/// Store of snapshots keyed by controller name and position.
pub trait SnapshotStore: Send {
    fn last_snapshot(&self, name: &str) -> SnapshotResult<Option<Box<dyn Snapshot>>>;

    fn create_snapshot(
        &self,
        name: &str,
        position: Position,
    ) -> SnapshotResult<Box<dyn SnapshotWriter>>;
}

/// Filesystem snapshot store: one directory per controller name, one file
/// per snapshot position.
pub struct FsSnapshotStore {
    dir: PathBuf,
    keep: usize,
}

impl FsSnapshotStore {
    /// Open (or create) a store rooted at `dir`. Stale temp files left by
    /// interrupted writes are removed.
    pub fn new(dir: impl Into<PathBuf>) -> SnapshotResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        let store = FsSnapshotStore {
            dir,
            keep: DEFAULT_KEEP,
        };
        store.cleanup_stale();
        Ok(store)
    }

    /// Keep `keep` snapshots per controller when pruning (minimum one).
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    fn controller_dir(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn cleanup_stale(&self) {
        let Ok(controllers) = fs::read_dir(&self.dir) else {
            return;
        };
        for controller in controllers.flatten() {
            let Ok(entries) = fs::read_dir(controller.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == TMP_EXT) {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    fn list(&self, name: &str) -> SnapshotResult<Vec<(Position, PathBuf)>> {
        let dir = self.controller_dir(name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(position) = parse_snapshot_file_name(&path) {
                snapshots.push((position, path));
            }
        }
        snapshots.sort_by_key(|(position, _)| *position);
        Ok(snapshots)
    }

    fn prune(&self, name: &str) {
        let Ok(snapshots) = self.list(name) else {
            return;
        };
        if snapshots.len() <= self.keep {
            return;
        }
        let excess = snapshots.len() - self.keep;
        for (position, path) in snapshots.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(controller = name, position = %position, "pruned snapshot"),
                Err(error) => {
                    tracing::warn!(controller = name, position = %position, %error, "snapshot prune failed");
                }
            }
        }
    }
}

fn parse_snapshot_file_name(path: &Path) -> Option<Position> {
    if path.extension()? != SNAPSHOT_EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.parse::<u64>().ok().map(Position::new)
}

impl SnapshotStore for FsSnapshotStore {
    fn last_snapshot(&self, name: &str) -> SnapshotResult<Option<Box<dyn Snapshot>>> {
        let snapshots = self.list(name)?;
        Ok(snapshots
            .into_iter()
            .next_back()
            .map(|(position, path)| -> Box<dyn Snapshot> {
                Box::new(FsSnapshot { position, path })
            }))
    }

    fn create_snapshot(
        &self,
        name: &str,
        position: Position,
    ) -> SnapshotResult<Box<dyn SnapshotWriter>> {
        let dir = self.controller_dir(name);
        fs::create_dir_all(&dir).map_err(|source| SnapshotError::Io {
            path: dir.clone(),
            source,
        })?;
        let final_path = dir.join(format!("{}.{SNAPSHOT_EXT}", position.get()));
        let tmp_path = dir.join(format!("{}.{SNAPSHOT_EXT}.{TMP_EXT}", position.get()));
        let file = File::create(&tmp_path).map_err(|source| SnapshotError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        Ok(Box::new(FsSnapshotWriter {
            store_dir: self.dir.clone(),
            controller: name.to_string(),
            keep: self.keep,
            dir,
            tmp_path,
            final_path,
            file,
        }))
    }
}

struct FsSnapshot {
    position: Position,
    path: PathBuf,
}

impl Snapshot for FsSnapshot {
    fn position(&self) -> Position {
        self.position
    }

    fn restore(&self, state: &mut dyn StateResource) -> SnapshotResult<()> {
        let mut file = File::open(&self.path).map_err(|source| SnapshotError::Io {
            path: self.path.clone(),
            source,
        })?;
        state
            .restore_from(&mut file)
            .map_err(|source| SnapshotError::State { source })
    }
}

struct FsSnapshotWriter {
    store_dir: PathBuf,
    controller: String,
    keep: usize,
    dir: PathBuf,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

impl SnapshotWriter for FsSnapshotWriter {
    fn write(&mut self, state: &dyn StateResource) -> SnapshotResult<u64> {
        state
            .serialize_to(&mut self.file)
            .map_err(|source| SnapshotError::State { source })?;
        let size = self
            .file
            .metadata()
            .map_err(|source| SnapshotError::Io {
                path: self.tmp_path.clone(),
                source,
            })?
            .len();
        Ok(size)
    }

    fn commit(self: Box<Self>) -> SnapshotResult<()> {
        let result = self
            .file
            .sync_all()
            .and_then(|()| fs::rename(&self.tmp_path, &self.final_path))
            .map_err(|source| SnapshotError::Io {
                path: self.final_path.clone(),
                source,
            });
        if result.is_err() {
            let _ = fs::remove_file(&self.tmp_path);
            return result;
        }

        // fsync the directory so the rename is durable.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        let store = FsSnapshotStore {
            dir: self.store_dir.clone(),
            keep: self.keep,
        };
        store.prune(&self.controller);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let _ = fs::remove_file(&self.tmp_path);
    }
}

/// In-memory snapshot store for tests. Clones share the same backing map.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<Mutex<BTreeMap<String, BTreeMap<Position, Bytes>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        MemorySnapshotStore::default()
    }

    pub fn snapshot_count(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, BTreeMap::len)
    }

    pub fn positions(&self, name: &str) -> Vec<Position> {
        self.lock()
            .get(name)
            .map_or_else(Vec::new, |snapshots| snapshots.keys().copied().collect())
    }

    pub fn latest_position(&self, name: &str) -> Option<Position> {
        self.lock()
            .get(name)
            .and_then(|snapshots| snapshots.keys().next_back().copied())
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<Position, Bytes>>> {
        self.inner.lock().expect("snapshot store lock poisoned")
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn last_snapshot(&self, name: &str) -> SnapshotResult<Option<Box<dyn Snapshot>>> {
        Ok(self.lock().get(name).and_then(|snapshots| {
            snapshots
                .iter()
                .next_back()
                .map(|(position, blob)| -> Box<dyn Snapshot> {
                    Box::new(MemorySnapshot {
                        position: *position,
                        blob: blob.clone(),
                    })
                })
        }))
    }

    fn create_snapshot(
        &self,
        name: &str,
        position: Position,
    ) -> SnapshotResult<Box<dyn SnapshotWriter>> {
        Ok(Box::new(MemorySnapshotWriter {
            store: self.clone(),
            name: name.to_string(),
            position,
            buffer: Vec::new(),
        }))
    }
}

struct MemorySnapshot {
    position: Position,
    blob: Bytes,
}

impl Snapshot for MemorySnapshot {
    fn position(&self) -> Position {
        self.position
    }

    fn restore(&self, state: &mut dyn StateResource) -> SnapshotResult<()> {
        let mut reader = self.blob.as_ref();
        state
            .restore_from(&mut reader)
            .map_err(|source| SnapshotError::State { source })
    }
}

struct MemorySnapshotWriter {
    store: MemorySnapshotStore,
    name: String,
    position: Position,
    buffer: Vec<u8>,
}

impl SnapshotWriter for MemorySnapshotWriter {
    fn write(&mut self, state: &dyn StateResource) -> SnapshotResult<u64> {
        self.buffer.clear();
        state
            .serialize_to(&mut self.buffer)
            .map_err(|source| SnapshotError::State { source })?;
        Ok(self.buffer.len() as u64)
    }

    fn commit(self: Box<Self>) -> SnapshotResult<()> {
        self.store
            .lock()
            .entry(self.name)
            .or_default()
            .insert(self.position, Bytes::from(self.buffer));
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}
