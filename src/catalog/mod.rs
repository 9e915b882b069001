//! Catalog of persistent object definitions: sequences and maps.
//!
//! Every write goes through a [`CatalogSession`], which serializes access to
//! the underlying [`CatalogStore`]. Callers take the session lock with
//! [`CatalogSession::lock`], stage writes and commit; a guard dropped without
//! committing rolls its staged writes back.

mod schema;
mod sequence;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{ObjectId, Result, TidemarkError};

pub use schema::Schema;
pub use sequence::{Sequence, SequenceDefinition, SequenceOptions, DEFAULT_CACHE_SIZE};

/// Kind of a catalog object; entries are unique per kind and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A number generator.
    Sequence,
    /// A key-value map.
    Map,
}

/// Persisted shape of a map: the codecs its keys and payloads use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDefinition {
    /// Name accepted by [`codec_by_name`](crate::storage::codec_by_name).
    pub key_codec: String,
    /// Name accepted by [`codec_by_name`](crate::storage::codec_by_name).
    pub value_codec: String,
}

/// Definition payload of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogObject {
    /// Sequence attributes and its persisted cursor.
    Sequence(SequenceDefinition),
    /// Map codecs.
    Map(MapDefinition),
}

/// One persisted object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Object id.
    pub id: ObjectId,
    /// Object name.
    pub name: String,
    /// Definition.
    pub object: CatalogObject,
}

impl CatalogEntry {
    /// Wraps a sequence definition.
    pub fn sequence(def: SequenceDefinition) -> Self {
        Self {
            id: def.id,
            name: def.name.clone(),
            object: CatalogObject::Sequence(def),
        }
    }

    /// Wraps a map definition.
    pub fn map(id: ObjectId, name: impl Into<String>, def: MapDefinition) -> Self {
        Self {
            id,
            name: name.into(),
            object: CatalogObject::Map(def),
        }
    }

    /// Kind of the wrapped object.
    pub fn kind(&self) -> ObjectKind {
        match self.object {
            CatalogObject::Sequence(_) => ObjectKind::Sequence,
            CatalogObject::Map(_) => ObjectKind::Map,
        }
    }
}

/// Backing store for catalog entries with commit/rollback of staged writes.
pub trait CatalogStore: Send {
    /// Stages an insert or overwrite of `entry`.
    fn write_entry(&mut self, entry: CatalogEntry) -> Result<()>;

    /// Stages the removal of an entry; removing an absent entry is a no-op.
    fn remove_entry(&mut self, kind: ObjectKind, name: &str) -> Result<()>;

    /// Makes staged writes durable.
    fn commit(&mut self) -> Result<()>;

    /// Discards staged writes.
    fn rollback(&mut self);

    /// Committed entries, ordered by kind and name.
    fn entries(&self) -> Vec<CatalogEntry>;
}

#[derive(Debug, Clone)]
enum Staged {
    Write(CatalogEntry),
    Remove(ObjectKind, String),
}

/// Catalog held in memory; staged writes apply on commit.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    committed: BTreeMap<(ObjectKind, String), CatalogEntry>,
    staged: Vec<Staged>,
}

impl MemoryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let committed = entries
            .into_iter()
            .map(|entry| ((entry.kind(), entry.name.clone()), entry))
            .collect();
        Self {
            committed,
            staged: Vec::new(),
        }
    }

    /// Number of writes waiting for commit.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

impl CatalogStore for MemoryCatalog {
    fn write_entry(&mut self, entry: CatalogEntry) -> Result<()> {
        self.staged.push(Staged::Write(entry));
        Ok(())
    }

    fn remove_entry(&mut self, kind: ObjectKind, name: &str) -> Result<()> {
        self.staged.push(Staged::Remove(kind, name.to_owned()));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        for op in self.staged.drain(..) {
            match op {
                Staged::Write(entry) => {
                    self.committed
                        .insert((entry.kind(), entry.name.clone()), entry);
                }
                Staged::Remove(kind, name) => {
                    self.committed.remove(&(kind, name));
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged.clear();
    }

    fn entries(&self) -> Vec<CatalogEntry> {
        self.committed.values().cloned().collect()
    }
}

#[derive(Serialize, Deserialize)]
struct CatalogDocument {
    version: u32,
    entries: Vec<CatalogEntry>,
}

const CATALOG_DOCUMENT_VERSION: u32 = 1;

/// Catalog persisted as a JSON document, replaced atomically on commit.
pub struct FileCatalog {
    path: PathBuf,
    inner: MemoryCatalog,
}

impl fmt::Debug for FileCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCatalog")
            .field("path", &self.path)
            .field("entries", &self.inner.committed.len())
            .finish()
    }
}

impl FileCatalog {
    /// Opens the catalog at `path`, starting empty when the file is missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = if path.exists() {
            MemoryCatalog::from_entries(read_document(&path)?)
        } else {
            MemoryCatalog::new()
        };
        debug!(path = %path.display(), entries = inner.committed.len(), "catalog.open");
        Ok(Self { path, inner })
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let doc = CatalogDocument {
            version: CATALOG_DOCUMENT_VERSION,
            entries: self.inner.entries(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|err| TidemarkError::Io(err.error))?;
        Ok(())
    }
}

/// Reads the entries of a catalog document without opening it for writes.
pub fn read_document(path: &Path) -> Result<Vec<CatalogEntry>> {
    let bytes = fs::read(path)?;
    let doc: CatalogDocument = serde_json::from_slice(&bytes)?;
    if doc.version != CATALOG_DOCUMENT_VERSION {
        return Err(TidemarkError::Catalog(format!(
            "unsupported catalog document version {}",
            doc.version
        )));
    }
    Ok(doc.entries)
}

impl CatalogStore for FileCatalog {
    fn write_entry(&mut self, entry: CatalogEntry) -> Result<()> {
        self.inner.write_entry(entry)
    }

    fn remove_entry(&mut self, kind: ObjectKind, name: &str) -> Result<()> {
        self.inner.remove_entry(kind, name)
    }

    fn commit(&mut self) -> Result<()> {
        if self.inner.staged.is_empty() {
            return Ok(());
        }
        let before = self.inner.committed.clone();
        self.inner.commit()?;
        if let Err(err) = self.persist() {
            self.inner.committed = before;
            return Err(err);
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.inner.rollback();
    }

    fn entries(&self) -> Vec<CatalogEntry> {
        self.inner.entries()
    }
}

/// Counters for catalog activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    /// Entries written or removed.
    pub writes: u64,
    /// Successful commits.
    pub commits: u64,
    /// Guards dropped with staged writes.
    pub rollbacks: u64,
}

/// Mutex-guarded handle to the catalog store.
pub struct CatalogSession {
    store: Mutex<Box<dyn CatalogStore>>,
    writes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl fmt::Debug for CatalogSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogSession")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CatalogSession {
    /// Wraps a store.
    pub fn new(store: Box<dyn CatalogStore>) -> Self {
        Self {
            store: Mutex::new(store),
            writes: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    /// Session over a fresh [`MemoryCatalog`].
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryCatalog::new()))
    }

    /// Session over a [`FileCatalog`] at `path`.
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(Box::new(FileCatalog::open(path)?)))
    }

    /// Takes the session lock.
    pub fn lock(&self) -> CatalogTxn<'_> {
        CatalogTxn {
            store: self.store.lock(),
            session: self,
            dirty: false,
        }
    }

    /// Writes one entry and commits.
    pub fn persist(&self, entry: CatalogEntry) -> Result<()> {
        let mut txn = self.lock();
        txn.write(entry)?;
        txn.commit()
    }

    /// Removes one entry and commits.
    pub fn forget(&self, kind: ObjectKind, name: &str) -> Result<()> {
        let mut txn = self.lock();
        txn.remove(kind, name)?;
        txn.commit()
    }

    /// Committed entries.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.store.lock().entries()
    }

    /// Committed entry for `kind` and `name`.
    pub fn entry(&self, kind: ObjectKind, name: &str) -> Option<CatalogEntry> {
        self.entries()
            .into_iter()
            .find(|entry| entry.kind() == kind && entry.name == name)
    }

    /// Returns activity counters.
    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            writes: self.writes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive access to the catalog store for one batch of writes.
pub struct CatalogTxn<'a> {
    store: MutexGuard<'a, Box<dyn CatalogStore>>,
    session: &'a CatalogSession,
    dirty: bool,
}

impl CatalogTxn<'_> {
    /// Stages `entry`.
    pub fn write(&mut self, entry: CatalogEntry) -> Result<()> {
        self.store.write_entry(entry)?;
        self.dirty = true;
        self.session.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stages the removal of `kind`/`name`.
    pub fn remove(&mut self, kind: ObjectKind, name: &str) -> Result<()> {
        self.store.remove_entry(kind, name)?;
        self.dirty = true;
        self.session.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Commits staged writes. On failure the staged writes are discarded.
    pub fn commit(mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;
        if let Err(err) = self.store.commit() {
            self.store.rollback();
            self.session.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        self.session.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for CatalogTxn<'_> {
    fn drop(&mut self) {
        if self.dirty {
            warn!("catalog: guard dropped with staged writes, rolling back");
            self.store.rollback();
            self.session.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }
}
