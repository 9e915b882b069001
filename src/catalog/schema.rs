use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::types::{ObjectId, Result, TidemarkError};

use super::{
    CatalogEntry, CatalogObject, CatalogSession, ObjectKind, Sequence, SequenceOptions,
    DEFAULT_CACHE_SIZE,
};

const OBJECT_ID_SEQUENCE: &str = "__object_ids";
const OBJECT_ID_SEQUENCE_ID: ObjectId = ObjectId(0);

/// Named sequences plus the internal allocator of object ids.
pub struct Schema {
    catalog: Arc<CatalogSession>,
    default_cache: i64,
    sequences: RwLock<FxHashMap<String, Arc<Sequence>>>,
    object_ids: Arc<Sequence>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("sequences", &self.sequences.read().len())
            .field("default_cache", &self.default_cache)
            .finish_non_exhaustive()
    }
}

impl Schema {
    /// Opens the schema stored in `catalog` with the default cache size.
    pub fn open(catalog: Arc<CatalogSession>) -> Result<Self> {
        Self::open_with_cache(catalog, DEFAULT_CACHE_SIZE)
    }

    /// Opens the schema with the sequence cache size of `config`.
    pub fn open_with_config(catalog: Arc<CatalogSession>, config: &EngineConfig) -> Result<Self> {
        Self::open_with_cache(catalog, config.sequence_cache_size)
    }

    /// Opens the schema stored in `catalog`, restoring every persisted
    /// sequence. `default_cache` applies to sequences created without an
    /// explicit cache size.
    pub fn open_with_cache(catalog: Arc<CatalogSession>, default_cache: i64) -> Result<Self> {
        let mut sequences = FxHashMap::default();
        let mut object_ids = None;
        for entry in catalog.entries() {
            let CatalogObject::Sequence(def) = &entry.object else {
                continue;
            };
            let seq = Arc::new(Sequence::recover(def, Arc::clone(&catalog))?);
            if entry.name == OBJECT_ID_SEQUENCE {
                object_ids = Some(seq);
            } else {
                sequences.insert(entry.name.clone(), seq);
            }
        }
        let object_ids = match object_ids {
            Some(seq) => seq,
            None => {
                let options = SequenceOptions::new()
                    .start(1)
                    .min_value(1)
                    .max_value(i64::from(u32::MAX))
                    .belongs_to_table(true);
                let seq = Sequence::create(
                    OBJECT_ID_SEQUENCE_ID,
                    OBJECT_ID_SEQUENCE,
                    &options,
                    DEFAULT_CACHE_SIZE,
                    Arc::clone(&catalog),
                )?;
                catalog.persist(CatalogEntry::sequence(seq.definition()))?;
                Arc::new(seq)
            }
        };
        info!(sequences = sequences.len(), "schema.open");
        Ok(Self {
            catalog,
            default_cache: default_cache.max(1),
            sequences: RwLock::new(sequences),
            object_ids,
        })
    }

    /// Allocates a fresh object id.
    pub fn next_object_id(&self) -> Result<ObjectId> {
        let raw = self.object_ids.next()?;
        u32::try_from(raw)
            .map(ObjectId)
            .map_err(|_| TidemarkError::Invalid("object id out of range"))
    }

    /// Creates and persists a sequence.
    pub fn create_sequence(&self, name: &str, options: SequenceOptions) -> Result<Arc<Sequence>> {
        if name == OBJECT_ID_SEQUENCE {
            return Err(TidemarkError::Invalid("sequence name is reserved"));
        }
        let mut sequences = self.sequences.write();
        if sequences.contains_key(name) {
            return Err(TidemarkError::SequenceExists(name.to_owned()));
        }
        // Validate before burning an object id.
        options.definition(ObjectId(0), name, self.default_cache)?;
        let id = self.next_object_id()?;
        let seq = Arc::new(Sequence::create(
            id,
            name,
            &options,
            self.default_cache,
            Arc::clone(&self.catalog),
        )?);
        if !seq.is_temporary() {
            self.catalog.persist(CatalogEntry::sequence(seq.definition()))?;
        }
        sequences.insert(name.to_owned(), Arc::clone(&seq));
        debug!(sequence = name, id = id.0, "schema.create_sequence");
        Ok(seq)
    }

    /// Creates the implicit sequence of an auto-increment column.
    pub fn create_table_sequence(
        &self,
        name: &str,
        start: i64,
        increment: i64,
    ) -> Result<Arc<Sequence>> {
        self.create_sequence(
            name,
            SequenceOptions::new()
                .start(start)
                .increment(increment)
                .belongs_to_table(true),
        )
    }

    /// Looks up a sequence by name.
    pub fn sequence(&self, name: &str) -> Option<Arc<Sequence>> {
        self.sequences.read().get(name).cloned()
    }

    /// User sequences, ordered by name.
    pub fn sequences(&self) -> Vec<Arc<Sequence>> {
        let mut all: Vec<_> = self.sequences.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Drops a standalone sequence. Table-owned sequences are refused.
    pub fn drop_sequence(&self, name: &str) -> Result<()> {
        let seq = self
            .sequence(name)
            .ok_or_else(|| TidemarkError::SequenceNotFound(name.to_owned()))?;
        if seq.belongs_to_table() {
            return Err(TidemarkError::Invalid(
                "sequence belongs to a table and cannot be dropped directly",
            ));
        }
        self.remove(name)
    }

    /// Drops the implicit sequence of a dropped table.
    pub fn drop_table_sequence(&self, name: &str) -> Result<()> {
        if self.sequence(name).is_none() {
            return Err(TidemarkError::SequenceNotFound(name.to_owned()));
        }
        self.remove(name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut sequences = self.sequences.write();
        let Some(seq) = sequences.get(name) else {
            return Err(TidemarkError::SequenceNotFound(name.to_owned()));
        };
        if !seq.is_temporary() {
            self.catalog.forget(ObjectKind::Sequence, name)?;
        }
        sequences.remove(name);
        debug!(sequence = name, "schema.drop_sequence");
        Ok(())
    }

    /// Persists every sequence's live cursor, releasing unused reservations.
    pub fn close(&self) -> Result<()> {
        for seq in self.sequences() {
            seq.close()?;
        }
        self.object_ids.close()
    }

    /// The catalog session the schema persists through.
    pub fn catalog(&self) -> &Arc<CatalogSession> {
        &self.catalog
    }
}
