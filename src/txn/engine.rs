use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogEntry, CatalogObject, CatalogSession, MapDefinition, ObjectKind};
use crate::config::EngineConfig;
use crate::redo::{RedoLog, RedoOptions};
use crate::storage::{
    codec_by_name, ignore_completion, MemoryMap, StorageMap, ValueCodec, VersionedValue,
};
use crate::types::{Lsn, ObjectId, Result, TidemarkError, TxnId};

use super::metrics::{default_metrics, EngineMetrics};
use super::transaction::Transaction;
use super::IsolationLevel;

const CATALOG_FILE: &str = "catalog.json";
const REDO_FILE: &str = "redo.log";

/// Construction parameters for a [`TransactionEngine`].
pub struct EngineOptions {
    config: EngineConfig,
    catalog: Arc<CatalogSession>,
    redo: Option<RedoLog>,
    metrics: Arc<dyn EngineMetrics>,
}

impl EngineOptions {
    /// Options writing catalog changes through `catalog`.
    pub fn new(catalog: Arc<CatalogSession>) -> Self {
        Self {
            config: EngineConfig::default(),
            catalog,
            redo: None,
            metrics: default_metrics(),
        }
    }

    /// Options over an in-memory catalog with no redo log.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(CatalogSession::in_memory()))
    }

    /// Sets the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Logs every commit to `redo` before applying it.
    pub fn redo_log(mut self, redo: RedoLog) -> Self {
        self.redo = Some(redo);
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Outcome of [`TransactionEngine::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Frames replayed.
    pub frames: u64,
    /// Records applied to registered maps.
    pub applied: u64,
    /// Records whose map is not registered.
    pub skipped: u64,
    /// LSN of the last replayed frame.
    pub last_lsn: Option<Lsn>,
}

/// Resolves maps by name, tracks live transactions and accounts dirty redo
/// bytes per map.
///
/// The engine never owns map contents; maps are shared handles that may be
/// dropped while transactions still reference them by name.
pub struct TransactionEngine {
    config: EngineConfig,
    catalog: Arc<CatalogSession>,
    redo: Option<RedoLog>,
    metrics: Arc<dyn EngineMetrics>,
    maps: RwLock<FxHashMap<String, Arc<dyn StorageMap>>>,
    dirty: RwLock<FxHashMap<String, Arc<AtomicU64>>>,
    live: Mutex<FxHashMap<TxnId, IsolationLevel>>,
    repeatable_readers: AtomicUsize,
    next_txn: AtomicU64,
    next_map_id: AtomicU32,
}

impl fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("maps", &self.maps.read().len())
            .field("live", &self.live.lock().len())
            .field("redo", &self.redo.is_some())
            .finish_non_exhaustive()
    }
}

impl TransactionEngine {
    fn from_options(options: EngineOptions) -> Self {
        Self {
            config: options.config,
            catalog: options.catalog,
            redo: options.redo,
            metrics: options.metrics,
            maps: RwLock::new(FxHashMap::default()),
            dirty: RwLock::new(FxHashMap::default()),
            live: Mutex::new(FxHashMap::default()),
            repeatable_readers: AtomicUsize::new(0),
            next_txn: AtomicU64::new(1),
            next_map_id: AtomicU32::new(1),
        }
    }

    /// Builds an engine and registers every map recorded in the catalog.
    pub fn open(options: EngineOptions) -> Result<Arc<Self>> {
        options.config.validate()?;
        let engine = Self::from_options(options);
        let mut restored = 0usize;
        for entry in engine.catalog.entries() {
            let CatalogObject::Map(def) = &entry.object else {
                continue;
            };
            let key_codec = resolve_codec(&def.key_codec)?;
            let value_codec = resolve_codec(&def.value_codec)?;
            engine
                .next_map_id
                .fetch_max(entry.id.0.saturating_add(1), Ordering::AcqRel);
            engine.insert_map(Arc::new(MemoryMap::new(
                entry.name.clone(),
                key_codec,
                value_codec,
            )))?;
            restored += 1;
        }
        info!(maps = restored, redo = engine.redo.is_some(), "engine.open");
        Ok(Arc::new(engine))
    }

    /// Engine over an in-memory catalog with no redo log.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::from_options(EngineOptions::in_memory()))
    }

    /// Opens the engine stored in `dir`, creating it when missing.
    ///
    /// The catalog lives in `catalog.json` and the redo log in `redo.log`,
    /// opened with the salt and sync mode of `config`. The redo log is
    /// replayed before the engine is returned.
    pub fn open_dir(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let catalog = Arc::new(CatalogSession::open_file(dir.join(CATALOG_FILE))?);
        let redo = RedoLog::open_path(dir.join(REDO_FILE), RedoOptions::from(&config))?;
        let engine = Self::open(EngineOptions::new(catalog).config(config).redo_log(redo))?;
        let stats = engine.recover()?;
        info!(
            dir = %dir.display(),
            frames = stats.frames,
            last_lsn = stats.last_lsn.map(|lsn| lsn.0),
            "engine.open_dir"
        );
        Ok(engine)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Catalog session passed in at construction.
    pub fn catalog(&self) -> &Arc<CatalogSession> {
        &self.catalog
    }

    /// Redo log, when configured.
    pub fn redo_log(&self) -> Option<&RedoLog> {
        self.redo.as_ref()
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn EngineMetrics> {
        &self.metrics
    }

    fn insert_map(&self, map: Arc<dyn StorageMap>) -> Result<()> {
        let mut maps = self.maps.write();
        let name = map.name().to_owned();
        if maps.contains_key(&name) {
            return Err(TidemarkError::MapExists(name));
        }
        maps.insert(name, map);
        Ok(())
    }

    /// Creates an in-memory map and records it in the catalog.
    pub fn create_map(
        &self,
        name: &str,
        key_codec: Arc<dyn ValueCodec>,
        value_codec: Arc<dyn ValueCodec>,
    ) -> Result<Arc<MemoryMap>> {
        let mut maps = self.maps.write();
        if maps.contains_key(name) {
            return Err(TidemarkError::MapExists(name.to_owned()));
        }
        let id = ObjectId(self.next_map_id.fetch_add(1, Ordering::AcqRel));
        self.catalog.persist(CatalogEntry::map(
            id,
            name,
            MapDefinition {
                key_codec: key_codec.name().to_owned(),
                value_codec: value_codec.name().to_owned(),
            },
        ))?;
        let map = Arc::new(MemoryMap::new(name, key_codec, value_codec));
        maps.insert(name.to_owned(), Arc::clone(&map) as Arc<dyn StorageMap>);
        debug!(map = name, id = id.0, "engine.create_map");
        Ok(map)
    }

    /// Registers an externally constructed map without touching the catalog.
    pub fn register_map(&self, map: Arc<dyn StorageMap>) -> Result<()> {
        let name = map.name().to_owned();
        self.insert_map(map)?;
        debug!(map = %name, "engine.register_map");
        Ok(())
    }

    /// Unregisters a map and removes its catalog entry.
    ///
    /// Returns false when no such map was registered. Transactions holding
    /// records for it treat the map as gone.
    pub fn drop_map(&self, name: &str) -> Result<bool> {
        let mut maps = self.maps.write();
        if maps.remove(name).is_none() {
            return Ok(false);
        }
        if self.catalog.entry(ObjectKind::Map, name).is_some() {
            self.catalog.forget(ObjectKind::Map, name)?;
        }
        self.dirty.write().remove(name);
        debug!(map = name, "engine.drop_map");
        Ok(true)
    }

    /// Map registered under `name`, or `None` once it has been dropped.
    pub fn get_storage_map(&self, name: &str) -> Option<Arc<dyn StorageMap>> {
        self.maps.read().get(name).cloned()
    }

    /// Registered map names, sorted.
    pub fn map_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.maps.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn counter(&self, map: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.dirty.read().get(map) {
            return Arc::clone(counter);
        }
        let mut dirty = self.dirty.write();
        Arc::clone(dirty.entry(map.to_owned()).or_default())
    }

    /// Adds `bytes` of pending redo to `map`'s estimate.
    pub fn increment_estimated_memory(&self, map: &str, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.counter(map).fetch_add(bytes, Ordering::AcqRel);
    }

    /// Estimated dirty bytes of `map`.
    pub fn estimated_memory(&self, map: &str) -> u64 {
        self.dirty
            .read()
            .get(map)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Sum of all maps' estimates.
    pub fn total_estimated_memory(&self) -> u64 {
        self.dirty
            .read()
            .values()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    }

    /// Maps whose estimate reached the configured dirty threshold, sorted.
    pub fn maps_over_threshold(&self) -> Vec<String> {
        let threshold = self.config.dirty_memory_threshold;
        let mut names: Vec<String> = self
            .dirty
            .read()
            .iter()
            .filter(|(_, c)| c.load(Ordering::Acquire) >= threshold)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Zeroes `map`'s estimate after it was persisted; returns the old value.
    pub fn reset_estimated_memory(&self, map: &str) -> u64 {
        self.dirty
            .read()
            .get(map)
            .map(|c| c.swap(0, Ordering::AcqRel))
            .unwrap_or(0)
    }

    /// Starts a transaction at the configured default isolation.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        self.begin_with(self.config.default_isolation)
    }

    /// Starts a transaction at `isolation`.
    pub fn begin_with(self: &Arc<Self>, isolation: IsolationLevel) -> Transaction {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::AcqRel));
        {
            let mut live = self.live.lock();
            live.insert(id, isolation);
            if isolation.requires_repeatable_read() {
                self.repeatable_readers.fetch_add(1, Ordering::AcqRel);
            }
        }
        debug!(txn = %id, ?isolation, "txn.begin");
        Transaction::new(Arc::clone(self), id, isolation)
    }

    pub(crate) fn finish(&self, id: TxnId) {
        let mut live = self.live.lock();
        if let Some(isolation) = live.remove(&id) {
            if isolation.requires_repeatable_read() {
                self.repeatable_readers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Number of transactions neither committed nor rolled back.
    pub fn active_transactions(&self) -> usize {
        self.live.lock().len()
    }

    /// True while a repeatable-read or serializable transaction is live.
    pub fn contains_repeatable_read_transactions(&self) -> bool {
        self.repeatable_readers.load(Ordering::Acquire) > 0
    }

    pub(crate) fn log_commit(&self, txn: TxnId, payload: &[u8]) -> Result<Option<Lsn>> {
        let Some(redo) = &self.redo else {
            return Ok(None);
        };
        let lsn = redo.append(txn, payload)?;
        self.metrics.redo_appended(payload.len());
        Ok(Some(lsn))
    }

    /// Replays the redo log into the registered maps.
    ///
    /// Records for maps that are not registered are skipped. A record that
    /// cannot be decoded with its map's codecs is corruption.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        let Some(redo) = &self.redo else {
            return Ok(stats);
        };
        for frame in redo.iter()? {
            let frame = frame?;
            for entry in frame.records()? {
                let Some(map) = self.get_storage_map(entry.map_name) else {
                    warn!(
                        map = entry.map_name,
                        lsn = frame.lsn.0,
                        "recover: map not registered, skipping record"
                    );
                    stats.skipped += 1;
                    continue;
                };
                let (key, payload) = entry
                    .decode(map.key_codec().as_ref(), map.value_codec().as_ref())
                    .map_err(|err| {
                        error!(
                            map = entry.map_name,
                            lsn = frame.lsn.0,
                            error = %err,
                            "recover: undecodable record"
                        );
                        TidemarkError::Corruption("redo record does not match map codecs")
                    })?;
                match payload {
                    Some(value) => {
                        map.put(key, VersionedValue::committed(Some(value)), ignore_completion());
                    }
                    None => {
                        map.remove(&key);
                    }
                }
                stats.applied += 1;
            }
            stats.frames += 1;
            stats.last_lsn = Some(frame.lsn);
        }
        info!(
            frames = stats.frames,
            applied = stats.applied,
            skipped = stats.skipped,
            "engine.recover"
        );
        Ok(stats)
    }
}

fn resolve_codec(name: &str) -> Result<Arc<dyn ValueCodec>> {
    codec_by_name(name).ok_or_else(|| TidemarkError::Catalog(format!("unknown codec '{name}'")))
}
