use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::types::Result;

use super::{Value, ValueCodec, VersionedValue};

/// Completion hook handed to [`StorageMap::put`]; receives the replaced version.
pub type PutCallback = Box<dyn FnOnce(Option<VersionedValue>) + Send>;

/// Returns a completion hook that ignores its outcome.
pub fn ignore_completion() -> PutCallback {
    Box::new(|_| {})
}

/// Ordered key-value store the transaction core writes versioned values into.
///
/// The core treats `put` as the visibility boundary for every committed write:
/// a version returned by `get` is a copy, and mutating it has no effect until
/// it is put back.
pub trait StorageMap: Send + Sync {
    /// Name the map is registered under.
    fn name(&self) -> &str;

    /// Codec used for keys in redo records.
    fn key_codec(&self) -> &Arc<dyn ValueCodec>;

    /// Codec used for payloads in redo records.
    fn value_codec(&self) -> &Arc<dyn ValueCodec>;

    /// Returns a copy of the version stored under `key`.
    fn get(&self, key: &Value) -> Option<VersionedValue>;

    /// Stores `value` under `key`.
    ///
    /// `on_complete` runs once the write is visible; callers must not assume
    /// it has run when `put` returns.
    fn put(&self, key: Value, value: VersionedValue, on_complete: PutCallback);

    /// Removes `key`, returning the version it held.
    fn remove(&self, key: &Value) -> Option<VersionedValue>;

    /// Atomically inspects the current version of `key` and optionally
    /// replaces it.
    ///
    /// `f` returns `Some(new)` to store `new` or `None` to leave the slot as
    /// is. Returns the version that was present before the call.
    fn replace(
        &self,
        key: Value,
        f: &mut dyn FnMut(Option<&VersionedValue>) -> Result<Option<VersionedValue>>,
    ) -> Result<Option<VersionedValue>>;

    /// Lowers the logical row count by one without touching the slot.
    ///
    /// Used when a committed delete leaves a tombstone behind.
    fn decrement_size(&self);

    /// Logical number of rows: live versions, excluding tombstones.
    fn size(&self) -> u64;
}

/// In-memory ordered implementation of [`StorageMap`].
pub struct MemoryMap {
    name: String,
    key_codec: Arc<dyn ValueCodec>,
    value_codec: Arc<dyn ValueCodec>,
    slots: RwLock<BTreeMap<Value, VersionedValue>>,
    size: AtomicI64,
}

impl MemoryMap {
    /// Creates an empty map.
    pub fn new(
        name: impl Into<String>,
        key_codec: Arc<dyn ValueCodec>,
        value_codec: Arc<dyn ValueCodec>,
    ) -> Self {
        Self {
            name: name.into(),
            key_codec,
            value_codec,
            slots: RwLock::new(BTreeMap::new()),
            size: AtomicI64::new(0),
        }
    }

    /// Number of occupied slots, tombstones included.
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Copies every slot in key order.
    pub fn entries(&self) -> Vec<(Value, VersionedValue)> {
        self.slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn account_put(&self, previous: Option<&VersionedValue>, new: &VersionedValue) {
        let was_live = previous.map(|p| !p.is_delete()).unwrap_or(false);
        if !was_live && !new.is_delete() {
            self.size.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn account_remove(&self, previous: Option<&VersionedValue>) {
        if previous.map(|p| !p.is_delete()).unwrap_or(false) {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMap")
            .field("name", &self.name)
            .field("key_codec", &self.key_codec.name())
            .field("value_codec", &self.value_codec.name())
            .field("size", &self.size())
            .finish()
    }
}

impl StorageMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_codec(&self) -> &Arc<dyn ValueCodec> {
        &self.key_codec
    }

    fn value_codec(&self) -> &Arc<dyn ValueCodec> {
        &self.value_codec
    }

    fn get(&self, key: &Value) -> Option<VersionedValue> {
        self.slots.read().get(key).cloned()
    }

    fn put(&self, key: Value, value: VersionedValue, on_complete: PutCallback) {
        let previous = {
            let mut slots = self.slots.write();
            self.account_put(slots.get(&key), &value);
            slots.insert(key, value)
        };
        trace!(map = %self.name, replaced = previous.is_some(), "map.put");
        on_complete(previous);
    }

    fn remove(&self, key: &Value) -> Option<VersionedValue> {
        let mut slots = self.slots.write();
        let previous = slots.remove(key);
        self.account_remove(previous.as_ref());
        previous
    }

    fn replace(
        &self,
        key: Value,
        f: &mut dyn FnMut(Option<&VersionedValue>) -> Result<Option<VersionedValue>>,
    ) -> Result<Option<VersionedValue>> {
        let mut slots = self.slots.write();
        let current = slots.get(&key);
        let previous = current.cloned();
        if let Some(new) = f(current)? {
            self.account_put(previous.as_ref(), &new);
            slots.insert(key, new);
        }
        Ok(previous)
    }

    fn decrement_size(&self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire).max(0) as u64
    }
}
