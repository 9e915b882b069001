use std::fmt;

use tracing::{error, trace, warn};

use crate::redo::encode_record;
use crate::storage::{ignore_completion, StorageMap, Value, VersionedValue};
use crate::types::Result;

use super::TransactionEngine;

/// What a write did to its key, with the snapshot needed to reverse it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UndoKind {
    /// The key was absent (or a committed tombstone) before the write.
    Insert,
    /// The key held `old` and the write stored a new payload.
    Update {
        /// Version present before the write.
        old: VersionedValue,
    },
    /// The key held `old` and the write stored a delete marker.
    Delete {
        /// Version present before the write.
        old: VersionedValue,
    },
}

/// Lifecycle of one undo record. Every state other than `Pending` is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    /// Neither committed nor rolled back yet.
    Pending,
    /// Committed into its map.
    Applied,
    /// Rolled back.
    Reverted,
    /// The target map disappeared before the record was finished.
    Skipped,
}

/// One undoable write: target map, key, the version written and the snapshot
/// it replaced.
#[derive(Clone)]
pub struct UndoLogRecord {
    map_name: String,
    key: Value,
    kind: UndoKind,
    new_value: VersionedValue,
    state: RecordState,
}

impl fmt::Debug for UndoLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoLogRecord")
            .field("map", &self.map_name)
            .field("key", &self.key)
            .field("kind", &self.kind_name())
            .field("state", &self.state)
            .finish()
    }
}

impl UndoLogRecord {
    /// Creates a pending record.
    ///
    /// `old` is the version that was in the map before the write; pass `None`
    /// when the key was absent or held a committed tombstone.
    pub fn new(
        map_name: impl Into<String>,
        key: Value,
        old: Option<VersionedValue>,
        new_value: VersionedValue,
    ) -> Self {
        let kind = match old {
            None => UndoKind::Insert,
            Some(old) if new_value.value().is_none() => UndoKind::Delete { old },
            Some(old) => UndoKind::Update { old },
        };
        Self {
            map_name: map_name.into(),
            key,
            kind,
            new_value,
            state: RecordState::Pending,
        }
    }

    /// Name of the target map.
    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    /// The written key.
    pub fn key(&self) -> &Value {
        &self.key
    }

    /// Insert, update or delete, with the prior snapshot.
    pub fn kind(&self) -> &UndoKind {
        &self.kind
    }

    /// The version this record wrote.
    pub fn new_value(&self) -> &VersionedValue {
        &self.new_value
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// True once committed, rolled back or skipped.
    pub fn is_undone(&self) -> bool {
        self.state != RecordState::Pending
    }

    /// True when the key had no live version before the write.
    pub fn is_insert(&self) -> bool {
        matches!(self.kind, UndoKind::Insert)
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            UndoKind::Insert => "insert",
            UndoKind::Update { .. } => "update",
            UndoKind::Delete { .. } => "delete",
        }
    }

    fn resolve(&mut self, engine: &TransactionEngine) -> Option<std::sync::Arc<dyn StorageMap>> {
        match engine.get_storage_map(&self.map_name) {
            Some(map) => Some(map),
            None => {
                warn!(map = %self.map_name, "undo.record: map dropped, skipping");
                self.state = RecordState::Skipped;
                engine.metrics().record_skipped();
                None
            }
        }
    }

    /// Applies the write's committed form to its map.
    ///
    /// A delete is removed outright unless a repeatable-read transaction is
    /// live, in which case a committed tombstone stays behind and the map's
    /// row count is lowered. No-op once undone or when the map is gone.
    pub fn commit(&mut self, engine: &TransactionEngine) {
        if self.is_undone() {
            return;
        }
        let Some(map) = self.resolve(engine) else {
            return;
        };
        let is_insert = self.is_insert();
        let mut committed = self.new_value.clone();
        committed.commit(is_insert);
        if committed.value().is_none() {
            if engine.contains_repeatable_read_transactions() {
                map.decrement_size();
                map.put(self.key.clone(), committed, ignore_completion());
            } else {
                map.remove(&self.key);
            }
        } else {
            map.put(self.key.clone(), committed, ignore_completion());
        }
        trace!(map = %self.map_name, kind = self.kind_name(), "undo.commit");
        self.state = RecordState::Applied;
    }

    /// Restores the key to its state before the write.
    ///
    /// No-op once undone or when the map is gone.
    pub fn rollback(&mut self, engine: &TransactionEngine) {
        if self.is_undone() {
            return;
        }
        let Some(map) = self.resolve(engine) else {
            return;
        };
        match &self.kind {
            UndoKind::Insert => {
                map.remove(&self.key);
            }
            UndoKind::Update { old } | UndoKind::Delete { old } => {
                let mut restored = self.new_value.clone();
                restored.rollback(old);
                map.put(self.key.clone(), restored, ignore_completion());
            }
        }
        trace!(map = %self.map_name, kind = self.kind_name(), "undo.rollback");
        self.state = RecordState::Reverted;
    }

    /// Appends this record's redo form to `buf` and returns the bytes written.
    ///
    /// Writes nothing and returns 0 once undone or when the map is gone.
    /// Every byte written is added to the map's estimated dirty memory.
    pub fn write_for_redo(&self, buf: &mut Vec<u8>, engine: &TransactionEngine) -> Result<usize> {
        if self.is_undone() {
            return Ok(0);
        }
        let Some(map) = engine.get_storage_map(&self.map_name) else {
            return Ok(0);
        };
        let written = encode_record(
            buf,
            &self.map_name,
            &self.key,
            self.new_value.value(),
            map.key_codec().as_ref(),
            map.value_codec().as_ref(),
        )
        .inspect_err(|err| error!(map = %self.map_name, error = %err, "undo.redo: encode failed"))?;
        engine.increment_estimated_memory(&self.map_name, written as u64);
        Ok(written)
    }
}

/// Handle to a position in an [`UndoLog`].
pub type LogPosition = usize;

/// Ordered records of one transaction's writes.
#[derive(Default, Debug, Clone)]
pub struct UndoLog {
    records: Vec<UndoLogRecord>,
}

impl UndoLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns its position.
    pub fn append(&mut self, record: UndoLogRecord) -> LogPosition {
        self.records.push(record);
        self.records.len() - 1
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no write was logged.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at `pos`.
    pub fn get(&self, pos: LogPosition) -> Option<&UndoLogRecord> {
        self.records.get(pos)
    }

    /// Records oldest-first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &UndoLogRecord> {
        self.records.iter()
    }

    /// Records newest-first.
    pub fn iter_rev(&self) -> impl Iterator<Item = &UndoLogRecord> {
        self.records.iter().rev()
    }

    /// Commits every record oldest-first; returns how many were applied.
    pub fn commit(&mut self, engine: &TransactionEngine) -> usize {
        let mut applied = 0;
        for record in &mut self.records {
            record.commit(engine);
            if record.state() == RecordState::Applied {
                applied += 1;
            }
        }
        applied
    }

    /// Rolls back every record newest-first; returns how many were reverted.
    pub fn rollback(&mut self, engine: &TransactionEngine) -> usize {
        self.rollback_to(0, engine)
    }

    /// Rolls back records at positions `>= pos` newest-first and drops them.
    pub fn rollback_to(&mut self, pos: LogPosition, engine: &TransactionEngine) -> usize {
        let mut reverted = 0;
        while self.records.len() > pos {
            let Some(mut record) = self.records.pop() else {
                break;
            };
            let was_pending = !record.is_undone();
            record.rollback(engine);
            if was_pending && record.state() == RecordState::Reverted {
                reverted += 1;
            }
        }
        reverted
    }

    /// Serializes every live record oldest-first into `buf`.
    pub fn write_for_redo(&self, buf: &mut Vec<u8>, engine: &TransactionEngine) -> Result<usize> {
        let mut total = 0;
        for record in &self.records {
            total += record.write_for_redo(buf, engine)?;
        }
        Ok(total)
    }
}
