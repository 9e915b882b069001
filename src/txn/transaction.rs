use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::storage::{Value, VersionedValue};
use crate::types::{Result, TidemarkError, TxnId};

use super::undo::{LogPosition, UndoLog, UndoLogRecord};
use super::{IsolationLevel, TransactionEngine};

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting reads and writes.
    Active,
    /// Writes applied.
    Committed,
    /// Writes reverted.
    RolledBack,
}

/// Position in a transaction's undo log to roll back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(LogPosition);

/// A unit of work over the engine's maps.
///
/// Writes take effect immediately as versions owned by this transaction;
/// other transactions keep reading the last committed payload until commit.
/// Dropping an active transaction rolls it back.
pub struct Transaction {
    engine: Arc<TransactionEngine>,
    id: TxnId,
    isolation: IsolationLevel,
    log: UndoLog,
    state: TxnState,
    started: Instant,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("state", &self.state)
            .field("records", &self.log.len())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        engine: Arc<TransactionEngine>,
        id: TxnId,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            engine,
            id,
            isolation,
            log: UndoLog::new(),
            state: TxnState::Active,
            started: Instant::now(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Writes logged so far.
    pub fn undo_log(&self) -> &UndoLog {
        &self.log
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(TidemarkError::TransactionClosed(self.id))
        }
    }

    /// Stores `value` under `key` in `map`.
    pub fn put(&mut self, map: &str, key: Value, value: Value) -> Result<()> {
        self.write(map, key, Some(value)).map(|_| ())
    }

    /// Deletes `key` from `map`; returns false when it was not visible.
    pub fn delete(&mut self, map: &str, key: &Value) -> Result<bool> {
        self.write(map, key.clone(), None)
    }

    /// Reads `key` from `map` as this transaction sees it.
    pub fn get(&self, map: &str, key: &Value) -> Result<Option<Value>> {
        self.ensure_active()?;
        let storage = self
            .engine
            .get_storage_map(map)
            .ok_or_else(|| TidemarkError::MapNotFound(map.to_owned()))?;
        Ok(storage
            .get(key)
            .and_then(|version| version.visible_to(self.id).cloned()))
    }

    fn write(&mut self, map_name: &str, key: Value, payload: Option<Value>) -> Result<bool> {
        self.ensure_active()?;
        let map = self
            .engine
            .get_storage_map(map_name)
            .ok_or_else(|| TidemarkError::MapNotFound(map_name.to_owned()))?;
        let id = self.id;
        let mut written: Option<VersionedValue> = None;
        let previous = map.replace(key.clone(), &mut |current: Option<&VersionedValue>| {
            if let Some(cur) = current {
                if let Some(owner) = cur.owner().filter(|owner| *owner != id) {
                    return Err(TidemarkError::WriteConflict {
                        map: map_name.to_owned(),
                        owner,
                    });
                }
            }
            if payload.is_none() && current.and_then(|cur| cur.visible_to(id)).is_none() {
                return Ok(None);
            }
            let last_committed = current.and_then(|cur| cur.last_committed().cloned());
            let version = VersionedValue::uncommitted(id, payload.clone(), last_committed);
            written = Some(version.clone());
            Ok(Some(version))
        })?;
        let Some(new_value) = written else {
            return Ok(false);
        };
        // A committed tombstone reads as absent, so writing over it is an insert.
        let old = previous.filter(|prev| !prev.is_delete());
        self.log
            .append(UndoLogRecord::new(map_name, key, old, new_value));
        Ok(true)
    }

    /// Marks the current position in the undo log.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.log.len())
    }

    /// Reverts every write made after `savepoint`.
    pub fn rollback_to(&mut self, savepoint: Savepoint) -> Result<()> {
        self.ensure_active()?;
        if savepoint.0 > self.log.len() {
            return Err(TidemarkError::Invalid("savepoint is ahead of the undo log"));
        }
        let reverted = self.log.rollback_to(savepoint.0, &self.engine);
        debug!(txn = %self.id, reverted, "txn.rollback_to");
        Ok(())
    }

    /// Logs the writes to redo, then applies them.
    ///
    /// If building or appending the redo frame fails, the transaction is
    /// rolled back and the error returned.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let mut redo = Vec::new();
        let logged = self
            .log
            .write_for_redo(&mut redo, &self.engine)
            .and_then(|_| {
                if redo.is_empty() {
                    Ok(None)
                } else {
                    self.engine.log_commit(self.id, &redo)
                }
            });
        let lsn = match logged {
            Ok(lsn) => lsn,
            Err(err) => {
                self.abort();
                return Err(err);
            }
        };
        let applied = self.log.commit(&self.engine);
        self.state = TxnState::Committed;
        self.engine.finish(self.id);
        self.engine.metrics().transaction_committed(applied);
        debug!(
            txn = %self.id,
            applied,
            redo_bytes = redo.len(),
            lsn = lsn.map(|l| l.0),
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "txn.commit"
        );
        Ok(())
    }

    /// Reverts every write.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        self.abort();
        Ok(())
    }

    fn abort(&mut self) {
        let reverted = self.log.rollback(&self.engine);
        self.state = TxnState::RolledBack;
        self.engine.finish(self.id);
        self.engine.metrics().transaction_rolled_back(reverted);
        debug!(txn = %self.id, reverted, "txn.rollback");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            warn!(
                txn = %self.id,
                records = self.log.len(),
                "txn dropped while active, rolling back"
            );
            self.abort();
        }
    }
}
