use crate::types::TxnId;

use super::Value;

/// Value wrapper carrying transaction-visibility metadata.
///
/// A map slot holds exactly one `VersionedValue`. While uncommitted it is
/// owned by the writing transaction, and the prior snapshot needed to undo
/// the write lives in that transaction's undo record, not here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    payload: Option<Value>,
    owner: Option<TxnId>,
    committed: bool,
    previous: Option<Value>,
}

impl VersionedValue {
    /// Creates an uncommitted version written by `owner`.
    ///
    /// `payload == None` records a logical delete. `previous` is the last
    /// committed payload of the key, shown to other transactions until this
    /// version commits.
    pub fn uncommitted(owner: TxnId, payload: Option<Value>, previous: Option<Value>) -> Self {
        Self {
            payload,
            owner: Some(owner),
            committed: false,
            previous,
        }
    }

    /// Creates an already committed version, as produced by redo replay.
    pub fn committed(payload: Option<Value>) -> Self {
        Self {
            payload,
            owner: None,
            committed: true,
            previous: None,
        }
    }

    /// Marks the version committed and detaches it from its transaction.
    ///
    /// `is_insert` only feeds diagnostics: an insert never carries a
    /// previous committed payload.
    pub fn commit(&mut self, is_insert: bool) {
        debug_assert!(
            !is_insert || self.previous.is_none(),
            "insert carried a previous committed payload"
        );
        self.committed = true;
        self.owner = None;
        self.previous = None;
    }

    /// Restores the pre-transaction snapshot in place.
    pub fn rollback(&mut self, old: &VersionedValue) {
        self.payload = old.payload.clone();
        self.owner = old.owner;
        self.committed = old.committed;
        self.previous = old.previous.clone();
    }

    /// The user payload; `None` for a delete.
    pub fn value(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Consumes the version, returning its payload.
    pub fn into_value(self) -> Option<Value> {
        self.payload
    }

    /// True for a committed delete marker (tombstone).
    pub fn is_delete(&self) -> bool {
        self.committed && self.payload.is_none()
    }

    /// True once the owning transaction committed.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// The payload other transactions currently read for this key.
    pub fn last_committed(&self) -> Option<&Value> {
        if self.committed {
            self.payload.as_ref()
        } else {
            self.previous.as_ref()
        }
    }

    /// The transaction holding this version, if uncommitted.
    pub fn owner(&self) -> Option<TxnId> {
        self.owner
    }

    /// True when `txn` wrote this still-uncommitted version.
    pub fn is_owned_by(&self, txn: TxnId) -> bool {
        !self.committed && self.owner == Some(txn)
    }

    /// The payload `txn` observes: its own or committed writes, otherwise the
    /// last committed payload.
    pub fn visible_to(&self, txn: TxnId) -> Option<&Value> {
        if self.committed || self.owner == Some(txn) {
            self.payload.as_ref()
        } else {
            self.previous.as_ref()
        }
    }
}
