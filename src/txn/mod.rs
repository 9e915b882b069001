//! Transaction core: undo logging, commit application and the engine that
//! resolves maps, tracks live transactions and accounts redo memory.
//!
//! Within one transaction, commit and redo serialization walk the undo log
//! oldest-first while rollback walks it newest-first. A key written twice in
//! one transaction is only restored to its pre-transaction value by the
//! newest-first walk.

mod engine;
mod metrics;
mod transaction;
mod undo;

use serde::{Deserialize, Serialize};

pub use engine::{EngineOptions, RecoveryStats, TransactionEngine};
pub use metrics::{default_metrics, CounterMetrics, EngineMetrics, NoopMetrics};
pub use transaction::{Savepoint, Transaction, TxnState};
pub use undo::{RecordState, UndoKind, UndoLog, UndoLogRecord};

/// Isolation level a transaction runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Each read sees the latest committed version.
    #[default]
    ReadCommitted,
    /// Reads stay consistent for the life of the transaction.
    RepeatableRead,
    /// Repeatable read plus conflict serialization by the caller.
    Serializable,
}

impl IsolationLevel {
    /// True when committed deletes must leave a tombstone for this reader.
    pub fn requires_repeatable_read(self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}
