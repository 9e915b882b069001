//! Tidemark: an MVCC transaction core with undo logging, checksummed redo
//! and catalog-backed sequences.
//!
//! A [`Transaction`] writes [`VersionedValue`]s into named maps and records
//! each write in its [`UndoLog`]. Commit serializes the log into a redo frame
//! and applies it oldest-first; rollback restores prior snapshots
//! newest-first. [`Sequence`]s hand out numbers while persisting only a
//! reserved high-water mark through the [`CatalogSession`].

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod primitives;
pub mod redo;
pub mod storage;
pub mod txn;
pub mod types;

pub use catalog::{
    CatalogEntry, CatalogObject, CatalogSession, CatalogStore, FileCatalog, MemoryCatalog, Schema,
    Sequence, SequenceDefinition, SequenceOptions,
};
pub use config::{EngineConfig, RedoSync};
pub use redo::{RedoLog, RedoOptions};
pub use storage::{MemoryMap, StorageMap, Value, ValueCodec, VersionedValue};
pub use txn::{
    EngineOptions, IsolationLevel, Transaction, TransactionEngine, UndoLog, UndoLogRecord,
};
pub use types::{Lsn, ObjectId, Result, TidemarkError, TxnId};
