#![forbid(unsafe_code)]
//! Identifiers, error type and checksum helpers shared across the crate.

pub mod checksum;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use checksum::{Checksum, Crc32Fast};

/// Identifier assigned to every transaction started by the engine.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

/// Log sequence number of a redo frame.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Identifier of a catalog object (sequence, map).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct ObjectId(pub u32);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the engine.
#[derive(thiserror::Error, Debug)]
pub enum TidemarkError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Generic lookup miss.
    #[error("not found")]
    NotFound,
    /// No map is registered under the given name.
    #[error("map '{0}' not found")]
    MapNotFound(String),
    /// A map with the given name is already registered.
    #[error("map '{0}' already exists")]
    MapExists(String),
    /// A sequence with the given name already exists.
    #[error("sequence '{0}' already exists")]
    SequenceExists(String),
    /// No sequence with the given name exists.
    #[error("sequence '{0}' not found")]
    SequenceNotFound(String),
    /// A prospective combination of sequence attributes was rejected.
    #[error(
        "invalid sequence '{name}': start={start} min={min} max={max} increment={increment}"
    )]
    SequenceAttributesInvalid {
        /// Sequence name.
        name: String,
        /// Rejected start value.
        start: i64,
        /// Rejected minimum.
        min: i64,
        /// Rejected maximum.
        max: i64,
        /// Rejected increment.
        increment: i64,
    },
    /// A non-cycling sequence passed its bound.
    #[error("sequence '{name}' has run out of numbers")]
    SequenceExhausted {
        /// Sequence name.
        name: String,
    },
    /// A value could not be handled by the codec configured for its map.
    #[error("type mismatch: codec {codec} cannot handle {found}")]
    TypeMismatch {
        /// Codec name.
        codec: &'static str,
        /// Kind of the offending value.
        found: &'static str,
    },
    /// The key holds an uncommitted version owned by another transaction.
    #[error("write conflict on map '{map}': key locked by {owner}")]
    WriteConflict {
        /// Map name.
        map: String,
        /// Transaction owning the uncommitted version.
        owner: TxnId,
    },
    /// A failed redo append left bytes behind that could not be discarded.
    #[error("redo log poisoned by an append that could not be discarded")]
    RedoPoisoned,
    /// The transaction already committed or rolled back.
    #[error("{0} is no longer active")]
    TransactionClosed(TxnId),
    /// The catalog store rejected an operation.
    #[error("catalog: {0}")]
    Catalog(String),
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(String),
    /// Structured (de)serialization failed.
    #[error("serialization: {0}")]
    Serialization(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TidemarkError>;

impl From<serde_json::Error> for TidemarkError {
    fn from(err: serde_json::Error) -> Self {
        TidemarkError::Serialization(err.to_string())
    }
}
