//! Versioned values, key/value codecs and the ordered map contract.
//!
//! The transaction core treats a map as an opaque ordered store: it reads and
//! writes [`VersionedValue`]s by key and asks the map for the codecs used to
//! serialize redo records.

/// Self-delimiting codecs for keys and payloads.
pub mod codec;

mod map;
mod mvcc;
mod value;

pub use codec::{
    codec_by_name, BytesCodec, Int64Codec, TaggedCodec, TextCodec, ValueCodec, MAX_ROW_DEPTH,
};
pub use map::{ignore_completion, MemoryMap, PutCallback, StorageMap};
pub use mvcc::VersionedValue;
pub use value::Value;
