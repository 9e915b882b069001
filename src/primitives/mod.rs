//! Low-level primitives: byte encoding helpers and positioned file I/O.

/// Byte-level utilities and encoding/decoding.
///
/// Big-endian writers, length-prefixed fields and a bounds-checked cursor.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes over real files or memory.
pub mod io;
