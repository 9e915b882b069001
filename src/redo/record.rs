//! Per-record layout inside a redo frame payload.
//!
//! ```text
//! u32 BE   map name length, then the UTF-8 name
//! u32 BE   record length: bytes that follow this field
//! ...      key, encoded by the map's key codec
//! u8       tombstone flag: 0 = value follows, 1 = delete
//! ...      payload, encoded by the map's value codec (only when flag is 0)
//! ```
//!
//! The record length is written as a placeholder and patched once the key
//! and payload are known, so readers can skip records for maps they do not
//! know about.

use crate::primitives::bytes::{be, buf::Cursor, lp};
use crate::storage::{Value, ValueCodec};
use crate::types::{Result, TidemarkError};

const FLAG_VALUE: u8 = 0;
const FLAG_DELETE: u8 = 1;

/// Appends one record to `out` and returns the number of bytes written.
///
/// On error `out` is truncated back to its original length.
pub fn encode_record(
    out: &mut Vec<u8>,
    map_name: &str,
    key: &Value,
    payload: Option<&Value>,
    key_codec: &dyn ValueCodec,
    value_codec: &dyn ValueCodec,
) -> Result<usize> {
    let start = out.len();
    match encode_into(out, map_name, key, payload, key_codec, value_codec) {
        Ok(()) => Ok(out.len() - start),
        Err(err) => {
            out.truncate(start);
            Err(err)
        }
    }
}

fn encode_into(
    out: &mut Vec<u8>,
    map_name: &str,
    key: &Value,
    payload: Option<&Value>,
    key_codec: &dyn ValueCodec,
    value_codec: &dyn ValueCodec,
) -> Result<()> {
    lp::put_str(out, map_name);
    let length_pos = out.len();
    be::put_u32(out, 0);
    let body_start = out.len();
    key_codec.encode(key, out)?;
    match payload {
        Some(value) => {
            out.push(FLAG_VALUE);
            value_codec.encode(value, out)?;
        }
        None => out.push(FLAG_DELETE),
    }
    let body_len = u32::try_from(out.len() - body_start)
        .map_err(|_| TidemarkError::Invalid("redo record exceeds u32 length"))?;
    be::patch_u32(out, length_pos, body_len);
    Ok(())
}

/// A record split out of a frame payload, body still encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoEntry<'a> {
    /// Target map name.
    pub map_name: &'a str,
    /// Key, flag and payload bytes.
    pub body: &'a [u8],
}

impl<'a> RedoEntry<'a> {
    /// Decodes the body with the target map's codecs.
    ///
    /// Returns the key and the payload, `None` for a delete.
    pub fn decode(
        &self,
        key_codec: &dyn ValueCodec,
        value_codec: &dyn ValueCodec,
    ) -> Result<(Value, Option<Value>)> {
        let mut cur = Cursor::new(self.body);
        let key = key_codec.decode(&mut cur)?;
        let payload = match cur.u8()? {
            FLAG_VALUE => Some(value_codec.decode(&mut cur)?),
            FLAG_DELETE => None,
            _ => return Err(TidemarkError::Corruption("redo record flag")),
        };
        if !cur.is_exhausted() {
            return Err(TidemarkError::Corruption("redo record trailing bytes"));
        }
        Ok((key, payload))
    }
}

/// Splits a frame payload into its records.
pub fn split_records(payload: &[u8]) -> Result<Vec<RedoEntry<'_>>> {
    let mut cur = Cursor::new(payload);
    let mut entries = Vec::new();
    while !cur.is_exhausted() {
        let map_name = cur.str()?;
        let body = cur.bytes()?;
        entries.push(RedoEntry { map_name, body });
    }
    Ok(entries)
}
