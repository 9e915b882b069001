//! Self-delimiting binary codecs a map is configured with for its keys and values.
//!
//! Redo records place a key encoding directly in front of the tombstone flag
//! with no separate key length, so every codec must be able to find the end
//! of its own encoding.

use std::fmt::Debug;
use std::sync::Arc;

use crate::primitives::bytes::{be, buf::Cursor, lp};
use crate::types::{Result, TidemarkError};

use super::Value;

/// Encoder/decoder for one column type.
pub trait ValueCodec: Send + Sync + Debug {
    /// Stable name recorded in the catalog.
    fn name(&self) -> &'static str;

    /// Appends the encoding of `value` to `out`.
    ///
    /// Fails with [`TidemarkError::TypeMismatch`] when `value` is not of the
    /// type this codec handles.
    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes one value, advancing the cursor past it.
    fn decode(&self, cur: &mut Cursor<'_>) -> Result<Value>;
}

fn mismatch(codec: &'static str, value: &Value) -> TidemarkError {
    TidemarkError::TypeMismatch {
        codec,
        found: value.kind(),
    }
}

/// Fixed eight-byte big-endian integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Int64Codec;

impl ValueCodec for Int64Codec {
    fn name(&self) -> &'static str {
        "int64"
    }

    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        match value {
            Value::Int(v) => {
                be::put_i64(out, *v);
                Ok(())
            }
            other => Err(mismatch(self.name(), other)),
        }
    }

    fn decode(&self, cur: &mut Cursor<'_>) -> Result<Value> {
        Ok(Value::Int(cur.i64()?))
    }
}

/// Length-prefixed UTF-8 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl ValueCodec for TextCodec {
    fn name(&self) -> &'static str {
        "text"
    }

    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        match value {
            Value::Text(s) => {
                lp::put_str(out, s);
                Ok(())
            }
            other => Err(mismatch(self.name(), other)),
        }
    }

    fn decode(&self, cur: &mut Cursor<'_>) -> Result<Value> {
        Ok(Value::Text(cur.str()?.to_string()))
    }
}

/// Length-prefixed raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl ValueCodec for BytesCodec {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        match value {
            Value::Bytes(b) => {
                lp::put_bytes(out, b);
                Ok(())
            }
            other => Err(mismatch(self.name(), other)),
        }
    }

    fn decode(&self, cur: &mut Cursor<'_>) -> Result<Value> {
        Ok(Value::Bytes(cur.bytes()?.to_vec()))
    }
}

mod tag {
    pub const NULL: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const INT: u8 = 3;
    pub const TEXT: u8 = 4;
    pub const BYTES: u8 = 5;
    pub const ROW: u8 = 6;
}

/// Deepest row nesting [`TaggedCodec`] writes or reads back.
pub const MAX_ROW_DEPTH: usize = 64;

/// Tag byte followed by the variant body; accepts every [`Value`] nested at
/// most [`MAX_ROW_DEPTH`] rows deep.
///
/// Rows nest: a column count followed by each tagged column.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedCodec;

impl TaggedCodec {
    fn encode_depth(&self, value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<()> {
        if depth > MAX_ROW_DEPTH {
            return Err(TidemarkError::Invalid("row nesting too deep"));
        }
        match value {
            Value::Null => out.push(tag::NULL),
            Value::Bool(false) => out.push(tag::FALSE),
            Value::Bool(true) => out.push(tag::TRUE),
            Value::Int(v) => {
                out.push(tag::INT);
                be::put_i64(out, *v);
            }
            Value::Text(s) => {
                out.push(tag::TEXT);
                lp::put_str(out, s);
            }
            Value::Bytes(b) => {
                out.push(tag::BYTES);
                lp::put_bytes(out, b);
            }
            Value::Row(cols) => {
                out.push(tag::ROW);
                be::put_u32(out, cols.len() as u32);
                for col in cols {
                    self.encode_depth(col, out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn decode_depth(&self, cur: &mut Cursor<'_>, depth: usize) -> Result<Value> {
        if depth > MAX_ROW_DEPTH {
            return Err(TidemarkError::Corruption("row nesting too deep"));
        }
        let value = match cur.u8()? {
            tag::NULL => Value::Null,
            tag::FALSE => Value::Bool(false),
            tag::TRUE => Value::Bool(true),
            tag::INT => Value::Int(cur.i64()?),
            tag::TEXT => Value::Text(cur.str()?.to_string()),
            tag::BYTES => Value::Bytes(cur.bytes()?.to_vec()),
            tag::ROW => {
                let count = cur.u32()? as usize;
                let mut cols = Vec::with_capacity(count.min(cur.remaining()));
                for _ in 0..count {
                    cols.push(self.decode_depth(cur, depth + 1)?);
                }
                Value::Row(cols)
            }
            _ => return Err(TidemarkError::Corruption("unknown value tag")),
        };
        Ok(value)
    }
}

impl ValueCodec for TaggedCodec {
    fn name(&self) -> &'static str {
        "tagged"
    }

    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        self.encode_depth(value, out, 0).map_err(|err| {
            out.truncate(start);
            err
        })
    }

    fn decode(&self, cur: &mut Cursor<'_>) -> Result<Value> {
        self.decode_depth(cur, 0)
    }
}

/// Looks up a built-in codec by its catalog name.
pub fn codec_by_name(name: &str) -> Option<Arc<dyn ValueCodec>> {
    let codec: Arc<dyn ValueCodec> = match name {
        "int64" => Arc::new(Int64Codec),
        "text" => Arc::new(TextCodec),
        "bytes" => Arc::new(BytesCodec),
        "tagged" => Arc::new(TaggedCodec),
        _ => return None,
    };
    Some(codec)
}
