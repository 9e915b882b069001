#![forbid(unsafe_code)]
//! Encoding helpers and a fallible read cursor shared by codecs and redo framing.

pub mod be {
    //! Big-endian fixed-width writers and in-place patching.

    /// Appends a big-endian u32.
    pub fn put_u32(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian two's complement i64.
    pub fn put_i64(out: &mut Vec<u8>, v: i64) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    /// Overwrites four bytes at `pos` with a big-endian u32.
    ///
    /// Used to backpatch length placeholders once the framed body is known.
    pub fn patch_u32(out: &mut [u8], pos: usize, v: u32) {
        assert!(
            pos + 4 <= out.len(),
            "patch position {} beyond buffer of {} bytes",
            pos,
            out.len()
        );
        out[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

pub mod lp {
    //! Length-prefixed strings and byte runs (u32 big-endian prefix).

    use super::be;

    /// Appends a u32 length prefix followed by the UTF-8 bytes of `s`.
    pub fn put_str(out: &mut Vec<u8>, s: &str) {
        put_bytes(out, s.as_bytes());
    }

    /// Appends a u32 length prefix followed by `bytes`.
    pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
        assert!(
            bytes.len() <= u32::MAX as usize,
            "length-prefixed run too long (>{} bytes)",
            u32::MAX
        );
        be::put_u32(out, bytes.len() as u32);
        out.extend_from_slice(bytes);
    }
}

pub mod buf {
    //! A slice-backed cursor that reports truncation instead of panicking.

    use core::fmt;

    use crate::types::{Result, TidemarkError};

    /// A cursor for reading bytes from a slice with offset tracking.
    pub struct Cursor<'a> {
        /// The underlying byte slice.
        pub buf: &'a [u8],
        /// Current read offset.
        pub off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a new cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes, advancing the offset.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .ok_or(TidemarkError::Corruption("cursor offset overflow"))?;
            if end > self.buf.len() {
                return Err(TidemarkError::Corruption("cursor read beyond buffer"));
            }
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(self.take(4)?);
            Ok(u32::from_be_bytes(arr))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(arr))
        }

        /// Reads a big-endian i64.
        pub fn i64(&mut self) -> Result<i64> {
            Ok(self.u64()? as i64)
        }

        /// Reads a u32 length-prefixed byte run.
        pub fn bytes(&mut self) -> Result<&'a [u8]> {
            let len = self.u32()? as usize;
            self.take(len)
        }

        /// Reads a u32 length-prefixed UTF-8 string.
        pub fn str(&mut self) -> Result<&'a str> {
            let body = self.bytes()?;
            core::str::from_utf8(body)
                .map_err(|_| TidemarkError::Corruption("length-prefixed string not UTF-8"))
        }

        /// Returns the number of bytes remaining in the buffer.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }

        /// Returns true once every byte has been consumed.
        pub fn is_exhausted(&self) -> bool {
            self.remaining() == 0
        }
    }

    impl<'a> fmt::Debug for Cursor<'a> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
