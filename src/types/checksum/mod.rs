#![forbid(unsafe_code)]

pub trait Checksum {
    fn reset(&mut self);
    fn update(&mut self, bytes: &[u8]);
    fn finalize(&self) -> u32;
}

pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 over a sequence of slices, as used by redo headers and payloads.
pub fn crc32_of(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Payload checksum salted with the log salt and the owning transaction.
pub fn frame_crc32(salt: u64, txn: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&salt.to_be_bytes());
    hasher.update(&txn.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
