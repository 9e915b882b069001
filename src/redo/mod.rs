#![forbid(unsafe_code)]
//! Append-only redo log holding one checksummed frame per committed
//! transaction.
//!
//! A frame payload is the concatenation of the transaction's redo records
//! (see [`record`]). Frames are written before the transaction's writes are
//! applied to the maps, so replaying the log after a crash restores every
//! committed write.

pub mod record;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::{EngineConfig, RedoSync};
use crate::primitives::io::{FileIo, MemIo, StdFileIo};
use crate::types::checksum::{crc32_of, frame_crc32};
use crate::types::{Lsn, Result, TidemarkError, TxnId};

pub use record::{encode_record, split_records, RedoEntry};

const REDO_MAGIC: [u8; 4] = *b"TMRL";
const REDO_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 32;

/// Options for opening a redo log.
#[derive(Clone, Debug)]
pub struct RedoOptions {
    /// Salt mixed into every payload checksum; must match on reopen.
    pub salt: u64,
    /// When appended frames are fsynced.
    pub sync: RedoSync,
    /// LSN assigned to the first frame of a fresh log.
    pub start_lsn: Lsn,
}

impl RedoOptions {
    /// Creates options with the given salt and sync mode, starting at LSN 1.
    pub fn new(salt: u64, sync: RedoSync) -> Self {
        Self {
            salt,
            sync,
            start_lsn: Lsn(1),
        }
    }
}

impl Default for RedoOptions {
    fn default() -> Self {
        Self::new(0, RedoSync::Always)
    }
}

impl From<&EngineConfig> for RedoOptions {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.redo_salt, config.redo_sync)
    }
}

/// Counters for redo log activity since open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedoStats {
    /// Frames appended.
    pub frames_appended: u64,
    /// Bytes appended, frame headers included.
    pub bytes_appended: u64,
    /// fsync calls issued.
    pub syncs: u64,
    /// Bytes of torn tail discarded when the log was opened.
    pub truncated_bytes: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&REDO_MAGIC);
        buf[4..6].copy_from_slice(&REDO_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        buf[16..24].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != REDO_MAGIC {
            return Err(TidemarkError::Corruption("redo magic mismatch"));
        }
        if read_u16(src, 4) != REDO_FORMAT_VERSION {
            return Err(TidemarkError::Corruption("redo format version mismatch"));
        }
        if src[6..8] != [0, 0] || src[24..28] != [0, 0, 0, 0] {
            return Err(TidemarkError::Corruption("redo reserved header bytes non-zero"));
        }
        if read_u32(src, 28) != crc32_of(&[&src[..28]]) {
            return Err(TidemarkError::Corruption("redo header crc mismatch"));
        }
        Ok(Self {
            salt: read_u64(src, 8),
            start_lsn: Lsn(read_u64(src, 16)),
        })
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    txn: TxnId,
    payload_len: u32,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.txn.0.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[20..24].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = crc32_of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// `None` when the header checksum does not match.
    fn decode(src: &[u8; FRAME_HEADER_LEN]) -> Option<Self> {
        if read_u32(src, 28) != crc32_of(&[&src[..28]]) {
            return None;
        }
        Some(Self {
            lsn: Lsn(read_u64(src, 0)),
            txn: TxnId(read_u64(src, 8)),
            payload_len: read_u32(src, 16),
            payload_crc32: read_u32(src, 20),
        })
    }
}

fn read_u16(src: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([src[at], src[at + 1]])
}

fn read_u32(src: &[u8], at: usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(arr)
}

fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(arr)
}

struct RedoState {
    header: FileHeader,
    append_offset: u64,
    next_lsn: Lsn,
    appends_since_sync: u64,
    // Set when a failed append could not be truncated away.
    poisoned: bool,
    stats: RedoStats,
}

/// Redo log over a [`FileIo`].
pub struct RedoLog {
    io: Arc<dyn FileIo>,
    sync: RedoSync,
    state: Mutex<RedoState>,
}

impl fmt::Debug for RedoLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RedoLog")
            .field("sync", &self.sync)
            .field("append_offset", &state.append_offset)
            .field("next_lsn", &state.next_lsn)
            .finish()
    }
}

impl RedoLog {
    /// Opens or creates a redo log.
    ///
    /// An existing log must carry the same salt. Frames past the last valid
    /// one are treated as a torn tail and truncated away.
    pub fn open(io: Arc<dyn FileIo>, options: RedoOptions) -> Result<Self> {
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                salt: options.salt,
                start_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.salt != options.salt {
                return Err(TidemarkError::Corruption("redo salt mismatch"));
            }
            header
        };

        let mut iter = RedoIterator::new(Arc::clone(&io), header.clone(), io.len()?);
        let mut next_lsn = header.start_lsn;
        while let Some(frame) = iter.next_frame()? {
            next_lsn = Lsn(frame.lsn.0 + 1);
        }
        let valid_up_to = iter.valid_up_to();
        let file_len = io.len()?;
        let truncated_bytes = file_len.saturating_sub(valid_up_to);
        if truncated_bytes > 0 {
            error!(
                valid_up_to,
                truncated_bytes, "redo.open: discarding torn tail"
            );
            io.truncate(valid_up_to)?;
        }
        debug!(next_lsn = next_lsn.0, append_offset = valid_up_to, "redo.open");
        Ok(Self {
            io,
            sync: options.sync,
            state: Mutex::new(RedoState {
                header,
                append_offset: valid_up_to,
                next_lsn,
                appends_since_sync: 0,
                poisoned: false,
                stats: RedoStats {
                    truncated_bytes,
                    ..RedoStats::default()
                },
            }),
        })
    }

    /// Opens or creates a redo log file at `path`.
    pub fn open_path(path: impl AsRef<Path>, options: RedoOptions) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        Self::open(Arc::new(io), options)
    }

    /// Creates a log backed by memory.
    pub fn in_memory(options: RedoOptions) -> Result<Self> {
        Self::open(Arc::new(MemIo::new()), options)
    }

    /// Appends one frame for `txn` and returns its LSN.
    ///
    /// With [`RedoSync::Always`] the frame is durable when this returns. If
    /// the write or its fsync fails, the frame is truncated away and the LSN
    /// is not consumed. When that truncate fails too, the log is poisoned and
    /// rejects every later append.
    pub fn append(&self, txn: TxnId, payload: &[u8]) -> Result<Lsn> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| TidemarkError::Invalid("redo frame payload exceeds u32 length"))?;
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(TidemarkError::RedoPoisoned);
        }
        let lsn = state.next_lsn;
        let header = FrameHeader {
            lsn,
            txn,
            payload_len,
            payload_crc32: frame_crc32(state.header.salt, txn.0, payload),
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        let offset = state.append_offset;
        let synced = matches!(self.sync, RedoSync::Always);
        let written = self.io.write_at(offset, &frame).and_then(|()| {
            if synced {
                self.io.sync_all()
            } else {
                Ok(())
            }
        });
        if let Err(err) = written {
            self.discard_from(&mut state, offset);
            return Err(err);
        }
        state.append_offset = offset + frame.len() as u64;
        state.next_lsn = Lsn(lsn.0 + 1);
        state.stats.frames_appended += 1;
        state.stats.bytes_appended += frame.len() as u64;
        state.appends_since_sync += 1;
        if synced {
            state.stats.syncs += 1;
            state.appends_since_sync = 0;
        }
        Ok(lsn)
    }

    fn discard_from(&self, state: &mut RedoState, offset: u64) {
        match self.io.truncate(offset) {
            Ok(()) => warn!(offset, lsn = state.next_lsn.0, "redo.append: frame discarded"),
            Err(err) => {
                state.poisoned = true;
                error!(
                    offset,
                    error = %err,
                    "redo.append: failed frame could not be discarded, log poisoned"
                );
            }
        }
    }

    /// True once a failed append left bytes that could not be discarded.
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    /// Forces appended frames to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.io.sync_all()?;
        state.stats.syncs += 1;
        state.appends_since_sync = 0;
        Ok(())
    }

    /// Drops every frame, restarting at `start_lsn`.
    pub fn reset(&self, start_lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state.header.start_lsn = start_lsn;
        self.io.write_at(0, &state.header.encode())?;
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.next_lsn = start_lsn;
        state.appends_since_sync = 0;
        state.poisoned = false;
        Ok(())
    }

    /// Creates an iterator over the frames currently in the log.
    pub fn iter(&self) -> Result<RedoIterator> {
        let state = self.state.lock();
        Ok(RedoIterator::new(
            Arc::clone(&self.io),
            state.header.clone(),
            state.append_offset,
        ))
    }

    /// LSN the next appended frame will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Frames appended since the last sync.
    pub fn unsynced_frames(&self) -> u64 {
        self.state.lock().appends_since_sync
    }

    /// Returns current statistics.
    pub fn stats(&self) -> RedoStats {
        self.state.lock().stats.clone()
    }

    /// Returns the log file size in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// True if the log contains no frames.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

/// One frame read back from the log.
#[derive(Clone, PartialEq, Eq)]
pub struct RedoFrame {
    /// Frame LSN.
    pub lsn: Lsn,
    /// Transaction that produced the frame.
    pub txn: TxnId,
    /// Concatenated redo records.
    pub payload: Vec<u8>,
}

impl fmt::Debug for RedoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedoFrame")
            .field("lsn", &self.lsn)
            .field("txn", &self.txn)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl RedoFrame {
    /// Splits the payload into records.
    pub fn records(&self) -> Result<Vec<RedoEntry<'_>>> {
        split_records(&self.payload)
    }
}

/// Iterator over redo frames.
///
/// Stops at the end of the log or at the first frame that is torn or fails
/// its checksums.
pub struct RedoIterator {
    io: Arc<dyn FileIo>,
    header: FileHeader,
    offset: u64,
    end: u64,
    expected_lsn: Option<Lsn>,
    valid_up_to: u64,
}

impl RedoIterator {
    fn new(io: Arc<dyn FileIo>, header: FileHeader, end: u64) -> Self {
        Self {
            io,
            header,
            offset: FILE_HEADER_LEN as u64,
            end,
            expected_lsn: None,
            valid_up_to: FILE_HEADER_LEN as u64,
        }
    }

    fn stop(&mut self) -> Result<Option<RedoFrame>> {
        self.offset = self.end;
        Ok(None)
    }

    /// Reads the next valid frame.
    pub fn next_frame(&mut self) -> Result<Option<RedoFrame>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            return self.stop();
        }
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        self.io.read_at(self.offset, &mut header_buf)?;
        let Some(header) = FrameHeader::decode(&header_buf) else {
            return self.stop();
        };
        if header.lsn.0 < self.header.start_lsn.0 {
            return self.stop();
        }
        if let Some(expected) = self.expected_lsn {
            if header.lsn != expected {
                return self.stop();
            }
        }
        let payload_off = self.offset + FRAME_HEADER_LEN as u64;
        if payload_off + u64::from(header.payload_len) > self.end {
            return self.stop();
        }
        let mut payload = vec![0u8; header.payload_len as usize];
        self.io.read_at(payload_off, &mut payload)?;
        if frame_crc32(self.header.salt, header.txn.0, &payload) != header.payload_crc32 {
            return self.stop();
        }
        self.offset = payload_off + u64::from(header.payload_len);
        self.valid_up_to = self.offset;
        self.expected_lsn = Some(Lsn(header.lsn.0 + 1));
        Ok(Some(RedoFrame {
            lsn: header.lsn,
            txn: header.txn,
            payload,
        }))
    }

    /// File offset up to which frames have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }
}

impl Iterator for RedoIterator {
    type Item = Result<RedoFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}
