use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::tempdir;
use tidemark::catalog::CatalogSession;
use tidemark::primitives::io::{FileIo, StdFileIo};
use tidemark::storage::{Int64Codec, TaggedCodec, TextCodec, MAX_ROW_DEPTH};
use tidemark::{
    EngineOptions, Lsn, RedoLog, RedoOptions, RedoSync, Result, StorageMap, TidemarkError,
    TransactionEngine, Value,
};

const SALT: u64 = 0x5eed;

fn open_engine(dir: &Path) -> Result<Arc<TransactionEngine>> {
    let catalog = Arc::new(CatalogSession::open_file(dir.join("catalog.json"))?);
    let redo = RedoLog::open_path(
        dir.join("redo.log"),
        RedoOptions::new(SALT, RedoSync::Always),
    )?;
    TransactionEngine::open(EngineOptions::new(catalog).redo_log(redo))
}

fn read(engine: &TransactionEngine, map: &str, key: Value) -> Option<Value> {
    engine
        .get_storage_map(map)
        .and_then(|m| m.get(&key))
        .and_then(|v| v.into_value())
}

#[test]
fn committed_writes_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open_engine(dir.path())?;
        engine.create_map("users", Arc::new(Int64Codec), Arc::new(TextCodec))?;
        engine.create_map("blobs", Arc::new(TextCodec), Arc::new(TaggedCodec))?;

        let mut txn = engine.begin();
        txn.put("users", Value::Int(1), Value::from("ada"))?;
        txn.put("users", Value::Int(2), Value::from("grace"))?;
        txn.put("blobs", Value::from("cfg"), Value::Bytes(vec![1, 2, 3]))?;
        txn.commit()?;

        let mut txn = engine.begin();
        txn.delete("users", &Value::Int(2))?;
        txn.put("users", Value::Int(1), Value::from("ada lovelace"))?;
        txn.commit()?;

        let mut txn = engine.begin();
        txn.put("users", Value::Int(3), Value::from("never committed"))?;
        txn.rollback()?;

        let redo = engine.redo_log().expect("redo configured");
        assert_eq!(redo.next_lsn(), Lsn(3));
        assert!(engine.estimated_memory("users") > 0);
    }

    let engine = open_engine(dir.path())?;
    assert_eq!(engine.map_names(), vec!["blobs".to_owned(), "users".to_owned()]);
    let stats = engine.recover()?;
    assert_eq!(stats.frames, 2);
    assert_eq!(stats.applied, 5);
    assert_eq!(stats.skipped, 0);
    assert_eq!(stats.last_lsn, Some(Lsn(2)));

    assert_eq!(
        read(&engine, "users", Value::Int(1)),
        Some(Value::from("ada lovelace"))
    );
    assert_eq!(read(&engine, "users", Value::Int(2)), None);
    assert_eq!(read(&engine, "users", Value::Int(3)), None);
    assert_eq!(
        read(&engine, "blobs", Value::from("cfg")),
        Some(Value::Bytes(vec![1, 2, 3]))
    );
    Ok(())
}

#[test]
fn torn_tail_is_discarded_on_reopen() -> Result<()> {
    let dir = tempdir()?;
    let log_path = dir.path().join("redo.log");
    {
        let engine = open_engine(dir.path())?;
        engine.create_map("kv", Arc::new(Int64Codec), Arc::new(Int64Codec))?;
        for i in 0..3 {
            let mut txn = engine.begin();
            txn.put("kv", Value::Int(i), Value::Int(i * 10))?;
            txn.commit()?;
        }
    }
    let intact_len = std::fs::metadata(&log_path)?.len();
    {
        let mut file = OpenOptions::new().append(true).open(&log_path)?;
        file.write_all(&[0xAB; 45])?;
    }

    let engine = open_engine(dir.path())?;
    let redo = engine.redo_log().expect("redo configured");
    assert_eq!(redo.stats().truncated_bytes, 45);
    assert_eq!(std::fs::metadata(&log_path)?.len(), intact_len);
    assert_eq!(redo.next_lsn(), Lsn(4));

    let stats = engine.recover()?;
    assert_eq!(stats.frames, 3);
    assert_eq!(read(&engine, "kv", Value::Int(2)), Some(Value::Int(20)));

    let mut txn = engine.begin();
    txn.put("kv", Value::Int(9), Value::Int(90))?;
    txn.commit()?;
    assert_eq!(redo.next_lsn(), Lsn(5));
    Ok(())
}

#[test]
fn records_for_dropped_maps_are_skipped() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open_engine(dir.path())?;
        engine.create_map("keep", Arc::new(Int64Codec), Arc::new(TextCodec))?;
        engine.create_map("gone", Arc::new(Int64Codec), Arc::new(TextCodec))?;
        let mut txn = engine.begin();
        txn.put("keep", Value::Int(1), Value::from("a"))?;
        txn.put("gone", Value::Int(1), Value::from("b"))?;
        txn.commit()?;
        assert!(engine.drop_map("gone")?);
    }

    let engine = open_engine(dir.path())?;
    assert_eq!(engine.map_names(), vec!["keep".to_owned()]);
    let stats = engine.recover()?;
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(read(&engine, "keep", Value::Int(1)), Some(Value::from("a")));
    Ok(())
}

#[test]
fn mismatched_salt_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("redo.log");
    {
        let log = RedoLog::open_path(&path, RedoOptions::new(1, RedoSync::Never))?;
        log.append(tidemark::TxnId(1), b"payload")?;
    }
    assert!(RedoLog::open_path(&path, RedoOptions::new(2, RedoSync::Never)).is_err());
    Ok(())
}

struct SyncFailingIo {
    file: StdFileIo,
    fail_sync: AtomicBool,
}

impl FileIo for SyncFailingIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.file.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.file.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(io::Error::other("fsync failed").into());
        }
        self.file.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.file.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.truncate(len)
    }
}

#[test]
fn commit_with_failed_fsync_stays_rolled_back_after_recovery() -> Result<()> {
    let dir = tempdir()?;
    {
        let io = Arc::new(SyncFailingIo {
            file: StdFileIo::open(dir.path().join("redo.log"))?,
            fail_sync: AtomicBool::new(false),
        });
        let catalog = Arc::new(CatalogSession::open_file(dir.path().join("catalog.json"))?);
        let redo = RedoLog::open(io.clone(), RedoOptions::new(SALT, RedoSync::Always))?;
        let engine = TransactionEngine::open(EngineOptions::new(catalog).redo_log(redo))?;
        engine.create_map("notes", Arc::new(Int64Codec), Arc::new(TextCodec))?;

        let mut txn = engine.begin();
        txn.put("notes", Value::Int(1), Value::from("kept"))?;
        txn.commit()?;

        io.fail_sync.store(true, Ordering::SeqCst);
        let mut txn = engine.begin();
        txn.put("notes", Value::Int(2), Value::from("ghost"))?;
        assert!(matches!(txn.commit(), Err(TidemarkError::Io(_))));
        assert_eq!(read(&engine, "notes", Value::Int(2)), None);
    }

    let engine = open_engine(dir.path())?;
    let stats = engine.recover()?;
    assert_eq!(stats.frames, 1);
    assert_eq!(read(&engine, "notes", Value::Int(1)), Some(Value::from("kept")));
    assert_eq!(read(&engine, "notes", Value::Int(2)), None);
    Ok(())
}

fn nested_row(depth: usize) -> Value {
    (0..depth).fold(Value::from("leaf"), |inner, _| Value::Row(vec![inner]))
}

#[test]
fn unreadable_row_never_reaches_the_log() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open_engine(dir.path())?;
        engine.create_map("docs", Arc::new(Int64Codec), Arc::new(TaggedCodec))?;

        let mut txn = engine.begin();
        txn.put("docs", Value::Int(1), nested_row(MAX_ROW_DEPTH))?;
        txn.commit()?;

        let mut txn = engine.begin();
        txn.put("docs", Value::Int(2), nested_row(MAX_ROW_DEPTH + 6))?;
        assert!(matches!(txn.commit(), Err(TidemarkError::Invalid(_))));
        assert_eq!(read(&engine, "docs", Value::Int(2)), None);
        let redo = engine.redo_log().expect("redo configured");
        assert_eq!(redo.next_lsn(), Lsn(2));
    }

    let engine = open_engine(dir.path())?;
    let stats = engine.recover()?;
    assert_eq!(stats.frames, 1);
    assert_eq!(
        read(&engine, "docs", Value::Int(1)),
        Some(nested_row(MAX_ROW_DEPTH))
    );
    assert_eq!(read(&engine, "docs", Value::Int(2)), None);
    Ok(())
}
