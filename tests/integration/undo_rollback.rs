use std::sync::atomic::Ordering;
use std::sync::Arc;

use tidemark::storage::{Int64Codec, TextCodec};
use tidemark::txn::{CounterMetrics, RecordState, UndoKind};
use tidemark::{
    EngineOptions, Result, StorageMap, TidemarkError, TransactionEngine, Value,
};

fn engine_with_metrics() -> Result<(Arc<TransactionEngine>, Arc<CounterMetrics>)> {
    let metrics = Arc::new(CounterMetrics::default());
    let engine = TransactionEngine::open(EngineOptions::in_memory().metrics(metrics.clone()))?;
    engine.create_map("accounts", Arc::new(Int64Codec), Arc::new(TextCodec))?;
    engine.create_map("audit", Arc::new(Int64Codec), Arc::new(TextCodec))?;
    Ok((engine, metrics))
}

fn seed(engine: &Arc<TransactionEngine>, rows: &[(i64, &str)]) -> Result<()> {
    let mut txn = engine.begin();
    for (k, v) in rows {
        txn.put("accounts", Value::Int(*k), Value::from(*v))?;
    }
    txn.commit()
}

fn committed(engine: &TransactionEngine, map: &str, key: i64) -> Option<Value> {
    engine
        .get_storage_map(map)
        .and_then(|m| m.get(&Value::Int(key)))
        .and_then(|v| v.last_committed().cloned())
}

#[test]
fn rollback_restores_every_map() -> Result<()> {
    let (engine, metrics) = engine_with_metrics()?;
    seed(&engine, &[(1, "alice"), (2, "bob")])?;

    let mut txn = engine.begin();
    txn.put("accounts", Value::Int(1), Value::from("alice-2"))?;
    txn.delete("accounts", &Value::Int(2))?;
    txn.put("accounts", Value::Int(3), Value::from("carol"))?;
    txn.put("audit", Value::Int(1), Value::from("touched"))?;
    assert_eq!(txn.undo_log().len(), 4);
    txn.rollback()?;

    assert_eq!(committed(&engine, "accounts", 1), Some(Value::from("alice")));
    assert_eq!(committed(&engine, "accounts", 2), Some(Value::from("bob")));
    assert!(engine
        .get_storage_map("accounts")
        .and_then(|m| m.get(&Value::Int(3)))
        .is_none());
    assert!(engine
        .get_storage_map("audit")
        .and_then(|m| m.get(&Value::Int(1)))
        .is_none());
    assert_eq!(engine.get_storage_map("accounts").map(|m| m.size()), Some(2));
    assert_eq!(metrics.rollbacks.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.records_reverted.load(Ordering::Relaxed), 4);
    assert_eq!(engine.active_transactions(), 0);
    Ok(())
}

#[test]
fn repeated_writes_to_one_key_unwind_to_the_original() -> Result<()> {
    let (engine, _) = engine_with_metrics()?;
    seed(&engine, &[(7, "v0")])?;

    let mut txn = engine.begin();
    txn.put("accounts", Value::Int(7), Value::from("v1"))?;
    txn.put("accounts", Value::Int(7), Value::from("v2"))?;
    txn.delete("accounts", &Value::Int(7))?;
    txn.put("accounts", Value::Int(7), Value::from("v3"))?;
    assert_eq!(txn.get("accounts", &Value::Int(7))?, Some(Value::from("v3")));
    txn.rollback()?;

    let version = engine
        .get_storage_map("accounts")
        .and_then(|m| m.get(&Value::Int(7)))
        .expect("row survives rollback");
    assert!(version.is_committed());
    assert_eq!(version.value(), Some(&Value::from("v0")));
    Ok(())
}

#[test]
fn savepoint_reverts_only_later_writes() -> Result<()> {
    let (engine, _) = engine_with_metrics()?;
    let mut txn = engine.begin();
    txn.put("accounts", Value::Int(1), Value::from("kept"))?;
    let sp = txn.savepoint();
    txn.put("accounts", Value::Int(1), Value::from("discarded"))?;
    txn.put("accounts", Value::Int(2), Value::from("discarded"))?;
    txn.rollback_to(sp)?;

    assert_eq!(txn.undo_log().len(), 1);
    assert_eq!(txn.get("accounts", &Value::Int(1))?, Some(Value::from("kept")));
    assert_eq!(txn.get("accounts", &Value::Int(2))?, None);
    txn.commit()?;

    assert_eq!(committed(&engine, "accounts", 1), Some(Value::from("kept")));
    assert_eq!(committed(&engine, "accounts", 2), None);
    Ok(())
}

#[test]
fn undo_records_classify_writes() -> Result<()> {
    let (engine, _) = engine_with_metrics()?;
    seed(&engine, &[(1, "one"), (2, "two")])?;

    let mut txn = engine.begin();
    txn.put("accounts", Value::Int(1), Value::from("uno"))?;
    txn.delete("accounts", &Value::Int(2))?;
    txn.put("accounts", Value::Int(3), Value::from("tres"))?;
    assert!(!txn.delete("accounts", &Value::Int(99))?);

    let kinds: Vec<&UndoKind> = txn.undo_log().iter().map(|r| r.kind()).collect();
    assert!(matches!(kinds[0], UndoKind::Update { .. }));
    assert!(matches!(kinds[1], UndoKind::Delete { .. }));
    assert!(matches!(kinds[2], UndoKind::Insert));
    assert_eq!(kinds.len(), 3);
    assert!(txn
        .undo_log()
        .iter()
        .all(|r| r.state() == RecordState::Pending));
    txn.commit()?;
    Ok(())
}

#[test]
fn dropped_map_is_skipped_on_rollback() -> Result<()> {
    let (engine, metrics) = engine_with_metrics()?;
    let mut txn = engine.begin();
    txn.put("accounts", Value::Int(1), Value::from("a"))?;
    txn.put("audit", Value::Int(1), Value::from("b"))?;
    assert!(engine.drop_map("audit")?);
    txn.rollback()?;

    assert!(engine
        .get_storage_map("accounts")
        .and_then(|m| m.get(&Value::Int(1)))
        .is_none());
    assert_eq!(metrics.records_skipped.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.records_reverted.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn dropping_an_active_transaction_rolls_back() -> Result<()> {
    let (engine, metrics) = engine_with_metrics()?;
    {
        let mut txn = engine.begin();
        txn.put("accounts", Value::Int(5), Value::from("ghost"))?;
        assert_eq!(engine.active_transactions(), 1);
    }
    assert_eq!(engine.active_transactions(), 0);
    assert!(engine
        .get_storage_map("accounts")
        .and_then(|m| m.get(&Value::Int(5)))
        .is_none());
    assert_eq!(metrics.rollbacks.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn conflicting_writer_is_refused_until_owner_finishes() -> Result<()> {
    let (engine, _) = engine_with_metrics()?;
    seed(&engine, &[(1, "base")])?;

    let mut first = engine.begin();
    first.put("accounts", Value::Int(1), Value::from("first"))?;
    let mut second = engine.begin();
    let err = second
        .put("accounts", Value::Int(1), Value::from("second"))
        .unwrap_err();
    assert!(matches!(err, TidemarkError::WriteConflict { owner, .. } if owner == first.id()));
    assert_eq!(second.get("accounts", &Value::Int(1))?, Some(Value::from("base")));

    first.rollback()?;
    second.put("accounts", Value::Int(1), Value::from("second"))?;
    second.commit()?;
    assert_eq!(committed(&engine, "accounts", 1), Some(Value::from("second")));
    Ok(())
}
