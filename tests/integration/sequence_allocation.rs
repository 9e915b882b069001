use std::sync::Arc;

use tempfile::tempdir;
use tidemark::catalog::{CatalogSession, ObjectKind};
use tidemark::{
    CatalogObject, Result, Schema, SequenceDefinition, SequenceOptions, TidemarkError,
};

fn in_memory_schema() -> Result<Schema> {
    Schema::open(Arc::new(CatalogSession::in_memory()))
}

#[test]
fn ascending_defaults() -> Result<()> {
    let schema = in_memory_schema()?;
    let seq = schema.create_sequence("orders", SequenceOptions::new())?;
    assert_eq!(seq.next()?, 1);
    assert_eq!(seq.next()?, 2);
    assert_eq!(seq.current_value(), 2);
    assert_eq!(seq.min_value(), 1);
    assert_eq!(seq.max_value(), i64::MAX);
    assert_eq!(seq.create_sql(), "CREATE SEQUENCE orders START WITH 3");
    Ok(())
}

#[test]
fn descending_defaults() -> Result<()> {
    let schema = in_memory_schema()?;
    let seq = schema.create_sequence("countdown", SequenceOptions::new().increment(-2))?;
    assert_eq!(seq.next()?, -1);
    assert_eq!(seq.next()?, -3);
    assert_eq!(seq.max_value(), -1);
    assert_eq!(seq.min_value(), i64::MIN);
    Ok(())
}

#[test]
fn margin_is_reserved_once_per_cache_block() -> Result<()> {
    let schema = in_memory_schema()?;
    let seq = schema.create_sequence(
        "blocks",
        SequenceOptions::new().start(10).increment(5).cache_size(4),
    )?;
    let writes_before = schema.catalog().stats().commits;
    assert_eq!(seq.next()?, 10);
    assert_eq!(seq.value_with_margin(), 30);
    assert_eq!(seq.last_flushed_margin(), Some(30));
    for expected in [15, 20, 25] {
        assert_eq!(seq.next()?, expected);
    }
    assert_eq!(schema.catalog().stats().commits, writes_before + 1);

    assert_eq!(seq.next()?, 30);
    assert_eq!(seq.value_with_margin(), 50);
    assert_eq!(schema.catalog().stats().commits, writes_before + 2);

    let entry = schema
        .catalog()
        .entry(ObjectKind::Sequence, "blocks")
        .expect("persisted");
    let CatalogObject::Sequence(def) = entry.object else {
        panic!("expected a sequence entry");
    };
    assert_eq!(def.start, 50);
    Ok(())
}

#[test]
fn bounded_sequence_exhausts_without_moving() -> Result<()> {
    let schema = in_memory_schema()?;
    let seq = schema.create_sequence(
        "tiny",
        SequenceOptions::new().min_value(1).max_value(3),
    )?;
    assert_eq!(
        [seq.next()?, seq.next()?, seq.next()?],
        [1, 2, 3]
    );
    for _ in 0..2 {
        assert!(matches!(
            seq.next(),
            Err(TidemarkError::SequenceExhausted { ref name }) if name == "tiny"
        ));
    }
    assert_eq!(seq.current_value(), 3);
    Ok(())
}

#[test]
fn cycling_sequence_wraps_to_its_bound() -> Result<()> {
    let schema = in_memory_schema()?;
    let up = schema.create_sequence(
        "ring",
        SequenceOptions::new().min_value(1).max_value(3).cycle(true),
    )?;
    let values: Vec<i64> = (0..7).map(|_| up.next()).collect::<Result<_>>()?;
    assert_eq!(values, vec![1, 2, 3, 1, 2, 3, 1]);

    let down = schema.create_sequence(
        "down_ring",
        SequenceOptions::new()
            .increment(-1)
            .min_value(-2)
            .max_value(0)
            .start(0)
            .cycle(true),
    )?;
    let values: Vec<i64> = (0..4).map(|_| down.next()).collect::<Result<_>>()?;
    assert_eq!(values, vec![0, -1, -2, 0]);
    Ok(())
}

#[test]
fn invalid_attribute_combinations_are_rejected() -> Result<()> {
    let schema = in_memory_schema()?;
    let cases = [
        SequenceOptions::new().increment(0),
        SequenceOptions::new().min_value(10).max_value(5),
        SequenceOptions::new().start(0).min_value(1).max_value(10),
        SequenceOptions::new().min_value(1).max_value(10).increment(20),
    ];
    for (i, options) in cases.into_iter().enumerate() {
        let name = format!("bad_{i}");
        assert!(matches!(
            schema.create_sequence(&name, options),
            Err(TidemarkError::SequenceAttributesInvalid { .. })
        ));
        assert!(schema.sequence(&name).is_none());
    }
    Ok(())
}

#[test]
fn modify_restarts_and_validates_as_a_whole() -> Result<()> {
    let schema = in_memory_schema()?;
    let seq = schema.create_sequence("m", SequenceOptions::new().cache_size(8))?;
    seq.next()?;
    seq.next()?;

    seq.modify(Some(100), None, None, Some(10))?;
    assert_eq!(seq.next()?, 100);
    assert_eq!(seq.next()?, 110);

    let err = seq.modify(None, Some(500), Some(400), None);
    assert!(matches!(err, Err(TidemarkError::SequenceAttributesInvalid { .. })));
    assert_eq!(seq.next()?, 120);
    assert_eq!(seq.increment(), 10);

    // Restarting below the previous reservation must still be persisted.
    seq.modify(Some(1), None, None, Some(1))?;
    assert_eq!(seq.last_flushed_margin(), Some(1));
    assert_eq!(seq.next()?, 1);
    Ok(())
}

#[test]
fn temporary_sequences_stay_out_of_the_catalog() -> Result<()> {
    let schema = in_memory_schema()?;
    let seq = schema.create_sequence("scratch", SequenceOptions::new().temporary(true))?;
    assert!(seq.is_temporary());
    assert_eq!(seq.next()?, 1);
    assert!(schema
        .catalog()
        .entry(ObjectKind::Sequence, "scratch")
        .is_none());
    schema.drop_sequence("scratch")?;
    assert!(schema.sequence("scratch").is_none());
    Ok(())
}

#[test]
fn crash_resumes_past_the_reserved_margin() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    {
        let catalog = Arc::new(CatalogSession::open_file(&path)?);
        let schema = Schema::open(catalog)?;
        let seq = schema.create_sequence("ids", SequenceOptions::new().cache_size(10))?;
        for expected in 1..=5 {
            assert_eq!(seq.next()?, expected);
        }
        // Dropped without close: the reservation up to 11 is lost.
    }
    let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
    let seq = schema.sequence("ids").expect("restored");
    assert_eq!(seq.next()?, 11);
    Ok(())
}

#[test]
fn clean_close_keeps_the_cursor() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    {
        let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
        let seq = schema.create_sequence("ids", SequenceOptions::new().cache_size(10))?;
        for _ in 0..5 {
            seq.next()?;
        }
        schema.close()?;
    }
    let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
    assert_eq!(schema.sequence("ids").expect("restored").next()?, 6);
    Ok(())
}

#[test]
fn reserved_margin_past_the_bound_exhausts_after_reopen() -> Result<()> {
    let catalog = Arc::new(CatalogSession::in_memory());
    {
        let schema = Schema::open(Arc::clone(&catalog))?;
        let seq = schema.create_sequence(
            "small",
            SequenceOptions::new().min_value(1).max_value(5).cache_size(32),
        )?;
        assert_eq!(seq.next()?, 1);
    }
    let schema = Schema::open(catalog)?;
    let seq = schema.sequence("small").expect("restored");
    assert!(matches!(
        seq.next(),
        Err(TidemarkError::SequenceExhausted { .. })
    ));
    Ok(())
}

fn persisted_sequence(catalog: &CatalogSession, name: &str) -> Option<SequenceDefinition> {
    match catalog.entry(ObjectKind::Sequence, name)?.object {
        CatalogObject::Sequence(def) => Some(def),
        _ => None,
    }
}

#[test]
fn margin_past_i64_max_stays_exhausted_after_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    {
        let catalog = Arc::new(CatalogSession::open_file(&path)?);
        let schema = Schema::open(Arc::clone(&catalog))?;
        let seq = schema.create_sequence("edge", SequenceOptions::new().start(i64::MAX - 2))?;
        let values = (0..3).map(|_| seq.next()).collect::<Result<Vec<_>>>()?;
        assert_eq!(values, vec![i64::MAX - 2, i64::MAX - 1, i64::MAX]);
        let def = persisted_sequence(&catalog, "edge").expect("sequence recorded");
        assert_eq!(def.start, i64::MAX);
        assert!(def.exhausted);
    }

    let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
    let seq = schema.sequence("edge").expect("restored");
    assert!(matches!(
        seq.next(),
        Err(TidemarkError::SequenceExhausted { .. })
    ));
    Ok(())
}

#[test]
fn exhausted_cursor_survives_clean_close() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    {
        let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
        let seq = schema.create_sequence("edge", SequenceOptions::new().start(i64::MAX - 1))?;
        assert_eq!(seq.next()?, i64::MAX - 1);
        assert_eq!(seq.next()?, i64::MAX);
        assert!(seq.next().is_err());
        schema.close()?;
    }

    let catalog = Arc::new(CatalogSession::open_file(&path)?);
    let def = persisted_sequence(&catalog, "edge").expect("sequence recorded");
    assert!(def.exhausted);
    let schema = Schema::open(catalog)?;
    let seq = schema.sequence("edge").expect("restored");
    assert!(matches!(
        seq.next(),
        Err(TidemarkError::SequenceExhausted { .. })
    ));
    assert!(matches!(
        seq.modify(None, None, None, None),
        Err(TidemarkError::SequenceAttributesInvalid { .. })
    ));
    seq.modify(Some(1), None, None, None)?;
    assert_eq!(seq.next()?, 1);
    Ok(())
}

#[test]
fn descending_cycle_past_i64_min_wraps_after_crash() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    {
        let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
        let seq = schema.create_sequence(
            "down",
            SequenceOptions::new()
                .increment(-1)
                .start(i64::MIN + 1)
                .cycle(true),
        )?;
        assert_eq!(seq.next()?, i64::MIN + 1);
    }

    let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
    let seq = schema.sequence("down").expect("restored");
    assert_eq!(seq.next()?, -1);
    Ok(())
}
