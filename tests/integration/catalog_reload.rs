use std::sync::Arc;

use tempfile::tempdir;
use tidemark::catalog::{read_document, CatalogSession, ObjectKind};
use tidemark::storage::{Int64Codec, TextCodec};
use tidemark::{
    CatalogObject, EngineOptions, Result, Schema, SequenceOptions, TidemarkError,
    TransactionEngine,
};

#[test]
fn maps_and_sequences_share_one_document() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    let (first_map_id, seq_id) = {
        let catalog = Arc::new(CatalogSession::open_file(&path)?);
        let engine = TransactionEngine::open(EngineOptions::new(Arc::clone(&catalog)))?;
        let schema = Schema::open(Arc::clone(&catalog))?;
        engine.create_map("users", Arc::new(Int64Codec), Arc::new(TextCodec))?;
        engine.create_map("names", Arc::new(TextCodec), Arc::new(Int64Codec))?;
        let seq = schema.create_sequence(
            "user_ids",
            SequenceOptions::new().start(1000).increment(10),
        )?;
        assert_eq!(seq.next()?, 1000);
        schema.close()?;
        let users = catalog
            .entry(ObjectKind::Map, "users")
            .expect("map recorded");
        (users.id, seq.id())
    };

    let entries = read_document(&path)?;
    assert_eq!(entries.len(), 4);
    assert!(entries
        .iter()
        .any(|e| e.kind() == ObjectKind::Sequence && e.name == "__object_ids"));

    let catalog = Arc::new(CatalogSession::open_file(&path)?);
    let engine = TransactionEngine::open(EngineOptions::new(Arc::clone(&catalog)))?;
    assert_eq!(engine.map_names(), vec!["names".to_owned(), "users".to_owned()]);
    let users = engine.get_storage_map("users").expect("restored");
    assert_eq!(users.key_codec().name(), "int64");
    assert_eq!(users.value_codec().name(), "text");

    engine.create_map("events", Arc::new(Int64Codec), Arc::new(TextCodec))?;
    let events = catalog
        .entry(ObjectKind::Map, "events")
        .expect("map recorded");
    assert!(events.id > first_map_id);

    let schema = Schema::open(Arc::clone(&catalog))?;
    let seq = schema.sequence("user_ids").expect("restored");
    assert_eq!(seq.id(), seq_id);
    assert_eq!(seq.increment(), 10);
    assert_eq!(seq.next()?, 1010);
    let other = schema.create_sequence("other", SequenceOptions::new())?;
    assert!(other.id() > seq_id);
    Ok(())
}

#[test]
fn dropped_objects_disappear_from_the_document() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    {
        let catalog = Arc::new(CatalogSession::open_file(&path)?);
        let engine = TransactionEngine::open(EngineOptions::new(Arc::clone(&catalog)))?;
        let schema = Schema::open(Arc::clone(&catalog))?;
        engine.create_map("tmp", Arc::new(Int64Codec), Arc::new(Int64Codec))?;
        schema.create_sequence("tmp_seq", SequenceOptions::new())?;
        assert!(engine.drop_map("tmp")?);
        assert!(!engine.drop_map("tmp")?);
        schema.drop_sequence("tmp_seq")?;
    }
    let entries = read_document(&path)?;
    assert!(entries.iter().all(|e| e.name == "__object_ids"));
    Ok(())
}

#[test]
fn table_sequence_definition_round_trips_through_sql() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    {
        let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
        let seq = schema.create_table_sequence("orders_id_seq", 5, 5)?;
        assert_eq!(seq.drop_sql(), None);
        schema.close()?;
    }
    let def = read_document(&path)?
        .into_iter()
        .find_map(|e| match e.object {
            CatalogObject::Sequence(def) if def.name == "orders_id_seq" => Some(def),
            _ => None,
        })
        .expect("sequence recorded");
    assert!(def.belongs_to_table);
    assert_eq!(
        def.create_sql(),
        "CREATE SEQUENCE orders_id_seq START WITH 5 INCREMENT BY 5 BELONGS_TO_TABLE"
    );
    Ok(())
}

#[test]
fn unknown_codec_in_document_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    std::fs::write(
        &path,
        r#"{
  "version": 1,
  "entries": [
    {
      "id": 3,
      "name": "weird",
      "object": { "type": "map", "key_codec": "int64", "value_codec": "msgpack" }
    }
  ]
}"#,
    )?;
    let catalog = Arc::new(CatalogSession::open_file(&path)?);
    assert!(matches!(
        TransactionEngine::open(EngineOptions::new(catalog)),
        Err(TidemarkError::Catalog(_))
    ));
    Ok(())
}

#[test]
fn unsupported_document_version_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    std::fs::write(&path, r#"{ "version": 9, "entries": [] }"#)?;
    assert!(matches!(
        CatalogSession::open_file(&path),
        Err(TidemarkError::Catalog(_))
    ));
    Ok(())
}
