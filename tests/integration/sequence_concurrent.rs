use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::tempdir;
use tidemark::catalog::CatalogSession;
use tidemark::{Result, Schema, SequenceOptions};

const NUM_THREADS: usize = 8;
const VALUES_PER_THREAD: usize = 500;

#[test]
fn concurrent_next_hands_out_unique_values() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("catalog.json");
    let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
    let seq = schema.create_sequence("ids", SequenceOptions::new().cache_size(7))?;

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();
    for _ in 0..NUM_THREADS {
        let seq = Arc::clone(&seq);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<Vec<i64>> {
            barrier.wait();
            (0..VALUES_PER_THREAD).map(|_| seq.next()).collect()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for value in handle.join().expect("worker panicked")? {
            assert!(seen.insert(value), "value {value} handed out twice");
        }
    }
    let total = (NUM_THREADS * VALUES_PER_THREAD) as i64;
    assert_eq!(seen.len() as i64, total);
    assert_eq!(seen.iter().copied().max(), Some(total));
    assert_eq!(seq.current_value(), total);

    // The newest reservation always wins over older ones flushed late.
    assert_eq!(seq.last_flushed_margin(), Some(seq.value_with_margin()));
    assert!(seq.value_with_margin() > total);
    drop(seq);
    drop(schema);

    let schema = Schema::open(Arc::new(CatalogSession::open_file(&path)?))?;
    let reopened = schema.sequence("ids").expect("restored");
    assert!(reopened.next()? > total);
    Ok(())
}

#[test]
fn concurrent_descending_sequence_with_cycle_stays_in_bounds() -> Result<()> {
    let schema = Schema::open(Arc::new(CatalogSession::in_memory()))?;
    let seq = schema.create_sequence(
        "wheel",
        SequenceOptions::new()
            .increment(-1)
            .min_value(-50)
            .max_value(-1)
            .cycle(true)
            .cache_size(3),
    )?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let seq = Arc::clone(&seq);
            thread::spawn(move || -> Result<Vec<i64>> {
                (0..200).map(|_| seq.next()).collect()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("worker panicked")?);
    }
    assert_eq!(all.len(), 800);
    assert!(all.iter().all(|v| (-50..=-1).contains(v)));
    // 800 values over a 50-value ring: every slot is hit exactly 16 times.
    for slot in -50..=-1 {
        assert_eq!(all.iter().filter(|v| **v == slot).count(), 16);
    }
    Ok(())
}

#[test]
fn concurrent_schema_creation_assigns_distinct_ids() -> Result<()> {
    let schema = Arc::new(Schema::open(Arc::new(CatalogSession::in_memory()))?);
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let schema = Arc::clone(&schema);
            thread::spawn(move || -> Result<Vec<u32>> {
                (0..20)
                    .map(|i| {
                        schema
                            .create_sequence(&format!("s_{t}_{i}"), SequenceOptions::new())
                            .map(|seq| seq.id().0)
                    })
                    .collect()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        for id in handle.join().expect("worker panicked")? {
            assert!(ids.insert(id));
        }
    }
    assert_eq!(ids.len(), NUM_THREADS * 20);
    assert_eq!(schema.sequences().len(), NUM_THREADS * 20);
    Ok(())
}
