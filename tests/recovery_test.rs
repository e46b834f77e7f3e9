// Crash recovery: checkpoints, redo replay, undo rollback, tombstones.

use std::collections::BTreeMap;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tupelo::{Config, Database, DurabilityMode};

fn config_for(dir: &TempDir) -> Config {
    Config::new()
        .base_file(dir.path().join("test.db"))
        .page_size(1024)
        .max_cache_size(256 * 1024)
        .min_cache_size(8 * 1024)
        .checkpoint_rate(None)
        .durability_mode(DurabilityMode::Sync)
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.db")
}

fn random_pair(rng: &mut StdRng) -> (Vec<u8>, Vec<u8>) {
    let klen = rng.random_range(10..100);
    let vlen = rng.random_range(10..100);
    let key: Vec<u8> = (0..klen).map(|_| rng.random_range(b'a'..=b'z')).collect();
    let value: Vec<u8> = (0..vlen).map(|_| rng.random_range(b'a'..=b'z')).collect();
    (key, value)
}

fn count_entries(index: &std::sync::Arc<tupelo::Index>) -> usize {
    let mut cursor = index.cursor();
    let mut count = 0;
    let mut more = cursor.first().unwrap();
    while more {
        count += 1;
        more = cursor.next().unwrap();
    }
    count
}

#[test]
fn test_write_checkpoint_reopen_read() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let index = db.open_index(b"test").unwrap();
        let mut txn = db.begin_transaction().unwrap();
        index.store(Some(&mut txn), b"hello", Some(b"world")).unwrap();
        txn.commit().unwrap();
        db.checkpoint().unwrap();
        db.close().unwrap();
    }
    let db = Database::open(config_for(&dir)).unwrap();
    let index = db.open_index(b"test").unwrap();
    assert_eq!(index.load(None, b"hello").unwrap(), Some(b"world".to_vec()));
}

#[test]
fn test_committed_store_survives_crash_without_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let index = db.open_index(b"test").unwrap();
        index.store(None, b"durable", Some(b"yes")).unwrap();
        db.close_abruptly();
    }
    let db = Database::open(config_for(&dir)).unwrap();
    let index = db.open_index(b"test").unwrap();
    assert_eq!(index.load(None, b"durable").unwrap(), Some(b"yes".to_vec()));
}

#[test]
fn test_uncommitted_rollback_across_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let one = db.open_index(b"one").unwrap();
        let two = db.open_index(b"two").unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        let mut txn = db.begin_transaction().unwrap();
        for i in 0..10_000 {
            let (key, value) = random_pair(&mut rng);
            let index = if i % 2 == 0 { &one } else { &two };
            index.store(Some(&mut txn), &key, Some(&value)).unwrap();
            if i == 8_000 {
                // Checkpoint mid-transaction: uncommitted data reaches the
                // pages file together with the undo needed to take it back.
                db.checkpoint().unwrap();
            }
        }
        txn.exit().unwrap();
        db.close_abruptly();
    }

    let db = Database::open(config_for(&dir)).unwrap();
    let one = db.open_index(b"one").unwrap();
    let two = db.open_index(b"two").unwrap();
    assert_eq!(count_entries(&one), 0);
    assert_eq!(count_entries(&two), 0);
}

#[test]
fn test_committed_stores_survive_across_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut expected_one = BTreeMap::new();
    let mut expected_two = BTreeMap::new();
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let one = db.open_index(b"one").unwrap();
        let two = db.open_index(b"two").unwrap();
        let mut rng = StdRng::seed_from_u64(43);

        let mut txn = db.begin_transaction().unwrap();
        for i in 0..10_000 {
            let (key, value) = random_pair(&mut rng);
            if i % 2 == 0 {
                one.store(Some(&mut txn), &key, Some(&value)).unwrap();
                expected_one.insert(key, value);
            } else {
                two.store(Some(&mut txn), &key, Some(&value)).unwrap();
                expected_two.insert(key, value);
            }
            if i == 8_000 {
                db.checkpoint().unwrap();
            }
        }
        txn.commit().unwrap();
        db.close_abruptly();
    }

    let db = Database::open(config_for(&dir)).unwrap();
    let one = db.open_index(b"one").unwrap();
    let two = db.open_index(b"two").unwrap();
    assert_eq!(count_entries(&one), expected_one.len());
    assert_eq!(count_entries(&two), expected_two.len());
    for (key, value) in expected_one.iter().take(500) {
        assert_eq!(one.load(None, key).unwrap().as_deref(), Some(&value[..]));
    }
    for (key, value) in expected_two.iter().take(500) {
        assert_eq!(two.load(None, key).unwrap().as_deref(), Some(&value[..]));
    }
}

#[test]
fn test_tombstone_across_crash() {
    let dir = tempfile::tempdir().unwrap();

    // An uncommitted delete dies with the crash; the value survives.
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let index = db.open_index(b"test").unwrap();
        index.store(None, b"key", Some(b"value")).unwrap();
        db.checkpoint().unwrap();

        let mut txn = db.begin_transaction().unwrap();
        index.delete(Some(&mut txn), b"key").unwrap();
        txn.abandon();
        db.close_abruptly();
    }
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let index = db.open_index(b"test").unwrap();
        assert_eq!(index.load(None, b"key").unwrap(), Some(b"value".to_vec()));
        db.close().unwrap();
    }

    // A committed delete holds across the crash; the value is gone.
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let index = db.open_index(b"test").unwrap();
        let mut txn = db.begin_transaction().unwrap();
        index.delete(Some(&mut txn), b"key").unwrap();
        txn.commit().unwrap();
        db.close_abruptly();
    }
    let db = Database::open(config_for(&dir)).unwrap();
    let index = db.open_index(b"test").unwrap();
    assert_eq!(index.load(None, b"key").unwrap(), None);
}

#[test]
fn test_tombstone_survives_checkpoint_then_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let index = db.open_index(b"test").unwrap();
        index.store(None, b"key", Some(b"value")).unwrap();
        db.checkpoint().unwrap();

        // The ghost is flushed by a checkpoint while its transaction is
        // still pending; recovery must resurrect the value.
        let mut txn = db.begin_transaction().unwrap();
        index.delete(Some(&mut txn), b"key").unwrap();
        db.checkpoint().unwrap();
        txn.abandon();
        db.close_abruptly();
    }
    let db = Database::open(config_for(&dir)).unwrap();
    let index = db.open_index(b"test").unwrap();
    assert_eq!(index.load(None, b"key").unwrap(), Some(b"value".to_vec()));
}

#[test]
fn test_index_created_after_checkpoint_recovers() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config_for(&dir)).unwrap();
        db.open_index(b"early").unwrap();
        db.checkpoint().unwrap();

        let late = db.open_index(b"late").unwrap();
        late.store(None, b"k", Some(b"v")).unwrap();
        db.close_abruptly();
    }
    let db = Database::open(config_for(&dir)).unwrap();
    let late = db.find_index(b"late").unwrap().expect("index replayed");
    assert_eq!(late.load(None, b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_reopen_uses_lock_file() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(config_for(&dir)).unwrap();
    assert!(Database::open(config_for(&dir)).is_err());
    drop(db);
    assert!(db_path(&dir).exists());
    // Released on close; a reopen succeeds.
    let db = Database::open(config_for(&dir)).unwrap();
    db.close().unwrap();
}

#[test]
fn test_no_flush_commit_lost_in_crash_but_atomic() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(config_for(&dir)).unwrap();
        let index = db.open_index(b"test").unwrap();
        index.store(None, b"base", Some(b"durable")).unwrap();
        db.checkpoint().unwrap();

        let mut txn = db.begin_transaction().unwrap();
        txn.set_durability_mode(DurabilityMode::NoFlush);
        index.store(Some(&mut txn), b"lost", Some(b"maybe")).unwrap();
        txn.commit().unwrap();
        db.close_abruptly();
    }
    let db = Database::open(config_for(&dir)).unwrap();
    let index = db.open_index(b"test").unwrap();
    // NoFlush promises no durability for the lost key, but the rest of the
    // database is intact and the transaction left no partial state.
    assert_eq!(index.load(None, b"base").unwrap(), Some(b"durable".to_vec()));
    assert_eq!(index.load(None, b"lost").unwrap(), None);
}
