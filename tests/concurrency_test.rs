// Concurrent transactions: lock waits, interruption at close, deadlocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::time::{Duration, Instant};

use tupelo::{Config, Database, DbError};

fn mem_db() -> Database {
    let config = Config::new()
        .page_size(1024)
        .max_cache_size(256 * 1024)
        .min_cache_size(8 * 1024)
        .checkpoint_rate(None);
    Database::open(config).unwrap()
}

#[test]
fn test_lock_wait_interrupted_by_close() {
    let db = mem_db();
    let index = db.open_index(b"test").unwrap();

    // A holds the exclusive lock on the key.
    let mut a = db.begin_transaction().unwrap();
    index.store(Some(&mut a), b"key", Some(b"a")).unwrap();

    std::thread::scope(|scope| {
        let index = &index;
        let db = &db;
        let handle = scope.spawn(move || {
            let mut b = db.begin_transaction().unwrap();
            b.set_lock_timeout(Some(Duration::from_secs(10)));
            let started = Instant::now();
            let result = index.load(Some(&mut b), b"key");
            (result, started.elapsed())
        });

        std::thread::sleep(Duration::from_secs(1));
        db.close().unwrap();

        let (result, waited) = handle.join().unwrap();
        assert!(matches!(result, Err(DbError::LockInterrupted)));
        assert!(waited < Duration::from_secs(9), "close did not interrupt");
    });
    drop(a);
}

#[test]
fn test_deadlock_detected_and_other_proceeds() {
    let db = mem_db();
    let index = db.open_index(b"test").unwrap();
    index.store(None, b"x", Some(b"0")).unwrap();
    index.store(None, b"y", Some(b"0")).unwrap();

    let barrier = Barrier::new(2);
    let deadlocks = AtomicUsize::new(0);
    let commits = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for (first, second) in [(&b"x"[..], &b"y"[..]), (&b"y"[..], &b"x"[..])] {
            let db = &db;
            let index = &index;
            let barrier = &barrier;
            let deadlocks = &deadlocks;
            let commits = &commits;
            scope.spawn(move || {
                let mut txn = db.begin_transaction().unwrap();
                txn.set_lock_timeout(Some(Duration::from_secs(10)));
                index.store(Some(&mut txn), first, Some(b"1")).unwrap();
                barrier.wait();
                match index.store(Some(&mut txn), second, Some(b"1")) {
                    Ok(()) => {
                        txn.commit().unwrap();
                        commits.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(DbError::Deadlock) => {
                        deadlocks.fetch_add(1, Ordering::SeqCst);
                        txn.rollback().unwrap();
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            });
        }
    });

    // Exactly one of the two is the victim; the other completes.
    assert_eq!(deadlocks.load(Ordering::SeqCst), 1);
    assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_writers_on_distinct_keys_all_land() {
    let db = mem_db();
    let index = db.open_index(b"parallel").unwrap();
    let threads = 8;
    let per_thread = 250;

    std::thread::scope(|scope| {
        for t in 0..threads {
            let index = &index;
            scope.spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{t:02}-k{i:05}");
                    let value = format!("{t}:{i}");
                    index
                        .store(None, key.as_bytes(), Some(value.as_bytes()))
                        .unwrap();
                }
            });
        }
    });

    for t in 0..threads {
        for i in (0..per_thread).step_by(17) {
            let key = format!("t{t:02}-k{i:05}");
            assert_eq!(
                index.load(None, key.as_bytes()).unwrap(),
                Some(format!("{t}:{i}").into_bytes()),
                "missing {key}"
            );
        }
    }

    let mut cursor = index.cursor();
    let mut count = 0;
    let mut more = cursor.first().unwrap();
    while more {
        count += 1;
        more = cursor.next().unwrap();
    }
    assert_eq!(count, threads * per_thread);
}

#[test]
fn test_readers_see_only_committed_values() {
    let db = mem_db();
    let index = db.open_index(b"visibility").unwrap();
    index.store(None, b"key", Some(b"committed")).unwrap();

    let mut writer = db.begin_transaction().unwrap();
    index.store(Some(&mut writer), b"key", Some(b"dirty")).unwrap();

    std::thread::scope(|scope| {
        let db = &db;
        let index = &index;
        let handle = scope.spawn(move || {
            // The reader blocks on the record lock until the writer rolls
            // back, then observes the committed value.
            let mut reader = db.begin_transaction().unwrap();
            reader.set_lock_timeout(Some(Duration::from_secs(10)));
            index.load(Some(&mut reader), b"key").unwrap()
        });
        std::thread::sleep(Duration::from_millis(100));
        writer.exit().unwrap();
        assert_eq!(handle.join().unwrap(), Some(b"committed".to_vec()));
    });
}

#[test]
fn test_checkpoint_during_concurrent_writes() {
    let db = mem_db();
    let index = db.open_index(b"churn").unwrap();

    std::thread::scope(|scope| {
        let db = &db;
        let index = &index;
        let writer = scope.spawn(move || {
            for i in 0..2000u32 {
                let key = format!("k{i:06}");
                index.store(None, key.as_bytes(), Some(b"v")).unwrap();
            }
        });
        let checkpointer = scope.spawn(move || {
            for _ in 0..10 {
                db.checkpoint().unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        writer.join().unwrap();
        checkpointer.join().unwrap();
    });

    for i in (0..2000u32).step_by(113) {
        let key = format!("k{i:06}");
        assert_eq!(index.load(None, key.as_bytes()).unwrap(), Some(b"v".to_vec()));
    }
}
