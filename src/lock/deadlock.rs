// Deadlock detection.
//
// Depth-first walk of the wait-for graph starting at the owner that is about
// to park: owner → lock it waits on → that lock's holders and queued
// waiters → the locks those owners wait on, and so on. Reaching the origin
// again proves a cycle through it, and the origin is the one flagged guilty;
// a cycle that does not pass through the origin is left for one of its own
// members to find.
//
// Lock state is read with try-lock only. A busy lock is skipped, which can
// only produce a false negative; the next detection pass (each wake of a
// long wait re-arms one) will see the settled state.

use std::sync::Arc;

use tracing::warn;

use super::{LockEntry, LockOwner, OwnerRef};

/// Bounds the walk; cycles are far shorter in practice.
const MAX_DEPTH: usize = 256;

/// True when the owner's pending wait closes a cycle back to itself.
pub fn origin_is_guilty(origin: &OwnerRef) -> bool {
    let Some(lock) = origin.waiting_for() else {
        return false;
    };
    let mut visited: Vec<*const LockOwner> = Vec::new();
    let guilty = walk(&lock, origin, origin, &mut visited, 0);
    if guilty {
        warn!(owner = origin.id, "deadlock cycle detected; flagging origin");
    }
    guilty
}

fn walk(
    lock: &Arc<LockEntry>,
    skip: &OwnerRef,
    origin: &OwnerRef,
    visited: &mut Vec<*const LockOwner>,
    depth: usize,
) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    let Some(owners) = lock.holders_snapshot() else {
        return false;
    };
    for owner in owners {
        // An owner may hold and wait on the same lock while upgrading; that
        // edge to itself is not a deadlock.
        if Arc::ptr_eq(&owner, skip) {
            continue;
        }
        if Arc::ptr_eq(&owner, origin) {
            return true;
        }
        let ptr = Arc::as_ptr(&owner);
        if visited.contains(&ptr) {
            // A cycle not involving the origin; its members detect it.
            continue;
        }
        visited.push(ptr);
        if let Some(next) = owner.waiting_for() {
            if walk(&next, &owner, origin, visited, depth + 1) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::lock::{LockManager, LockResult};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_two_owner_cycle_is_detected() {
        let lm = Arc::new(LockManager::new());
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);

        let (r, ea) = lm.lock_exclusive(&a, 1, b"x", -1).unwrap();
        assert_eq!(r, LockResult::Acquired);
        let (r, _eb) = lm.lock_exclusive(&b, 1, b"y", -1).unwrap();
        assert_eq!(r, LockResult::Acquired);

        let lm2 = Arc::clone(&lm);
        let b2 = b.clone();
        let handle = thread::spawn(move || {
            // B waits for A's key.
            lm2.lock_exclusive(&b2, 1, b"x", 10_000_000_000)
        });
        thread::sleep(Duration::from_millis(50));

        // A now waits for B's key, closing the cycle; A is the origin of the
        // detection pass and raises the deadlock.
        let result = lm.lock_exclusive(&a, 1, b"y", 10_000_000_000);
        assert!(matches!(result, Err(DbError::Deadlock)));

        // A backs out, releasing its lock; B proceeds.
        lm.unlock_exclusive(&a, &ea).unwrap();
        let (r, _) = handle.join().unwrap().unwrap();
        assert_eq!(r, LockResult::Acquired);
    }

    #[test]
    fn test_no_false_positive_on_plain_contention() {
        let lm = Arc::new(LockManager::new());
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        let (_, entry) = lm.lock_exclusive(&a, 1, b"x", -1).unwrap();

        let lm2 = Arc::clone(&lm);
        let b2 = b.clone();
        let handle = thread::spawn(move || lm2.lock_exclusive(&b2, 1, b"x", 5_000_000_000));
        thread::sleep(Duration::from_millis(30));
        lm.unlock_exclusive(&a, &entry).unwrap();
        let (r, _) = handle.join().unwrap().unwrap();
        assert_eq!(r, LockResult::Acquired);
    }

    #[test]
    fn test_upgrade_wait_is_not_self_deadlock() {
        let lm = Arc::new(LockManager::new());
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        let (_, eb) = lm.lock_shared(&b, 1, b"x", -1).unwrap();
        let (r, _) = lm.lock_upgradable(&a, 1, b"x", -1).unwrap();
        assert_eq!(r, LockResult::Acquired);

        let lm2 = Arc::clone(&lm);
        let b2 = b.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            lm2.unlock_shared(&b2, &eb).unwrap();
        });
        // Waiting on our own upgradable lock for readers to drain must not
        // trip the detector.
        let (r, _) = lm.lock_exclusive(&a, 1, b"x", 5_000_000_000).unwrap();
        assert_eq!(r, LockResult::Upgraded);
        handle.join().unwrap();
    }
}
