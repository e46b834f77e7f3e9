// Non-reentrant reader/writer latch.
//
// A latch is a short-duration mutex protecting in-memory structures; it is
// not a transactional lock. Ownership is not tracked: callers pair every
// acquire with a release, and the ordering rules (commit lock before node
// latches, parent before child) are enforced by callers, not here.
//
// Two variants exist. The unfair variant barges: a releasing thread lets any
// acquirer win the race. The fair variant hands the latch to the longest
// waiting thread on release. The core uses unfair everywhere except the
// commit lock, which must not starve the checkpointer.

use std::hint;

use parking_lot::lock_api::{
    RawRwLock as RawRwLockApi, RawRwLockDowngrade, RawRwLockFair,
};
use parking_lot::RawRwLock;

/// Number of acquisition attempts before parking.
const SPIN_LIMIT: u32 = 32;

pub struct Latch {
    raw: RawRwLock,
    fair: bool,
}

impl Latch {
    /// Creates a latch with barge-allowed release.
    pub fn new() -> Latch {
        Latch {
            raw: RawRwLock::INIT,
            fair: false,
        }
    }

    /// Creates a latch with FIFO handoff on release.
    pub fn new_fair() -> Latch {
        Latch {
            raw: RawRwLock::INIT,
            fair: true,
        }
    }

    pub fn acquire_shared(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.raw.try_lock_shared() {
                return;
            }
            hint::spin_loop();
        }
        self.raw.lock_shared();
    }

    pub fn try_acquire_shared(&self) -> bool {
        self.raw.try_lock_shared()
    }

    /// Releases a shared hold. The caller must hold the latch shared.
    pub fn release_shared(&self) {
        unsafe {
            if self.fair {
                self.raw.unlock_shared_fair();
            } else {
                self.raw.unlock_shared();
            }
        }
    }

    pub fn acquire_exclusive(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.raw.try_lock_exclusive() {
                return;
            }
            hint::spin_loop();
        }
        self.raw.lock_exclusive();
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    /// Releases an exclusive hold. The caller must hold the latch exclusive.
    pub fn release_exclusive(&self) {
        unsafe {
            if self.fair {
                self.raw.unlock_exclusive_fair();
            } else {
                self.raw.unlock_exclusive();
            }
        }
    }

    /// Atomically converts an exclusive hold into a shared hold, without
    /// letting any writer in between. The caller must hold the latch
    /// exclusive.
    pub fn downgrade(&self) {
        unsafe {
            self.raw.downgrade();
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("fair", &self.fair).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_shared_readers_do_not_exclude() {
        let latch = Latch::new();
        latch.acquire_shared();
        assert!(latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        latch.release_shared();
        assert!(latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn test_downgrade_admits_readers() {
        let latch = Latch::new();
        latch.acquire_exclusive();
        latch.downgrade();
        assert!(latch.try_acquire_shared());
        latch.release_shared();
        latch.release_shared();
    }

    #[test]
    fn test_exclusive_handoff_across_threads() {
        let latch = Arc::new(Latch::new_fair());
        latch.acquire_exclusive();
        let other = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            other.acquire_exclusive();
            other.release_exclusive();
        });
        thread::sleep(std::time::Duration::from_millis(10));
        latch.release_exclusive();
        handle.join().unwrap();
    }
}
