// Record lock manager.
//
// Locks are keyed by (index id, key) and hashed into a fixed number of
// buckets, each protected by its own mutex. A lock's wait state lives behind
// a second, per-lock mutex with two condition queues: one for upgradable
// waiters, one shared by shared and exclusive waiters. Neither mutex is ever
// held while acquiring anything else, so lock waits cannot entangle with
// node latches or the commit lock.
//
// The 32-bit count field encodes the whole mode: the low 31 bits count
// shared owners, the high bit records an upgradable or exclusive owner, and
// the all-ones value means exclusive.

pub mod deadlock;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{DbError, Result};

/// Count-field bit marking an upgradable or exclusive owner.
const INTENT: u32 = 0x8000_0000;
/// Count-field value meaning exclusively held.
const EXCLUSIVE: u32 = !0;

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Newly acquired; the caller must pair it with an unlock.
    Acquired,
    /// Already owned shared by this owner.
    OwnedShared,
    /// Already owned upgradable by this owner.
    OwnedUpgradable,
    /// Already owned exclusive by this owner.
    OwnedExclusive,
    /// An owned upgradable lock was upgraded to exclusive.
    Upgraded,
    TimedOut,
    Interrupted,
    /// The request is invalid, e.g. upgrading from a plain shared hold.
    Illegal,
}

impl LockResult {
    /// True when the lock is held in the requested (or a stronger) mode.
    pub fn is_held(self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
                | LockResult::Upgraded
        )
    }

    /// Maps a failed acquisition to its error.
    pub fn into_error(self) -> DbError {
        match self {
            LockResult::TimedOut => DbError::LockTimeout,
            LockResult::Interrupted => DbError::LockInterrupted,
            LockResult::Illegal => DbError::IllegalUpgrade,
            _ => DbError::IllegalState("lock result is not a failure".into()),
        }
    }
}

/// A transaction in its role as a lock holder.
pub struct LockOwner {
    pub id: u64,
    /// Lock this owner is currently parked on; read by the deadlock
    /// detector. Set before any wait begins, even a zero-timeout one, so
    /// pending edges are visible.
    waiting_for: Mutex<Option<Arc<LockEntry>>>,
}

pub type OwnerRef = Arc<LockOwner>;

impl LockOwner {
    pub fn new(id: u64) -> OwnerRef {
        Arc::new(LockOwner {
            id,
            waiting_for: Mutex::new(None),
        })
    }

    pub(crate) fn waiting_for(&self) -> Option<Arc<LockEntry>> {
        self.waiting_for.lock().clone()
    }
}

fn same_owner(a: &OwnerRef, b: &OwnerRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// Deferred physical deletion of a tombstone, run when the exclusive lock
/// that covered the delete is released.
pub trait GhostReaper: Send + Sync {
    fn reap_ghost(&self, key: &[u8]);
}

/// Shared-owner slot: grows from nothing through a single inline owner to an
/// open-addressed table that doubles when more than half full.
pub enum SharedOwners {
    Empty,
    One(OwnerRef),
    Many(OwnerTable),
}

impl SharedOwners {
    fn contains(&self, owner: &OwnerRef) -> bool {
        match self {
            SharedOwners::Empty => false,
            SharedOwners::One(o) => same_owner(o, owner),
            SharedOwners::Many(t) => t.contains(owner),
        }
    }

    fn insert(&mut self, owner: OwnerRef) {
        match self {
            SharedOwners::Empty => *self = SharedOwners::One(owner),
            SharedOwners::One(first) => {
                let mut table = OwnerTable::new();
                table.insert(first.clone());
                table.insert(owner);
                *self = SharedOwners::Many(table);
            }
            SharedOwners::Many(t) => t.insert(owner),
        }
    }

    fn remove(&mut self, owner: &OwnerRef) -> bool {
        match self {
            SharedOwners::Empty => false,
            SharedOwners::One(o) => {
                if same_owner(o, owner) {
                    *self = SharedOwners::Empty;
                    true
                } else {
                    false
                }
            }
            SharedOwners::Many(t) => {
                let removed = t.remove(owner);
                if t.len == 0 {
                    *self = SharedOwners::Empty;
                }
                removed
            }
        }
    }

    fn for_each(&self, mut f: impl FnMut(&OwnerRef)) {
        match self {
            SharedOwners::Empty => {}
            SharedOwners::One(o) => f(o),
            SharedOwners::Many(t) => {
                for slot in &t.slots {
                    if let Some(o) = slot {
                        f(o);
                    }
                }
            }
        }
    }
}

pub struct OwnerTable {
    slots: Vec<Option<OwnerRef>>,
    len: usize,
}

impl OwnerTable {
    fn new() -> OwnerTable {
        OwnerTable {
            slots: vec![None, None, None, None],
            len: 0,
        }
    }

    fn index(&self, owner: &OwnerRef) -> usize {
        // Pointer identity is the owner's identity.
        let addr = Arc::as_ptr(owner) as usize;
        (addr >> 4).wrapping_mul(0x9E37_79B9) & (self.slots.len() - 1)
    }

    fn contains(&self, owner: &OwnerRef) -> bool {
        let mut i = self.index(owner);
        loop {
            match &self.slots[i] {
                None => return false,
                Some(o) if same_owner(o, owner) => return true,
                Some(_) => i = (i + 1) & (self.slots.len() - 1),
            }
        }
    }

    fn insert(&mut self, owner: OwnerRef) {
        if 2 * (self.len + 1) > self.slots.len() {
            self.grow();
        }
        let mut i = self.index(&owner);
        loop {
            match &self.slots[i] {
                None => {
                    self.slots[i] = Some(owner);
                    self.len += 1;
                    return;
                }
                Some(o) if same_owner(o, &owner) => return,
                Some(_) => i = (i + 1) & (self.slots.len() - 1),
            }
        }
    }

    fn remove(&mut self, owner: &OwnerRef) -> bool {
        let mut i = self.index(owner);
        loop {
            match &self.slots[i] {
                None => return false,
                Some(o) if same_owner(o, owner) => break,
                Some(_) => i = (i + 1) & (self.slots.len() - 1),
            }
        }
        self.slots[i] = None;
        self.len -= 1;
        // Rehash the probe run following the removed slot.
        let mask = self.slots.len() - 1;
        let mut j = (i + 1) & mask;
        while let Some(o) = self.slots[j].take() {
            self.len -= 1;
            self.insert(o);
            j = (j + 1) & mask;
        }
        true
    }

    fn grow(&mut self) {
        let new_len = (self.slots.len() * 2).max(4);
        let old = std::mem::replace(&mut self.slots, vec![None; new_len]);
        self.len = 0;
        for owner in old.into_iter().flatten() {
            self.insert(owner);
        }
    }
}

pub(crate) struct LockState {
    count: u32,
    /// The upgradable or exclusive owner.
    owner: Option<OwnerRef>,
    shared: SharedOwners,
    /// Waiters parked on the two queues; kept visible for the deadlock
    /// detector.
    pub(crate) waiters_u: Vec<OwnerRef>,
    pub(crate) waiters_sx: Vec<OwnerRef>,
    /// Exclusive requests among the SX waiters; pending exclusive intent
    /// blocks new shared acquisitions.
    sx_exclusive: u32,
    ghost: Option<Arc<dyn GhostReaper>>,
}

pub struct LockEntry {
    pub index_id: u64,
    pub key: Box<[u8]>,
    hash: u64,
    pub(crate) state: Mutex<LockState>,
    queue_u: Condvar,
    queue_sx: Condvar,
}

impl LockEntry {
    pub(crate) fn holders_snapshot(&self) -> Option<Vec<OwnerRef>> {
        // Latch-free in spirit: never block the detector on a busy lock; a
        // missed read is a false negative that a later pass catches.
        let state = self.state.try_lock()?;
        let mut owners = Vec::new();
        if let Some(owner) = &state.owner {
            owners.push(owner.clone());
        }
        state.shared.for_each(|o| owners.push(o.clone()));
        owners.extend(state.waiters_sx.iter().cloned());
        owners.extend(state.waiters_u.iter().cloned());
        Some(owners)
    }
}

struct Bucket {
    entries: Mutex<HashMap<(u64, Box<[u8]>), Arc<LockEntry>>>,
}

pub struct LockManager {
    buckets: Box<[Bucket]>,
    closed: AtomicBool,
}

enum Wait {
    Granted(LockResult),
    Keep,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Queue {
    Upgradable,
    SharedSx,
    ExclusiveSx,
}

impl LockManager {
    pub fn new() -> LockManager {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let count = (threads * 8).next_power_of_two().clamp(16, 1024);
        let buckets = (0..count)
            .map(|_| Bucket {
                entries: Mutex::new(HashMap::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LockManager {
            buckets,
            closed: AtomicBool::new(false),
        }
    }

    fn bucket(&self, hash: u64) -> &Bucket {
        &self.buckets[hash as usize & (self.buckets.len() - 1)]
    }

    fn entry_for(&self, index_id: u64, key: &[u8]) -> Arc<LockEntry> {
        let mut hasher = DefaultHasher::new();
        index_id.hash(&mut hasher);
        key.hash(&mut hasher);
        let hash = hasher.finish();
        let bucket = self.bucket(hash);
        let mut entries = bucket.entries.lock();
        entries
            .entry((index_id, key.into()))
            .or_insert_with(|| {
                Arc::new(LockEntry {
                    index_id,
                    key: key.into(),
                    hash,
                    state: Mutex::new(LockState {
                        count: 0,
                        owner: None,
                        shared: SharedOwners::Empty,
                        waiters_u: Vec::new(),
                        waiters_sx: Vec::new(),
                        sx_exclusive: 0,
                        ghost: None,
                    }),
                    queue_u: Condvar::new(),
                    queue_sx: Condvar::new(),
                })
            })
            .clone()
    }

    /// Acquires a shared lock. `timeout_nanos` is relative; negative waits
    /// forever.
    pub fn lock_shared(
        &self,
        owner: &OwnerRef,
        index_id: u64,
        key: &[u8],
        timeout_nanos: i64,
    ) -> Result<(LockResult, Arc<LockEntry>)> {
        let entry = self.entry_for(index_id, key);
        let result = self.wait_loop(
            owner,
            &entry,
            timeout_nanos,
            Queue::SharedSx,
            |state, owner| {
                if let Some(current) = &state.owner {
                    if same_owner(current, owner) {
                        return Wait::Granted(if state.count == EXCLUSIVE {
                            LockResult::OwnedExclusive
                        } else {
                            LockResult::OwnedUpgradable
                        });
                    }
                }
                if state.shared.contains(owner) {
                    return Wait::Granted(LockResult::OwnedShared);
                }
                if state.count != EXCLUSIVE && state.sx_exclusive == 0 {
                    state.count = (state.count & INTENT) | ((state.count & !INTENT) + 1);
                    state.shared.insert(owner.clone());
                    return Wait::Granted(LockResult::Acquired);
                }
                Wait::Keep
            },
        )?;
        Ok((result, entry))
    }

    /// Acquires an upgradable lock, compatible with shared holds from other
    /// owners.
    pub fn lock_upgradable(
        &self,
        owner: &OwnerRef,
        index_id: u64,
        key: &[u8],
        timeout_nanos: i64,
    ) -> Result<(LockResult, Arc<LockEntry>)> {
        let entry = self.entry_for(index_id, key);
        let result = self.wait_loop(
            owner,
            &entry,
            timeout_nanos,
            Queue::Upgradable,
            |state, owner| {
                if let Some(current) = &state.owner {
                    if same_owner(current, owner) {
                        return Wait::Granted(if state.count == EXCLUSIVE {
                            LockResult::OwnedExclusive
                        } else {
                            LockResult::OwnedUpgradable
                        });
                    }
                }
                if state.shared.contains(owner) {
                    // Upgrading from a plain shared hold would deadlock
                    // against our own count; the owner's lock mode does not
                    // permit it.
                    return Wait::Granted(LockResult::Illegal);
                }
                if state.count & INTENT == 0 {
                    state.count |= INTENT;
                    state.owner = Some(owner.clone());
                    return Wait::Granted(LockResult::Acquired);
                }
                Wait::Keep
            },
        )?;
        Ok((result, entry))
    }

    /// Acquires an exclusive lock, upgrading an owned upgradable hold.
    pub fn lock_exclusive(
        &self,
        owner: &OwnerRef,
        index_id: u64,
        key: &[u8],
        timeout_nanos: i64,
    ) -> Result<(LockResult, Arc<LockEntry>)> {
        let (result, entry) = self.lock_upgradable(owner, index_id, key, timeout_nanos)?;
        match result {
            LockResult::Acquired | LockResult::OwnedUpgradable => {}
            LockResult::OwnedExclusive => return Ok((result, entry)),
            other => return Ok((other, entry)),
        }
        let upgrading_from_owned = result == LockResult::OwnedUpgradable;

        let upgraded = self.wait_loop(
            owner,
            &entry,
            timeout_nanos,
            Queue::ExclusiveSx,
            |state, _owner| {
                if state.count == INTENT {
                    state.count = EXCLUSIVE;
                    return Wait::Granted(LockResult::Acquired);
                }
                Wait::Keep
            },
        );
        match upgraded {
            Ok(LockResult::Acquired) => Ok((
                if upgrading_from_owned {
                    LockResult::Upgraded
                } else {
                    LockResult::Acquired
                },
                entry,
            )),
            Ok(failure) => {
                // Roll the upgradable hold back unless it was pre-owned.
                if !upgrading_from_owned {
                    self.unlock_upgradable(owner, &entry)?;
                }
                Ok((failure, entry))
            }
            Err(err) => {
                if !upgrading_from_owned {
                    let _ = self.unlock_upgradable(owner, &entry);
                }
                Err(err)
            }
        }
    }

    /// One acquisition loop around the two condition queues.
    fn wait_loop(
        &self,
        owner: &OwnerRef,
        entry: &Arc<LockEntry>,
        timeout_nanos: i64,
        queue: Queue,
        mut try_grant: impl FnMut(&mut LockState, &OwnerRef) -> Wait,
    ) -> Result<LockResult> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(LockResult::Interrupted);
        }
        let start = Instant::now();
        let mut state = entry.state.lock();
        let mut check_deadlock = true;
        loop {
            match try_grant(&mut state, owner) {
                Wait::Granted(result) => {
                    *owner.waiting_for.lock() = None;
                    return Ok(result);
                }
                Wait::Keep => {}
            }

            // The wait-for edge is published before any timeout check so the
            // deadlock detector sees even zero-timeout requests.
            *owner.waiting_for.lock() = Some(entry.clone());

            let expired = if timeout_nanos < 0 {
                false
            } else {
                start.elapsed().as_nanos() as u64 >= timeout_nanos as u64
            };
            if expired {
                *owner.waiting_for.lock() = None;
                return Ok(LockResult::TimedOut);
            }

            if check_deadlock {
                check_deadlock = false;
                // Detection reads other locks' state, so this lock's mutex
                // must not be held across it.
                let guilty = parking_lot::MutexGuard::unlocked(&mut state, || {
                    deadlock::origin_is_guilty(owner)
                });
                if guilty {
                    *owner.waiting_for.lock() = None;
                    return Err(DbError::Deadlock);
                }
                // The state may have changed while unlocked; re-attempt the
                // grant before parking.
                continue;
            }

            match queue {
                Queue::Upgradable => state.waiters_u.push(owner.clone()),
                Queue::SharedSx => state.waiters_sx.push(owner.clone()),
                Queue::ExclusiveSx => {
                    state.waiters_sx.push(owner.clone());
                    state.sx_exclusive += 1;
                }
            }

            let timed_out = if timeout_nanos < 0 {
                if queue == Queue::Upgradable {
                    entry.queue_u.wait(&mut state);
                } else {
                    entry.queue_sx.wait(&mut state);
                }
                false
            } else {
                let elapsed = start.elapsed().as_nanos() as u64;
                let remaining =
                    Duration::from_nanos((timeout_nanos as u64).saturating_sub(elapsed));
                if queue == Queue::Upgradable {
                    entry.queue_u.wait_for(&mut state, remaining).timed_out()
                } else {
                    entry.queue_sx.wait_for(&mut state, remaining).timed_out()
                }
            };

            match queue {
                Queue::Upgradable => remove_owner(&mut state.waiters_u, owner),
                Queue::SharedSx => remove_owner(&mut state.waiters_sx, owner),
                Queue::ExclusiveSx => {
                    remove_owner(&mut state.waiters_sx, owner);
                    state.sx_exclusive -= 1;
                }
            }

            if self.closed.load(Ordering::Acquire) {
                *owner.waiting_for.lock() = None;
                return Ok(LockResult::Interrupted);
            }
            if timed_out {
                // One last grant attempt before reporting the timeout.
                *owner.waiting_for.lock() = None;
                if let Wait::Granted(result) = try_grant(&mut state, owner) {
                    return Ok(result);
                }
                return Ok(LockResult::TimedOut);
            }
            // Re-check for deadlock on long waits: cycles can form after the
            // wait started.
            check_deadlock = true;
        }
    }

    /// Attaches a deferred tombstone reap to an exclusively held lock.
    pub fn set_ghost(&self, entry: &Arc<LockEntry>, reaper: Arc<dyn GhostReaper>) {
        entry.state.lock().ghost = Some(reaper);
    }

    pub fn unlock_shared(&self, owner: &OwnerRef, entry: &Arc<LockEntry>) -> Result<()> {
        {
            let mut state = entry.state.lock();
            if state.count == EXCLUSIVE || !state.shared.remove(owner) {
                return Err(DbError::IllegalState(
                    "unlock of a shared lock that is not held".into(),
                ));
            }
            state.count = (state.count & INTENT) | ((state.count & !INTENT) - 1);
            if state.count & !INTENT == 0 {
                // Last reader gone: an upgrade may proceed.
                entry.queue_sx.notify_all();
                entry.queue_u.notify_all();
            }
        }
        self.remove_if_unused(entry);
        Ok(())
    }

    pub fn unlock_upgradable(&self, owner: &OwnerRef, entry: &Arc<LockEntry>) -> Result<()> {
        {
            let mut state = entry.state.lock();
            match &state.owner {
                Some(current) if same_owner(current, owner) => {}
                _ => {
                    return Err(DbError::IllegalState(
                        "unlock of an upgradable lock that is not held".into(),
                    ))
                }
            }
            if state.count == EXCLUSIVE {
                return Err(DbError::IllegalState(
                    "lock is held exclusive; unlock it as exclusive".into(),
                ));
            }
            state.owner = None;
            state.count &= !INTENT;
            entry.queue_u.notify_all();
            entry.queue_sx.notify_all();
        }
        self.remove_if_unused(entry);
        Ok(())
    }

    /// Releases an exclusive lock. If a ghost reap is attached it runs while
    /// the lock is still logically held, so no other owner can observe the
    /// tombstone.
    pub fn unlock_exclusive(&self, owner: &OwnerRef, entry: &Arc<LockEntry>) -> Result<()> {
        let ghost = {
            let mut state = entry.state.lock();
            match &state.owner {
                Some(current) if same_owner(current, owner) && state.count == EXCLUSIVE => {}
                _ => {
                    return Err(DbError::IllegalState(
                        "unlock of an exclusive lock that is not held".into(),
                    ))
                }
            }
            state.ghost.take()
        };

        if let Some(reaper) = ghost {
            // Best effort, outside the lock mutex: the reap descends the
            // tree and must not hold any lock-table state while doing so.
            reaper.reap_ghost(&entry.key);
        }

        {
            let mut state = entry.state.lock();
            state.owner = None;
            state.count = 0;
            entry.queue_u.notify_all();
            entry.queue_sx.notify_all();
        }
        self.remove_if_unused(entry);
        Ok(())
    }

    /// Drops the entry from its bucket once nothing references it.
    fn remove_if_unused(&self, entry: &Arc<LockEntry>) {
        let bucket = self.bucket(entry.hash);
        let mut entries = bucket.entries.lock();
        let state = entry.state.lock();
        let unused = state.count == 0
            && state.owner.is_none()
            && matches!(state.shared, SharedOwners::Empty)
            && state.waiters_u.is_empty()
            && state.waiters_sx.is_empty()
            && state.ghost.is_none();
        if unused {
            entries.remove(&(entry.index_id, entry.key.clone()));
        }
    }

    /// Interrupts every waiter; subsequent acquisitions fail fast.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for bucket in self.buckets.iter() {
            let entries: Vec<Arc<LockEntry>> =
                bucket.entries.lock().values().cloned().collect();
            for entry in entries {
                let waiting = {
                    let state = entry.state.lock();
                    !state.waiters_u.is_empty() || !state.waiters_sx.is_empty()
                };
                if waiting {
                    warn!(index = entry.index_id, "interrupting lock waiters on close");
                }
                entry.queue_u.notify_all();
                entry.queue_sx.notify_all();
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

fn remove_owner(list: &mut Vec<OwnerRef>, owner: &OwnerRef) {
    if let Some(at) = list.iter().position(|o| same_owner(o, owner)) {
        list.swap_remove(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const FOREVER: i64 = -1;
    const MS50: i64 = 50_000_000;

    #[test]
    fn test_shared_then_shared() {
        let lm = LockManager::new();
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        let (r1, e1) = lm.lock_shared(&a, 1, b"k", FOREVER).unwrap();
        assert_eq!(r1, LockResult::Acquired);
        let (r2, _) = lm.lock_shared(&b, 1, b"k", FOREVER).unwrap();
        assert_eq!(r2, LockResult::Acquired);
        let (r3, _) = lm.lock_shared(&a, 1, b"k", FOREVER).unwrap();
        assert_eq!(r3, LockResult::OwnedShared);
        lm.unlock_shared(&a, &e1).unwrap();
        lm.unlock_shared(&b, &e1).unwrap();
    }

    #[test]
    fn test_exclusive_blocks_shared() {
        let lm = LockManager::new();
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        let (r, entry) = lm.lock_exclusive(&a, 1, b"k", FOREVER).unwrap();
        assert_eq!(r, LockResult::Acquired);
        let (r, _) = lm.lock_shared(&b, 1, b"k", 0).unwrap();
        assert_eq!(r, LockResult::TimedOut);
        lm.unlock_exclusive(&a, &entry).unwrap();
        let (r, e) = lm.lock_shared(&b, 1, b"k", MS50).unwrap();
        assert_eq!(r, LockResult::Acquired);
        lm.unlock_shared(&b, &e).unwrap();
    }

    #[test]
    fn test_upgradable_compatible_with_shared() {
        let lm = LockManager::new();
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        let (r, ea) = lm.lock_shared(&a, 1, b"k", FOREVER).unwrap();
        assert_eq!(r, LockResult::Acquired);
        let (r, eb) = lm.lock_upgradable(&b, 1, b"k", FOREVER).unwrap();
        assert_eq!(r, LockResult::Acquired);
        // A second upgradable conflicts.
        let c = LockOwner::new(3);
        let (r, _) = lm.lock_upgradable(&c, 1, b"k", 0).unwrap();
        assert_eq!(r, LockResult::TimedOut);
        lm.unlock_shared(&a, &ea).unwrap();
        lm.unlock_upgradable(&b, &eb).unwrap();
    }

    #[test]
    fn test_upgrade_waits_for_readers() {
        let lm = Arc::new(LockManager::new());
        let reader = LockOwner::new(1);
        let writer = LockOwner::new(2);
        let (_, re) = lm.lock_shared(&reader, 1, b"k", FOREVER).unwrap();
        let (r, _we) = lm.lock_upgradable(&writer, 1, b"k", FOREVER).unwrap();
        assert_eq!(r, LockResult::Acquired);

        let lm2 = Arc::clone(&lm);
        let reader2 = reader.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            lm2.unlock_shared(&reader2, &re).unwrap();
        });

        let (r, we) = lm.lock_exclusive(&writer, 1, b"k", 5_000_000_000).unwrap();
        assert_eq!(r, LockResult::Upgraded);
        handle.join().unwrap();
        lm.unlock_exclusive(&writer, &we).unwrap();
    }

    #[test]
    fn test_illegal_upgrade_from_shared() {
        let lm = LockManager::new();
        let a = LockOwner::new(1);
        let b = LockOwner::new(2);
        let (_, _ea) = lm.lock_shared(&a, 1, b"k", FOREVER).unwrap();
        let (_, _eb) = lm.lock_shared(&b, 1, b"k", FOREVER).unwrap();
        let (r, _) = lm.lock_exclusive(&a, 1, b"k", 0).unwrap();
        assert_eq!(r, LockResult::Illegal);
    }

    #[test]
    fn test_close_interrupts_waiter() {
        let lm = Arc::new(LockManager::new());
        let a = LockOwner::new(1);
        let (_, _entry) = lm.lock_exclusive(&a, 1, b"k", FOREVER).unwrap();

        let lm2 = Arc::clone(&lm);
        let handle = thread::spawn(move || {
            let b = LockOwner::new(2);
            let (r, _) = lm2.lock_shared(&b, 1, b"k", 10_000_000_000).unwrap();
            r
        });
        thread::sleep(Duration::from_millis(30));
        lm.close();
        assert_eq!(handle.join().unwrap(), LockResult::Interrupted);
    }

    #[test]
    fn test_entry_removed_when_unused() {
        let lm = LockManager::new();
        let a = LockOwner::new(1);
        let (_, entry) = lm.lock_exclusive(&a, 7, b"gone", FOREVER).unwrap();
        lm.unlock_exclusive(&a, &entry).unwrap();
        let bucket = lm.bucket(entry.hash);
        assert!(!bucket
            .entries
            .lock()
            .contains_key(&(7u64, Box::from(&b"gone"[..]))));
    }

    #[test]
    fn test_owner_table_growth_and_removal() {
        let mut slot = SharedOwners::Empty;
        let owners: Vec<OwnerRef> = (0..20).map(LockOwner::new).collect();
        for o in &owners {
            slot.insert(o.clone());
        }
        for o in &owners {
            assert!(slot.contains(o));
        }
        for o in &owners {
            assert!(slot.remove(o));
        }
        assert!(matches!(slot, SharedOwners::Empty));
    }
}
