// Transactions.
//
// A transaction owns a set of record locks, an undo log, and a position in
// the redo stream. Scopes nest: `enter` pushes a savepoint, `exit` rolls the
// current scope back and pops it, `commit` of a nested scope folds its locks
// and undo into the parent. Committing the outermost scope settles the undo
// log, appends and flushes the redo commit record according to the
// durability mode, and only then releases locks, handing exclusive locks
// their deferred ghost reaps.

pub mod redo;
pub mod undo;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DurabilityMode;
use crate::db::DbInner;
use crate::error::{DbError, Result};
use crate::lock::{LockEntry, LockOwner, LockResult, OwnerRef};
use crate::txn::redo::RedoOp;
use crate::txn::undo::{UndoLog, UndoRecord};

/// Per-transaction state that the checkpoint must reach while the
/// transaction is live: its persisted undo log.
pub(crate) struct TxnShared {
    pub undo: Mutex<UndoLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeldMode {
    Shared,
    Upgradable,
    Exclusive,
}

struct HeldLock {
    entry: Arc<LockEntry>,
    mode: HeldMode,
}

struct Scope {
    locks: usize,
    undo: usize,
    /// Whether an ENTER record was appended for this scope.
    logged: bool,
}

pub struct Transaction {
    db: Arc<DbInner>,
    owner: OwnerRef,
    txn_id: u64,
    durability: DurabilityMode,
    lock_timeout_nanos: i64,
    locks: Vec<HeldLock>,
    scopes: Vec<Scope>,
    shared: Arc<TxnShared>,
    registered: bool,
    wrote: bool,
    bogus: bool,
}

impl Transaction {
    pub(crate) fn new(db: Arc<DbInner>, durability: DurabilityMode) -> Transaction {
        let txn_id = db.next_txn_id();
        let lock_timeout_nanos = db.default_lock_timeout_nanos();
        let store = db.store();
        Transaction {
            db,
            owner: LockOwner::new(txn_id),
            txn_id,
            durability,
            lock_timeout_nanos,
            locks: Vec::new(),
            scopes: vec![Scope {
                locks: 0,
                undo: 0,
                logged: false,
            }],
            shared: Arc::new(TxnShared {
                undo: Mutex::new(UndoLog::new(store)),
            }),
            registered: false,
            wrote: false,
            bogus: false,
        }
    }

    /// A transaction that takes no locks and writes no logs. Used by
    /// recovery replay and ghost reaping, where the caller already owns the
    /// protection the logs and locks would provide.
    pub(crate) fn bogus(db: Arc<DbInner>) -> Transaction {
        let mut txn = Transaction::new(db, DurabilityMode::NoRedo);
        txn.bogus = true;
        txn
    }

    pub fn id(&self) -> u64 {
        self.txn_id
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability
    }

    pub fn set_durability_mode(&mut self, mode: DurabilityMode) {
        self.durability = mode;
    }

    /// Lock timeout for subsequent acquisitions; `None` waits forever.
    pub fn set_lock_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.lock_timeout_nanos = match timeout {
            Some(d) => d.as_nanos().min(i64::MAX as u128) as i64,
            None => -1,
        };
    }

    pub(crate) fn is_bogus(&self) -> bool {
        self.bogus
    }

    /// Enters a nested scope.
    pub fn enter(&mut self) -> Result<()> {
        self.db.check_open()?;
        self.scopes.push(Scope {
            locks: self.locks.len(),
            undo: self.shared.undo.lock().len(),
            logged: false,
        });
        Ok(())
    }

    /// Commits the current scope. For a nested scope the locks and undo are
    /// folded into the parent; the outermost commit makes the transaction's
    /// effects durable per its durability mode and releases all locks.
    pub fn commit(&mut self) -> Result<()> {
        self.db.check_open()?;
        if self.scopes.len() > 1 {
            self.scopes.pop();
            return Ok(());
        }
        self.commit_outer()
    }

    fn commit_outer(&mut self) -> Result<()> {
        if self.wrote && !self.bogus {
            // Everything from the redo append to the undo release happens
            // under the shared commit lock, so a checkpoint either sees this
            // transaction as fully live or fully committed.
            let store = self.db.store();
            store.commit_lock.acquire_shared();
            let result = (|| -> Result<()> {
                if self.durability.logs_redo() {
                    self.db.redo().append(&RedoOp::Commit {
                        txn_id: self.txn_id,
                    });
                    self.db.redo().commit_flush(self.durability)?;
                }
                self.shared.undo.lock().discard();
                self.db.unregister_txn(self.txn_id);
                self.registered = false;
                Ok(())
            })();
            store.commit_lock.release_shared();
            result?;
        }
        self.release_locks_down_to(0);
        self.reset_after_finish();
        debug!(txn = self.txn_id, "transaction committed");
        Ok(())
    }

    /// Abandons the transaction without rollback or lock release, as if the
    /// owning thread died mid-flight. Crash-recovery test support.
    #[doc(hidden)]
    pub fn abandon(mut self) {
        self.locks.clear();
        self.wrote = false;
        self.registered = false;
    }

    /// Exits the current scope, rolling back its effects. Exiting the
    /// outermost scope rolls back the whole transaction.
    pub fn exit(&mut self) -> Result<()> {
        let (lock_mark, undo_mark, logged) = match self.scopes.last() {
            Some(s) => (s.locks, s.undo, s.logged),
            None => (0, 0, false),
        };
        self.rollback_to(lock_mark, undo_mark)?;
        if self.scopes.len() > 1 {
            if logged && self.durability.logs_redo() && !self.bogus {
                self.db.redo().append(&RedoOp::Exit {
                    txn_id: self.txn_id,
                });
            }
            self.scopes.pop();
        } else {
            if self.wrote && self.durability.logs_redo() && !self.bogus {
                self.db.redo().append(&RedoOp::Rollback {
                    txn_id: self.txn_id,
                });
            }
            self.finish_rollback();
        }
        Ok(())
    }

    /// Rolls the whole transaction back, regardless of scope depth.
    pub fn rollback(&mut self) -> Result<()> {
        self.rollback_to(0, 0)?;
        if self.wrote && self.durability.logs_redo() && !self.bogus {
            self.db.redo().append(&RedoOp::Rollback {
                txn_id: self.txn_id,
            });
        }
        self.finish_rollback();
        Ok(())
    }

    fn rollback_to(&mut self, lock_mark: usize, undo_mark: usize) -> Result<()> {
        let records = self.shared.undo.lock().drain_to(undo_mark);
        for record in &records {
            // apply_undo takes the shared commit lock per record.
            self.db.apply_undo(record)?;
        }
        self.release_locks_down_to(lock_mark);
        Ok(())
    }

    fn finish_rollback(&mut self) {
        self.shared.undo.lock().discard();
        if self.registered {
            self.db.unregister_txn(self.txn_id);
            self.registered = false;
        }
        self.release_locks_down_to(0);
        self.reset_after_finish();
        debug!(txn = self.txn_id, "transaction rolled back");
    }

    fn reset_after_finish(&mut self) {
        self.scopes.clear();
        self.scopes.push(Scope {
            locks: 0,
            undo: 0,
            logged: false,
        });
        self.wrote = false;
        // The identity is retired with the released locks; a reused
        // transaction gets a fresh id and owner.
        self.txn_id = self.db.next_txn_id();
        self.owner = LockOwner::new(self.txn_id);
    }

    fn release_locks_down_to(&mut self, mark: usize) {
        while self.locks.len() > mark {
            let held = self.locks.pop().unwrap();
            let result = match held.mode {
                HeldMode::Shared => self.db.locks().unlock_shared(&self.owner, &held.entry),
                HeldMode::Upgradable => {
                    self.db.locks().unlock_upgradable(&self.owner, &held.entry)
                }
                HeldMode::Exclusive => {
                    self.db.locks().unlock_exclusive(&self.owner, &held.entry)
                }
            };
            if let Err(err) = result {
                debug!(txn = self.txn_id, %err, "lock release failed");
            }
        }
    }

    // -- hooks used by the tree layer ------------------------------------

    /// Acquires a shared record lock under this transaction.
    pub(crate) fn lock_shared(&mut self, index_id: u64, key: &[u8]) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let (result, entry) =
            self.db
                .locks()
                .lock_shared(&self.owner, index_id, key, self.lock_timeout_nanos)?;
        self.record_lock(result, entry, HeldMode::Shared)
    }

    /// Acquires an exclusive record lock, returning the entry so a delete
    /// can attach its ghost reap.
    pub(crate) fn lock_exclusive(
        &mut self,
        index_id: u64,
        key: &[u8],
    ) -> Result<Arc<LockEntry>> {
        if self.bogus {
            return Err(DbError::IllegalState(
                "bogus transactions do not take locks".into(),
            ));
        }
        let (result, entry) = self.db.locks().lock_exclusive(
            &self.owner,
            index_id,
            key,
            self.lock_timeout_nanos,
        )?;
        self.record_lock(result, entry.clone(), HeldMode::Exclusive)?;
        Ok(entry)
    }

    fn record_lock(
        &mut self,
        result: LockResult,
        entry: Arc<LockEntry>,
        mode: HeldMode,
    ) -> Result<()> {
        match result {
            LockResult::Acquired => {
                self.locks.push(HeldLock { entry, mode });
                Ok(())
            }
            LockResult::Upgraded => {
                // Strengthen the existing hold in place.
                for held in self.locks.iter_mut().rev() {
                    if Arc::ptr_eq(&held.entry, &entry) {
                        held.mode = HeldMode::Exclusive;
                        break;
                    }
                }
                Ok(())
            }
            LockResult::OwnedShared
            | LockResult::OwnedUpgradable
            | LockResult::OwnedExclusive => Ok(()),
            failure => Err(failure.into_error()),
        }
    }

    /// Registers the first write: the transaction becomes visible to
    /// checkpoints so its undo log is anchored.
    pub(crate) fn begin_write(&mut self) {
        self.wrote = true;
        if !self.registered && !self.bogus {
            self.db.register_txn(self.txn_id, Arc::clone(&self.shared));
            self.registered = true;
        }
    }

    /// Appends an undo action for a mutation this transaction performed.
    pub(crate) fn push_undo(&mut self, record: UndoRecord) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        self.shared.undo.lock().push(record)
    }

    /// Appends the redo record for a store, emitting any pending scope
    /// ENTER records first.
    pub(crate) fn redo_store(
        &mut self,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) {
        if self.bogus || !self.durability.logs_redo() {
            return;
        }
        for scope in self.scopes.iter_mut().skip(1) {
            if !scope.logged {
                self.db.redo().append(&RedoOp::Enter {
                    txn_id: self.txn_id,
                });
                scope.logged = true;
            }
        }
        self.db.redo().append(&RedoOp::Store {
            txn_id: self.txn_id,
            index_id,
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        });
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.wrote || !self.locks.is_empty() {
            let _ = self.rollback();
        }
    }
}
