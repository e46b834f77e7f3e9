// B+tree operations over latched nodes.
//
// Read descents take shared latches, coupled: the child is latched before
// the parent is released. Write descents take exclusive latches and carry
// copy-on-write downward: every node on the path is marked dirty, and a
// child that received a new page id is repointed in its parent before the
// parent can be released. Ancestors stay latched only while the child below
// them might split or merge; the retained suffix of the path is exactly
// what split propagation and merging need.
//
// A split attaches a descriptor to the node and is finished before the
// enclosing operation releases its latches, so no split ever outlives the
// shared commit lock hold that produced it. Access to a node carrying a
// descriptor still goes through `select_node`, and cursors rebind their
// frames through the descriptor, because a reader latching the node between
// the attach and the finish observes the split state.

pub mod cursor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::db::DbInner;
use crate::error::{DbError, Result};
use crate::lock::{GhostReaper, LockEntry, LockOwner};
use crate::node::{
    encoded_leaf_entry_size, key_header_len, max_leaf_entry_size, NodeRef, Split,
    KIND_REGISTRY, MAX_KEY_LEN,
};
use crate::txn::undo::UndoRecord;
use crate::txn::Transaction;

/// Index id of the registry tree.
pub const REGISTRY_INDEX_ID: u64 = 0;

/// What a write descent does once it reaches the leaf.
#[derive(Clone, Copy)]
pub(crate) enum WriteOp<'a> {
    /// Store a value, or a ghost when `None` (transactional delete).
    Store(Option<&'a [u8]>),
    /// Remove the entry outright. Used by rollback of an insert.
    PhysicalDelete,
    /// Remove the entry only if it is still a ghost. Used at lock release.
    ReapGhost,
}

/// An ordered key/value index backed by one B+tree.
pub struct Tree {
    pub(crate) db: Weak<DbInner>,
    id: u64,
    name: Box<[u8]>,
    /// Pinned root frame; never evicted, and its identity survives root
    /// splits and merges because contents are swapped through it.
    pub(crate) root: NodeRef,
    closed: AtomicBool,
}

impl Tree {
    pub(crate) fn new(db: Weak<DbInner>, id: u64, name: Box<[u8]>, root: NodeRef) -> Arc<Tree> {
        Arc::new(Tree {
            db,
            id,
            name,
            root,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::IndexClosed);
        }
        Ok(())
    }

    fn db(&self) -> Result<Arc<DbInner>> {
        self.db.upgrade().ok_or(DbError::DatabaseClosed)
    }

    fn max_key_len(&self, page_size: usize) -> usize {
        MAX_KEY_LEN.min(page_size / 4)
    }

    fn validate_entry(&self, page_size: usize, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if key.is_empty() {
            return Err(DbError::IllegalArgument("empty keys are not allowed".into()));
        }
        if key.len() > self.max_key_len(page_size) {
            return Err(DbError::IllegalArgument(format!(
                "key too large: {} bytes",
                key.len()
            )));
        }
        let size = encoded_leaf_entry_size(key.len(), value);
        if size > max_leaf_entry_size(page_size) {
            return Err(DbError::IllegalArgument(format!(
                "entry too large: {size} bytes"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loads
    // ------------------------------------------------------------------

    /// Returns a copy of the value mapped to `key`. With a transaction the
    /// read takes (and keeps) a shared record lock; without one an
    /// ephemeral owner locks for the duration of the read.
    pub fn load(&self, txn: Option<&mut Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let db = self.db()?;
        db.check_open()?;
        self.validate_entry(db.store().page_size(), key, None)?;

        match txn {
            Some(txn) if !txn.is_bogus() => {
                txn.lock_shared(self.id, key)?;
                self.read_value(&db, key)
            }
            Some(_) => self.read_value(&db, key),
            None => {
                let owner = LockOwner::new(db.next_txn_id());
                let (result, entry) = db.locks().lock_shared(
                    &owner,
                    self.id,
                    key,
                    db.default_lock_timeout_nanos(),
                )?;
                if !result.is_held() {
                    return Err(result.into_error());
                }
                let value = self.read_value(&db, key);
                db.locks().unlock_shared(&owner, &entry)?;
                value
            }
        }
    }

    /// Shared-latch coupled descent, split-aware.
    fn read_value(&self, db: &Arc<DbInner>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let store = db.store();
        let cache = db.cache();
        let mut node = self.root.clone();
        node.latch.acquire_shared();
        loop {
            if node.inner().split.is_some() {
                node = self.select_node(db, node, key, false)?;
            }
            let inner = node.inner();
            if inner.is_leaf() {
                let pos = inner.binary_search_leaf(key);
                let value = if pos >= 0 {
                    inner.leaf_value(pos).map(|v| v.to_vec())
                } else {
                    None
                };
                node.latch.release_shared();
                return Ok(value);
            }
            let ci = inner.internal_search(key);
            let child_id = inner.child_id(ci);
            let child = match cache.acquire_loaded(&store, child_id, false) {
                Ok(child) => child,
                Err(err) => {
                    node.latch.release_shared();
                    return Err(err);
                }
            };
            node.latch.release_shared();
            node = child;
        }
    }

    /// Picks the correct half of a split node for `key`, keeping the same
    /// latch mode and releasing the other half. The cached sibling is
    /// revalidated against the recorded sibling page id and reloaded under
    /// the descriptor mutex if it went stale.
    pub(crate) fn select_node(
        &self,
        db: &Arc<DbInner>,
        node: NodeRef,
        key: &[u8],
        exclusive: bool,
    ) -> Result<NodeRef> {
        let (sibling, to_sibling) = {
            let split = node
                .inner()
                .split
                .as_ref()
                .expect("select_node on a node without a split");
            let mut slot = split.sibling.lock();
            let mut sibling = slot.clone();
            if exclusive {
                sibling.latch.acquire_exclusive();
            } else {
                sibling.latch.acquire_shared();
            }
            if sibling.id() != split.sibling_id {
                // Evicted and the frame reused; reload through the cache.
                if exclusive {
                    sibling.latch.release_exclusive();
                } else {
                    sibling.latch.release_shared();
                }
                let reloaded =
                    db.cache()
                        .acquire_loaded(&db.store(), split.sibling_id, true)?;
                reloaded.inner_mut().split_sibling = true;
                if !exclusive {
                    reloaded.latch.downgrade();
                }
                *slot = reloaded.clone();
                sibling = reloaded;
            }
            (sibling, split.key_goes_to_sibling(key))
        };
        if to_sibling {
            if exclusive {
                node.latch.release_exclusive();
            } else {
                node.latch.release_shared();
            }
            Ok(sibling)
        } else {
            if exclusive {
                sibling.latch.release_exclusive();
            } else {
                sibling.latch.release_shared();
            }
            Ok(node)
        }
    }

    // ------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------

    /// Maps `key` to `value`, or turns the entry into a ghost when `value`
    /// is `None`. Without a transaction the store auto-commits.
    pub fn store(
        &self,
        txn: Option<&mut Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_open()?;
        let db = self.db()?;
        db.check_open()?;
        self.validate_entry(db.store().page_size(), key, value)?;

        match txn {
            Some(txn) if !txn.is_bogus() => {
                let entry = txn.lock_exclusive(self.id, key)?;
                self.store_under(&db, txn, Some(entry), key, value)?;
                Ok(())
            }
            Some(txn) => {
                self.store_under(&db, txn, None, key, value)?;
                Ok(())
            }
            None => {
                let mut auto = Transaction::new(Arc::clone(&db), db.default_durability());
                let entry = auto.lock_exclusive(self.id, key)?;
                self.store_under(&db, &mut auto, Some(entry), key, value)?;
                auto.commit()
            }
        }
    }

    /// Convenience: transactional delete (leaves a ghost until the lock is
    /// released).
    pub fn delete(&self, txn: Option<&mut Transaction>, key: &[u8]) -> Result<()> {
        self.store(txn, key, None)
    }

    /// Opens a cursor over this index.
    pub fn cursor(self: &Arc<Self>) -> cursor::Cursor {
        cursor::Cursor::new(Arc::clone(self))
    }

    fn store_under(
        &self,
        db: &Arc<DbInner>,
        txn: &mut Transaction,
        ghost_entry: Option<Arc<LockEntry>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        txn.begin_write();
        let store = db.store();
        store.commit_lock.acquire_shared();
        let result = self.store_locked(db, txn, ghost_entry, WriteOp::Store(value), key);
        store.commit_lock.release_shared();
        result
    }

    /// The write descent. The caller holds the shared commit lock; record
    /// locks were acquired before it. Returns the prior live value.
    pub(crate) fn store_locked(
        &self,
        db: &Arc<DbInner>,
        txn: &mut Transaction,
        ghost_entry: Option<Arc<LockEntry>>,
        op: WriteOp<'_>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let store = db.store();
        let cache = db.cache();
        let page_size = store.page_size();

        // Ancestors still latched exclusive, top-down, with the index of the
        // child the descent took.
        let mut held: Vec<(NodeRef, usize)> = Vec::new();
        let mut current = self.root.clone();
        current.latch.acquire_exclusive();

        let result = (|| -> Result<Option<Vec<u8>>> {
            let mut attempts = 0;
            'descend: loop {
                attempts += 1;
                if attempts > 64 {
                    return Err(DbError::IllegalState(
                        "write descent failed to settle".into(),
                    ));
                }
                db.mark_dirty(self, &current)?;
                loop {
                    if current.inner().split.is_some() {
                        // A split left behind by a failed operation. Resolve
                        // it, then restart: finishing consumed a retained
                        // ancestor, so the held chain no longer matches the
                        // path.
                        self.finish_split(db, &mut held, &current)?;
                        current.latch.release_exclusive();
                        for (node, _) in held.drain(..) {
                            node.latch.release_exclusive();
                        }
                        current = self.root.clone();
                        current.latch.acquire_exclusive();
                        continue 'descend;
                    }
                    if current.inner().is_leaf() {
                        return self.leaf_op(db, txn, &ghost_entry, op, key, &mut held, &current);
                    }
                    let ci = current.inner().internal_search(key);
                    let child_id = current.inner().child_id(ci);
                    let child = cache.acquire_loaded(&store, child_id, true)?;
                    if let Err(err) = db.mark_dirty(self, &child) {
                        child.latch.release_exclusive();
                        return Err(err);
                    }
                    if child.id() != child_id {
                        current.inner_mut().set_child_id(ci, child.id());
                    }
                    if self.child_is_safe(page_size, &child, op, key) {
                        // Nothing below can propagate up here; release the
                        // whole retained prefix.
                        for (node, _) in held.drain(..) {
                            node.latch.release_exclusive();
                        }
                        current.latch.release_exclusive();
                    } else {
                        held.push((current.clone(), ci));
                    }
                    current = child;
                }
            }
        })();

        current.latch.release_exclusive();
        for (node, _) in held.drain(..) {
            node.latch.release_exclusive();
        }
        result
    }

    /// True when the child cannot split or merge under this operation, so
    /// its ancestors need not stay latched.
    fn child_is_safe(&self, page_size: usize, child: &NodeRef, op: WriteOp<'_>, key: &[u8]) -> bool {
        let inner = child.inner();
        if inner.split.is_some() {
            return false;
        }
        if inner.is_leaf() {
            match op {
                WriteOp::Store(value) => {
                    // A ghosting delete shrinks in place and never splits.
                    let may_split = match value {
                        Some(v) => {
                            let size = encoded_leaf_entry_size(key.len(), Some(v));
                            !inner_can_hold(inner, size)
                        }
                        None => false,
                    };
                    !may_split
                }
                WriteOp::PhysicalDelete | WriteOp::ReapGhost => {
                    inner.used_bytes() > page_size / 4
                }
            }
        } else {
            // One separator insert: an 8-byte slot plus the largest key.
            let sep_room = 8 + key_header_len(self.max_key_len(page_size))
                + self.max_key_len(page_size);
            let insert_safe = inner_can_hold(inner, sep_room);
            match op {
                WriteOp::Store(_) => insert_safe,
                WriteOp::PhysicalDelete | WriteOp::ReapGhost => {
                    insert_safe && inner.used_bytes() > page_size / 4 && inner.entry_count() > 1
                }
            }
        }
    }

    /// Applies the operation at the latched leaf.
    fn leaf_op(
        &self,
        db: &Arc<DbInner>,
        txn: &mut Transaction,
        ghost_entry: &Option<Arc<LockEntry>>,
        op: WriteOp<'_>,
        key: &[u8],
        held: &mut Vec<(NodeRef, usize)>,
        leaf: &NodeRef,
    ) -> Result<Option<Vec<u8>>> {
        let pos = leaf.inner().binary_search_leaf(key);
        let prior = if pos >= 0 {
            leaf.inner().leaf_value(pos).map(|v| v.to_vec())
        } else {
            None
        };

        match op {
            WriteOp::ReapGhost => {
                if pos >= 0 && leaf.inner().leaf_is_ghost(pos) {
                    leaf.inner_mut().leaf_delete(pos);
                    leaf.bump_version();
                    self.try_merge(db, held, leaf);
                }
                Ok(None)
            }
            WriteOp::PhysicalDelete => {
                if pos >= 0 {
                    leaf.inner_mut().leaf_delete(pos);
                    leaf.bump_version();
                    self.try_merge(db, held, leaf);
                }
                Ok(prior)
            }
            WriteOp::Store(None) => {
                if pos < 0 || leaf.inner().leaf_is_ghost(pos) {
                    // Deleting what is not there is a no-op; the exclusive
                    // lock alone guarantees the outcome.
                    return Ok(None);
                }
                let old = prior.clone().unwrap();
                txn.push_undo(UndoRecord::Undelete {
                    index_id: self.id,
                    key: key.to_vec(),
                    value: old,
                })?;
                txn.redo_store(self.id, key, None);
                let fit = leaf.inner_mut().leaf_update_value(pos, None);
                debug_assert!(fit, "a ghost marker always fits in place");
                if let Some(entry) = ghost_entry {
                    db.locks()
                        .set_ghost(entry, Arc::new(TreeReaper::new(self)));
                }
                Ok(prior)
            }
            WriteOp::Store(Some(value)) => {
                if pos >= 0 {
                    if leaf.inner().leaf_is_ghost(pos) {
                        // Overwriting our own tombstone is an insert; the
                        // rollback order (uninsert after undelete) restores
                        // the ghosted value first.
                        txn.push_undo(UndoRecord::Uninsert {
                            index_id: self.id,
                            key: key.to_vec(),
                        })?;
                    } else {
                        txn.push_undo(UndoRecord::Unupdate {
                            index_id: self.id,
                            key: key.to_vec(),
                            value: prior.clone().unwrap(),
                        })?;
                    }
                    txn.redo_store(self.id, key, Some(value));
                    if !leaf.inner_mut().leaf_update_value(pos, Some(value)) {
                        leaf.inner_mut().leaf_delete(pos);
                        self.insert_entry(db, held, leaf, pos, key, value)?;
                    }
                } else {
                    txn.push_undo(UndoRecord::Uninsert {
                        index_id: self.id,
                        key: key.to_vec(),
                    })?;
                    txn.redo_store(self.id, key, Some(value));
                    self.insert_entry(db, held, leaf, !pos, key, value)?;
                }
                Ok(prior)
            }
        }
    }

    /// Inserts at `pos`, shifting entries to a neighbor or splitting the
    /// leaf when it cannot make room.
    fn insert_entry(
        &self,
        db: &Arc<DbInner>,
        held: &mut Vec<(NodeRef, usize)>,
        leaf: &NodeRef,
        pos: i32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let size = encoded_leaf_entry_size(key.len(), Some(value));
        if leaf.inner_mut().prepare_insert(size) {
            leaf.inner_mut().leaf_insert(pos, key, Some(value));
            leaf.bump_version();
            return Ok(());
        }
        if self.shift_for_insert(db, held, leaf, pos, size)?
            && leaf.inner_mut().prepare_insert(size)
        {
            leaf.inner_mut().leaf_insert(pos, key, Some(value));
            leaf.bump_version();
            return Ok(());
        }
        self.split_leaf_and_insert(db, held, leaf, pos, key, value)
    }

    /// Limited pre-split rebalancing: shifts the leaf's tail into its right
    /// neighbor when that frees enough room and the insertion point stays
    /// local. Keeps slot reuse high without paying for a split.
    fn shift_for_insert(
        &self,
        db: &Arc<DbInner>,
        held: &[(NodeRef, usize)],
        leaf: &NodeRef,
        pos: i32,
        need: usize,
    ) -> Result<bool> {
        let Some((parent, ci)) = held.last().cloned() else {
            return Ok(false);
        };
        if ci >= parent.inner().entry_count() {
            // No right neighbor under this parent.
            return Ok(false);
        }
        let ins_index = (pos / 2) as usize;
        let n = leaf.inner().entry_count();

        // Move just enough of the tail, keeping the insertion point here.
        let shortfall = (need + 2).saturating_sub(leaf.inner().free_total());
        let mut moving = 0usize;
        let mut freed = 0usize;
        while freed < shortfall && ins_index + moving < n {
            let idx = n - 1 - moving;
            freed += leaf.inner().leaf_entry_size(2 * idx as i32) + 2;
            moving += 1;
        }
        if freed < shortfall || moving == 0 {
            return Ok(false);
        }
        let new_sep = leaf.inner().leaf_key(2 * (n - moving) as i32).to_vec();
        if !parent.inner().can_replace_separator(new_sep.len()) {
            return Ok(false);
        }

        let cache = db.cache();
        let store = db.store();
        let sib_id = parent.inner().child_id(ci + 1);
        let sibling = cache.acquire_loaded(&store, sib_id, true)?;
        let shifted = (|| -> Result<bool> {
            if sibling.inner().split.is_some() || sibling.inner().split_sibling {
                return Ok(false);
            }
            if !sibling.inner_mut().prepare_bulk_prepend(leaf.inner(), moving) {
                return Ok(false);
            }
            db.mark_dirty(self, &sibling)?;
            if sibling.id() != sib_id {
                parent.inner_mut().set_child_id(ci + 1, sibling.id());
            }
            sibling
                .inner_mut()
                .leaf_prepend_from_left(leaf.inner_mut(), moving);
            leaf.bump_version();
            sibling.bump_version();
            parent.inner_mut().internal_replace_separator(ci, &new_sep);
            debug!(tree = self.id, moved = moving, "entries shifted before insert");
            Ok(true)
        })();
        sibling.latch.release_exclusive();
        shifted
    }

    /// Splits the latched leaf, places the new entry into the proper half,
    /// and finishes the split against the retained ancestors.
    fn split_leaf_and_insert(
        &self,
        db: &Arc<DbInner>,
        held: &mut Vec<(NodeRef, usize)>,
        leaf: &NodeRef,
        pos: i32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let cache = db.cache();
        let store = db.store();
        let n = leaf.inner().entry_count();
        let ins_index = (pos / 2) as usize;

        let sibling = cache.alloc_latched_node(&store)?;
        sibling.inner_mut().init_leaf(0);
        if let Err(err) = db.mark_dirty(self, &sibling) {
            cache.delete_node(&sibling);
            sibling.latch.release_exclusive();
            return Err(err);
        }

        // Edge inserts split unevenly so append and prepend workloads keep
        // their pages full.
        let (right, split_key) = if ins_index >= n {
            // New sibling is the empty right half; the new entry seeds it.
            (true, key.to_vec())
        } else if ins_index == 0 {
            // New sibling is the empty left half.
            (false, leaf.inner().leaf_key(0).to_vec())
        } else {
            let mid = n / 2;
            let split_at = mid.max(1);
            leaf.inner_mut()
                .leaf_move_high_to(sibling.inner_mut(), split_at);
            (true, sibling.inner().leaf_key(0).to_vec())
        };

        // Place the entry before the split becomes reachable.
        let size = encoded_leaf_entry_size(key.len(), Some(value));
        let target_is_sibling = if right { key >= &split_key[..] } else { key < &split_key[..] };
        if target_is_sibling {
            let local = if right {
                pos - leaf.inner().highest_leaf_pos() - 2
            } else {
                pos
            };
            let ok = sibling.inner_mut().prepare_insert(size);
            debug_assert!(ok, "fresh split half has room");
            sibling.inner_mut().leaf_insert(local, key, Some(value));
        } else {
            let ok = leaf.inner_mut().prepare_insert(size);
            debug_assert!(ok, "split half has room");
            leaf.inner_mut().leaf_insert(pos, key, Some(value));
        }

        sibling.inner_mut().split_sibling = true;
        let sibling_id = sibling.id();
        leaf.inner_mut().split = Some(Box::new(Split::new(
            right,
            sibling_id,
            sibling.clone(),
            &split_key,
        )));
        leaf.bump_version();
        sibling.latch.release_exclusive();
        debug!(tree = self.id, page = leaf.id(), sibling = sibling_id, "leaf split");

        self.finish_split(db, held, leaf)
    }

    /// Resolves the split attached to `node` by inserting its separator
    /// into the parent, cascading further splits up the retained path.
    /// `node` stays latched; retained ancestors consumed here are released.
    fn finish_split(
        &self,
        db: &Arc<DbInner>,
        held: &mut Vec<(NodeRef, usize)>,
        node: &NodeRef,
    ) -> Result<()> {
        let cache = db.cache();
        let store = db.store();
        let mut current = node.clone();
        let mut release_current = false;

        loop {
            let (right, sibling_id, split_key, sibling_ref) = {
                let split = current.inner().split.as_ref().expect("split to finish");
                (
                    split.right,
                    split.sibling_id,
                    split.key.to_vec(),
                    split.sibling.lock().clone(),
                )
            };

            let Some((parent, ci)) = held.pop() else {
                // `current` is the root.
                self.finish_root_split(db, &current)?;
                self.clear_sibling_flag(&sibling_ref);
                if release_current {
                    current.latch.release_exclusive();
                }
                return Ok(());
            };

            let (left_id, right_id) = if right {
                (current.id(), sibling_id)
            } else {
                (sibling_id, current.id())
            };

            if parent.inner_mut().prepare_internal_insert(split_key.len()) {
                parent
                    .inner_mut()
                    .internal_insert_split(ci, &split_key, left_id, right_id);
                parent.bump_version();
                current.inner_mut().split = None;
                self.clear_sibling_flag(&sibling_ref);
                if release_current {
                    current.latch.release_exclusive();
                }
                parent.latch.release_exclusive();
                return Ok(());
            }

            // The parent splits too. Build its sibling, insert the pending
            // separator into the proper half, then resolve the parent's own
            // split one level further up.
            let psib = cache.alloc_latched_node(&store)?;
            psib.inner_mut().init_internal(0);
            if let Err(err) = db.mark_dirty(self, &psib) {
                cache.delete_node(&psib);
                psib.latch.release_exclusive();
                parent.latch.release_exclusive();
                if release_current {
                    current.latch.release_exclusive();
                }
                return Err(err);
            }
            let promoted = parent.inner_mut().split_internal_to(psib.inner_mut());

            let (target, target_index) = if split_key < promoted {
                (&parent, ci)
            } else {
                let m = parent.inner().entry_count();
                (&psib, ci - m - 1)
            };
            let ok = target.inner_mut().prepare_internal_insert(split_key.len());
            debug_assert!(ok, "fresh internal half has room");
            target
                .inner_mut()
                .internal_insert_split(target_index, &split_key, left_id, right_id);
            parent.bump_version();

            current.inner_mut().split = None;
            self.clear_sibling_flag(&sibling_ref);
            if release_current {
                current.latch.release_exclusive();
            }

            psib.inner_mut().split_sibling = true;
            let psib_id = psib.id();
            parent.inner_mut().split = Some(Box::new(Split::new(
                true,
                psib_id,
                psib.clone(),
                &promoted,
            )));
            psib.latch.release_exclusive();
            debug!(tree = self.id, page = parent.id(), sibling = psib_id, "internal split");

            current = parent;
            release_current = true;
        }
    }

    fn clear_sibling_flag(&self, sibling: &NodeRef) {
        sibling.latch.acquire_exclusive();
        sibling.inner_mut().split_sibling = false;
        sibling.latch.release_exclusive();
    }

    /// Finishes a split of the root: the root's current content moves into
    /// a fresh node, and the pinned root frame is rewritten as an internal
    /// node with two children, so external references stay valid.
    fn finish_root_split(&self, db: &Arc<DbInner>, root: &NodeRef) -> Result<()> {
        let cache = db.cache();
        let store = db.store();

        let child = cache.alloc_latched_node(&store)?;
        if let Err(err) = db.mark_dirty(self, &child) {
            cache.delete_node(&child);
            child.latch.release_exclusive();
            return Err(err);
        }

        let split = root.inner_mut().split.take().expect("root split to finish");
        let (right, sibling_id, split_key) = (split.right, split.sibling_id, split.key);

        {
            let root_inner = root.inner_mut();
            let child_inner = child.inner_mut();
            std::mem::swap(&mut root_inner.page, &mut child_inner.page);
            child_inner.kind = root_inner.kind & !KIND_REGISTRY;
            child_inner.page[0] = child_inner.kind;
            let registry_flag = root_inner.kind & KIND_REGISTRY;
            root_inner.init_internal(registry_flag);
        }
        cache.publish(child.id(), &child);

        let (left_id, right_id) = if right {
            (child.id(), sibling_id)
        } else {
            (sibling_id, child.id())
        };
        root.inner_mut()
            .internal_insert_split(0, &split_key, left_id, right_id);
        root.bump_version();
        child.latch.release_exclusive();
        debug!(tree = self.id, root = root.id(), "root split");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Merging
    // ------------------------------------------------------------------

    /// Best-effort merge after a delete left `node` underfull. Requires the
    /// parent among the retained ancestors; gives up on any contention.
    fn try_merge(&self, db: &Arc<DbInner>, held: &mut Vec<(NodeRef, usize)>, node: &NodeRef) {
        if let Err(err) = self.try_merge_inner(db, held, node) {
            // Merging is an optimization; a failure leaves a valid tree.
            debug!(tree = self.id, %err, "merge abandoned");
        }
    }

    fn try_merge_inner(
        &self,
        db: &Arc<DbInner>,
        held: &mut Vec<(NodeRef, usize)>,
        node: &NodeRef,
    ) -> Result<()> {
        let page_size = db.store().page_size();
        let mut level = held.len();
        let mut subject = node.clone();

        while level > 0 {
            let (parent, ci) = held[level - 1].clone();
            let merged = self.merge_with_sibling(db, &parent, ci, &subject, page_size)?;
            if !merged {
                return Ok(());
            }
            // The parent lost a separator; it may now be underfull itself.
            level -= 1;
            let underfull = {
                let inner = parent.inner();
                inner.entry_count() == 0 || inner.used_bytes() < page_size / 4
            };
            if !underfull {
                return Ok(());
            }
            if level == 0 {
                self.try_collapse_root(db, &parent)?;
                return Ok(());
            }
            subject = parent;
        }
        // `node` with no retained parent: either the root or a node deep
        // under released ancestors. Only the root case has work to do.
        if Arc::ptr_eq(node, &self.root) && !node.inner().is_leaf() {
            self.try_collapse_root(db, node)?;
        }
        Ok(())
    }

    /// Merges `subject` (child `ci` of the latched `parent`) with a
    /// neighbor, or rebalances entries when a full merge does not fit.
    /// Returns true when a separator was removed from the parent.
    fn merge_with_sibling(
        &self,
        db: &Arc<DbInner>,
        parent: &NodeRef,
        ci: usize,
        subject: &NodeRef,
        page_size: usize,
    ) -> Result<bool> {
        let cache = db.cache();
        let store = db.store();
        let parent_count = parent.inner().entry_count();
        if parent_count == 0 {
            return Ok(false);
        }

        let is_extremity = ci == 0 || ci == parent_count;
        let subject_empty = subject.inner().entry_count() == 0;
        let subject_light = subject.inner().used_bytes() < page_size / 4;
        // Extremity nodes merge less aggressively, to the benefit of queue
        // workloads that grow one end and shrink the other.
        if is_extremity && !subject_empty {
            return Ok(false);
        }
        if !subject_empty && !subject_light {
            return Ok(false);
        }

        let (sep_index, sib_ci) = if ci > 0 { (ci - 1, ci - 1) } else { (ci, ci + 1) };
        let sib_id = parent.inner().child_id(sib_ci);
        let sibling = cache.acquire_loaded(&store, sib_id, true)?;
        let outcome = (|| -> Result<bool> {
            if sibling.inner().split.is_some() || subject.inner().split.is_some() {
                return Ok(false);
            }
            db.mark_dirty(self, &sibling)?;
            if sibling.id() != sib_id {
                parent.inner_mut().set_child_id(sib_ci, sibling.id());
            }

            let (left, right) = if ci > 0 {
                (&sibling, subject)
            } else {
                (subject, &sibling)
            };

            let is_leaf = subject.inner().is_leaf();
            if is_leaf {
                if left.inner().fits_leaf_absorb(right.inner()) {
                    left.inner_mut().leaf_absorb_right(right.inner());
                } else {
                    self.rebalance_leaves(parent, sep_index, left, right);
                    return Ok(false);
                }
            } else {
                let sep = parent.inner().internal_key(sep_index).to_vec();
                if left.inner().fits_internal_absorb(sep.len(), right.inner()) {
                    left.inner_mut().internal_absorb_right(&sep, right.inner());
                } else {
                    return Ok(false);
                }
            }

            // The right node is empty now; drop it from the parent and the
            // store.
            parent
                .inner_mut()
                .internal_delete_separator(sep_index, left.id());
            parent.bump_version();
            left.bump_version();
            right.bump_version();
            let dead_id = right.id();
            debug_assert_ne!(dead_id, crate::node::STUB_ID);
            store.delete_page(dead_id);
            cache.delete_node(right);
            debug!(tree = self.id, page = dead_id, "node merged away");
            Ok(true)
        })();
        sibling.latch.release_exclusive();
        outcome
    }

    /// Moves entries between two latched leaves to even them out, updating
    /// the separator in the parent. Skipped when the parent cannot hold the
    /// new separator.
    fn rebalance_leaves(&self, parent: &NodeRef, sep_index: usize, left: &NodeRef, right: &NodeRef) {
        let ln = left.inner().entry_count();
        let rn = right.inner().entry_count();
        if ln.abs_diff(rn) < 2 {
            return;
        }
        let moving = ln.abs_diff(rn) / 2;
        let new_first: Vec<u8> = if ln > rn {
            left.inner().leaf_key(2 * (ln - moving) as i32).to_vec()
        } else {
            right.inner().leaf_key(2 * moving as i32).to_vec()
        };
        if !parent.inner().can_replace_separator(new_first.len()) {
            return;
        }
        if ln > rn {
            if !right.inner_mut().prepare_bulk_prepend(left.inner(), moving) {
                return;
            }
            right
                .inner_mut()
                .leaf_prepend_from_left(left.inner_mut(), moving);
        } else {
            left.inner_mut()
                .leaf_append_from_right(right.inner_mut(), moving);
        }
        left.bump_version();
        right.bump_version();
        parent
            .inner_mut()
            .internal_replace_separator(sep_index, &new_first);
        debug!(tree = self.id, "leaves rebalanced");
    }

    /// When an internal root is down to a single child, the child's content
    /// is promoted into the pinned root frame.
    fn try_collapse_root(&self, db: &Arc<DbInner>, root: &NodeRef) -> Result<()> {
        if !Arc::ptr_eq(root, &self.root)
            || root.inner().is_leaf()
            || root.inner().entry_count() > 0
        {
            return Ok(());
        }
        let cache = db.cache();
        let store = db.store();
        let child_id = root.inner().child_id(0);
        let child = cache.acquire_loaded(&store, child_id, true)?;
        let result = (|| -> Result<()> {
            if child.inner().split.is_some() {
                return Ok(());
            }
            db.mark_dirty(self, &child)?;
            {
                let root_inner = root.inner_mut();
                let child_inner = child.inner_mut();
                std::mem::swap(&mut root_inner.page, &mut child_inner.page);
                let registry_flag = root_inner.kind & KIND_REGISTRY;
                root_inner.kind = child_inner.kind | registry_flag;
                root_inner.page[0] = root_inner.kind;
                root_inner.split = None;
            }
            root.bump_version();
            child.bump_version();
            let dead_id = child.id();
            store.delete_page(dead_id);
            cache.delete_node(&child);
            debug!(tree = self.id, page = dead_id, "root collapsed into child");
            Ok(())
        })();
        child.latch.release_exclusive();
        result
    }

    // ------------------------------------------------------------------
    // Ghost reaping and recovery hooks
    // ------------------------------------------------------------------

    /// Physically removes a tombstone. Runs while the exclusive record lock
    /// is still held by the releasing owner, so nothing can observe the
    /// ghost resurrected.
    pub(crate) fn reap_ghost(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        let db = self.db()?;
        let mut bogus = Transaction::bogus(Arc::clone(&db));
        let store = db.store();
        store.commit_lock.acquire_shared();
        let result = self.store_locked(&db, &mut bogus, None, WriteOp::ReapGhost, key);
        store.commit_lock.release_shared();
        result.map(|_| ())
    }

    /// Applies a store without locks or logging. The caller holds the
    /// shared commit lock. Used by recovery replay and undo application.
    pub(crate) fn apply_raw(
        &self,
        db: &Arc<DbInner>,
        txn: &mut Transaction,
        op: WriteOp<'_>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.store_locked(db, txn, None, op, key)
    }
}

fn inner_can_hold(inner: &crate::node::NodeInner, bytes: usize) -> bool {
    inner.free_total() >= bytes + 8
}

/// Deferred tombstone reap attached to an exclusive lock at delete time.
pub(crate) struct TreeReaper {
    db: Weak<DbInner>,
    tree_id: u64,
}

impl TreeReaper {
    fn new(tree: &Tree) -> TreeReaper {
        TreeReaper {
            db: tree.db.clone(),
            tree_id: tree.id,
        }
    }
}

impl GhostReaper for TreeReaper {
    fn reap_ghost(&self, key: &[u8]) {
        let Some(db) = self.db.upgrade() else {
            return;
        };
        let tree = match db.tree_by_id(self.tree_id) {
            Ok(Some(tree)) => tree,
            _ => return,
        };
        if let Err(err) = tree.reap_ghost(key) {
            // Recovery reaps whatever this pass could not.
            warn!(tree = self.tree_id, %err, "ghost reap failed");
        }
    }
}
