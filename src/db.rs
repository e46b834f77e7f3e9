// Database: the node store.
//
// Composes the page store, node cache, lock manager, redo log, and registry
// tree, and owns the two protocols that tie them together: the dirty-color
// copy-on-write discipline (`mark_dirty`) and the checkpoint. The registry
// is itself a B+tree, index id 0, holding name→id, id→name, and id→root
// mappings plus the index id counter; the header only ever records the
// registry root, and everything else is reachable from it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Config, DurabilityMode};
use crate::error::{DbError, Result};
use crate::lock::LockManager;
use crate::node::{CachedState, Node, NodeCache, NodeRef, KIND_LEAF, KIND_REGISTRY};
use crate::storage::{CommitRecord, PageStore};
use crate::tree::{Tree, WriteOp, REGISTRY_INDEX_ID};
use crate::txn::redo::{RedoLog, RedoOp, RedoPosition, RedoReader};
use crate::txn::undo::{read_chain, read_master_undo, write_master_undo, UndoRecord};
use crate::txn::{Transaction, TxnShared};

// Registry key prefixes.
const REG_NAME: u8 = 0x00;
const REG_ROOT: u8 = 0x01;
const REG_COUNTER: u8 = 0x02;
const REG_ID_NAME: u8 = 0x03;

fn name_key(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(REG_NAME);
    key.extend_from_slice(name);
    key
}

fn root_key(id: u64) -> Vec<u8> {
    let mut key = vec![REG_ROOT];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn id_name_key(id: u64) -> Vec<u8> {
    let mut key = vec![REG_ID_NAME];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

#[derive(Debug, Default)]
pub struct CheckpointStats {
    pub checkpoints: AtomicU64,
    pub pages_written: AtomicU64,
}

pub(crate) struct DbInner {
    config: Config,
    store: Arc<PageStore>,
    cache: NodeCache,
    locks: LockManager,
    redo: OnceLock<RedoLog>,
    pub(crate) registry: Arc<Tree>,
    open_trees: Mutex<HashMap<u64, Arc<Tree>>>,
    open_names: Mutex<HashMap<Vec<u8>, u64>>,
    index_open_lock: Mutex<()>,
    /// Parity of the current commit generation; selects the dirty color.
    commit_parity: AtomicUsize,
    txn_counter: AtomicU64,
    index_counter: AtomicU64,
    active_txns: Mutex<HashMap<u64, Arc<TxnShared>>>,
    checkpoint_lock: Mutex<()>,
    prev_master_pages: Mutex<Vec<u64>>,
    closed: AtomicBool,
    broken: AtomicBool,
    pub(crate) stats: CheckpointStats,
    ckpt_signal: Mutex<bool>,
    ckpt_condvar: Condvar,
    self_weak: Weak<DbInner>,
}

impl DbInner {
    pub(crate) fn store(&self) -> Arc<PageStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn redo(&self) -> &RedoLog {
        self.redo.get().expect("redo log initialized at open")
    }

    pub(crate) fn next_txn_id(&self) -> u64 {
        self.txn_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn default_lock_timeout_nanos(&self) -> i64 {
        match self.config.lock_timeout {
            Some(d) => d.as_nanos().min(i64::MAX as u128) as i64,
            None => -1,
        }
    }

    pub(crate) fn default_durability(&self) -> DurabilityMode {
        self.config.durability_mode
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::DatabaseClosed);
        }
        if self.broken.load(Ordering::Acquire) {
            return Err(DbError::CorruptPageStore(
                "database is in broken read-only mode".into(),
            ));
        }
        Ok(())
    }

    fn arc(&self) -> Result<Arc<DbInner>> {
        self.self_weak.upgrade().ok_or(DbError::DatabaseClosed)
    }

    pub(crate) fn register_txn(&self, txn_id: u64, shared: Arc<TxnShared>) {
        self.active_txns.lock().insert(txn_id, shared);
    }

    pub(crate) fn unregister_txn(&self, txn_id: u64) {
        self.active_txns.lock().remove(&txn_id);
    }

    // ------------------------------------------------------------------
    // Dirty-color protocol
    // ------------------------------------------------------------------

    /// Schedules a node for the current commit generation. The caller holds
    /// the node latch exclusive and the shared commit lock.
    ///
    /// If the node is already in the current color there is nothing to do.
    /// Otherwise a new page id is reserved; a node still dirty in the other
    /// color first has its bytes written under the old id, preserving the
    /// image the in-flight checkpoint references. The old id is released
    /// (becoming reusable only after the checkpoint for its generation
    /// commits), and a named tree whose root moved gets its registry root
    /// pointer updated.
    pub(crate) fn mark_dirty(&self, tree: &Tree, node: &NodeRef) -> Result<bool> {
        let current = CachedState::for_parity(self.commit_parity.load(Ordering::Acquire));
        let inner = node.inner_mut();
        if inner.state == current {
            return Ok(false);
        }
        let old_id = node.id();
        let new_id = self.store.reserve_page()?;
        if inner.state.is_dirty() && old_id != 0 {
            self.store.write_page(old_id, &inner.page)?;
        }
        if old_id != 0 {
            self.store.delete_page(old_id);
        }
        node.set_id(new_id);
        inner.state = current;
        self.cache.rekey(old_id, new_id, node);

        if tree.id() != REGISTRY_INDEX_ID && Arc::ptr_eq(node, &tree.root) {
            self.registry_put_root(tree.id(), new_id)?;
        }
        Ok(true)
    }

    /// Structural registry update: the root pointer of a named tree. Not
    /// transactional; the pointer tracks page identity, not data, and
    /// recovery derives post-checkpoint movement by replaying redo.
    fn registry_put_root(&self, id: u64, root_id: u64) -> Result<()> {
        let me = self.arc()?;
        let mut bogus = Transaction::bogus(Arc::clone(&me));
        self.registry
            .store_locked(
                &me,
                &mut bogus,
                None,
                WriteOp::Store(Some(&root_id.to_be_bytes())),
                &root_key(id),
            )
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Tree management
    // ------------------------------------------------------------------

    pub(crate) fn tree_by_id(&self, id: u64) -> Result<Option<Arc<Tree>>> {
        if id == REGISTRY_INDEX_ID {
            return Ok(Some(Arc::clone(&self.registry)));
        }
        if let Some(tree) = self.open_trees.lock().get(&id) {
            return Ok(Some(Arc::clone(tree)));
        }
        let me = self.arc()?;
        let mut bogus = Transaction::bogus(Arc::clone(&me));
        let Some(name) = self.registry.load(Some(&mut bogus), &id_name_key(id))? else {
            return Ok(None);
        };
        let tree = self.materialize_tree(&me, id, name.into_boxed_slice())?;
        Ok(Some(tree))
    }

    /// Builds the pinned root and tree handle for a registered index id.
    /// A missing root pointer means the index was created after the last
    /// checkpoint and is being replayed; it starts from an empty root.
    fn materialize_tree(&self, me: &Arc<DbInner>, id: u64, name: Box<[u8]>) -> Result<Arc<Tree>> {
        let mut bogus = Transaction::bogus(Arc::clone(me));
        let root_ptr = self.registry.load(Some(&mut bogus), &root_key(id))?;
        let root_ptr_was_none = root_ptr.is_none();

        let root = Arc::new(Node::new(
            self.config.page_size,
            self.config.direct_page_access,
        ));
        root.latch.acquire_exclusive();
        match root_ptr {
            Some(bytes) if bytes.len() == 8 => {
                let root_id = u64::from_be_bytes(bytes[..8].try_into().unwrap());
                self.store.read_page(root_id, &mut root.inner_mut().page)?;
                root.inner_mut().sync_kind_from_page();
                root.inner_mut().state = CachedState::Clean;
                root.set_id(root_id);
                let kind = root.inner().kind;
                if kind & (crate::node::KIND_INTERNAL | KIND_LEAF) == 0 {
                    root.latch.release_exclusive();
                    return Err(DbError::CorruptPageStore(format!(
                        "unknown node kind {kind:#x} at index {id} root"
                    )));
                }
            }
            Some(_) => {
                root.latch.release_exclusive();
                return Err(DbError::CorruptPageStore(format!(
                    "malformed root pointer for index {id}"
                )));
            }
            None => {
                root.inner_mut().init_leaf(0);
            }
        }
        root.latch.release_exclusive();

        let tree = Tree::new(self.self_weak.clone(), id, name.clone(), root);
        if root_ptr_was_none {
            // Assign a page id and record the pointer.
            self.store.commit_lock.acquire_shared();
            tree.root.latch.acquire_exclusive();
            let result = self.mark_dirty(&tree, &tree.root);
            tree.root.latch.release_exclusive();
            self.store.commit_lock.release_shared();
            result?;
        }

        self.open_trees.lock().insert(id, Arc::clone(&tree));
        self.open_names.lock().insert(name.to_vec(), id);
        Ok(tree)
    }

    fn open_index_inner(&self, name: &[u8]) -> Result<Arc<Tree>> {
        if name.is_empty() || name.len() > 4096 {
            return Err(DbError::IllegalArgument("invalid index name".into()));
        }
        let _guard = self.index_open_lock.lock();

        if let Some(id) = self.open_names.lock().get(name) {
            if let Some(tree) = self.open_trees.lock().get(id) {
                return Ok(Arc::clone(tree));
            }
        }

        let me = self.arc()?;
        let mut bogus = Transaction::bogus(Arc::clone(&me));
        if let Some(bytes) = self.registry.load(Some(&mut bogus), &name_key(name))? {
            if bytes.len() != 8 {
                return Err(DbError::CorruptPageStore(
                    "malformed registry name entry".into(),
                ));
            }
            let id = u64::from_be_bytes(bytes[..8].try_into().unwrap());
            return self.materialize_tree(&me, id, name.into());
        }

        // Create: the name, reverse name, and counter entries are written
        // under a redo-logged transaction so replay can recreate the index.
        let id = self.index_counter.fetch_add(1, Ordering::Relaxed);
        let mut txn = Transaction::new(Arc::clone(&me), self.config.durability_mode);
        self.registry
            .store(Some(&mut txn), &name_key(name), Some(&id.to_be_bytes()))?;
        self.registry
            .store(Some(&mut txn), &id_name_key(id), Some(name))?;
        self.registry.store(
            Some(&mut txn),
            &[REG_COUNTER],
            Some(&(id + 1).to_be_bytes()),
        )?;
        txn.commit()?;

        let tree = self.materialize_tree(&me, id, name.into())?;
        info!(index = id, "index created");
        Ok(tree)
    }

    // ------------------------------------------------------------------
    // Undo application
    // ------------------------------------------------------------------

    /// Applies one undo action. Takes the shared commit lock itself; undo
    /// application is idempotent.
    pub(crate) fn apply_undo(&self, record: &UndoRecord) -> Result<()> {
        let me = self.arc()?;
        let (index_id, key, op): (u64, &[u8], WriteOp<'_>) = match record {
            UndoRecord::Uninsert { index_id, key } => (*index_id, key, WriteOp::PhysicalDelete),
            UndoRecord::Unupdate {
                index_id,
                key,
                value,
            }
            | UndoRecord::Undelete {
                index_id,
                key,
                value,
            } => (*index_id, key, WriteOp::Store(Some(value))),
        };
        let Some(tree) = self.tree_by_id(index_id)? else {
            warn!(index = index_id, "undo for an unknown index ignored");
            return Ok(());
        };
        let mut bogus = Transaction::bogus(me.clone());
        self.store.commit_lock.acquire_shared();
        let result = tree.apply_raw(&me, &mut bogus, op, key);
        self.store.commit_lock.release_shared();
        result.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    /// Converts the current dirty color into a durable, consistent
    /// snapshot. Running it twice without intervening mutation performs no
    /// I/O the second time.
    pub(crate) fn checkpoint(&self) -> Result<()> {
        let _only_one = self.checkpoint_lock.lock();
        let started = Instant::now();

        self.store.commit_lock.acquire_exclusive();

        self.registry.root.latch.acquire_shared();
        let clean = self.registry.root.inner().state == CachedState::Clean;
        let root_id = self.registry.root.id();
        self.registry.root.latch.release_shared();
        if clean {
            // Every mutation cascades a dirty registry root; a clean root
            // means there is nothing to flush.
            self.store.commit_lock.release_exclusive();
            return Ok(());
        }

        let flip = (|| -> Result<(RedoPosition, usize, u64, Vec<u64>)> {
            let redo_pos = self.redo().checkpoint_position()?;
            self.redo().append(&RedoOp::CheckpointMark { root_id });
            let old_parity = self.commit_parity.fetch_xor(1, Ordering::AcqRel);
            self.store.flip_generation();

            let mut anchors = Vec::new();
            {
                let txns = self.active_txns.lock();
                for (id, shared) in txns.iter() {
                    if let Some(top) = shared.undo.lock().checkpoint_anchor()? {
                        anchors.push((*id, top));
                    }
                }
            }
            let (master, master_pages) = write_master_undo(&self.store, &anchors)?;
            Ok((redo_pos, old_parity, master, master_pages))
        })();
        self.store.commit_lock.release_exclusive();
        let (redo_pos, old_parity, master, master_pages) = match flip {
            Ok(v) => v,
            Err(err) => {
                // The color may already have flipped; the on-disk state is
                // still consistent, but the in-memory protocol is not.
                self.broken.store(true, Ordering::Release);
                return Err(err);
            }
        };

        // Gather everything still dirty in the old color. Resident frames
        // plus the pinned roots cover the set; a dirty node whose ancestors
        // were evicted is unreachable by a tree walk but not by this one.
        let old_color = CachedState::for_parity(old_parity);
        let mut nodes = self.cache.resident_nodes();
        nodes.push(self.registry.root.clone());
        {
            let trees = self.open_trees.lock();
            for tree in trees.values() {
                nodes.push(tree.root.clone());
            }
        }
        nodes.sort_by_key(|n| n.id());

        let mut written = 0u64;
        for node in nodes {
            node.latch.acquire_exclusive();
            if node.id() != 0 && node.inner().state == old_color {
                node.inner_mut().state = CachedState::Clean;
                // Keep a shared hold across the write so nobody re-dirties
                // the bytes mid-flight.
                node.latch.downgrade();
                let result = self.store.write_page(node.id(), &node.inner().page);
                node.latch.release_shared();
                if let Err(err) = result {
                    self.broken.store(true, Ordering::Release);
                    return Err(err);
                }
                written += 1;
            } else {
                node.latch.release_exclusive();
            }
        }

        self.redo().flush()?;
        self.store.commit(CommitRecord {
            registry_root_id: root_id,
            redo_page: redo_pos.page,
            redo_off: redo_pos.off,
            redo_pos: redo_pos.position,
            master_undo_page: master,
        })?;
        self.redo().trim_before(redo_pos.page);

        let old_masters = std::mem::replace(&mut *self.prev_master_pages.lock(), master_pages);
        for page in old_masters {
            self.store.delete_page(page);
        }

        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.stats.pages_written.fetch_add(written, Ordering::Relaxed);
        info!(
            pages = written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint complete"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn recover(&self, record: CommitRecord) -> Result<()> {
        let me = self.arc()?;

        #[derive(Default)]
        struct RecTxn {
            records: Vec<UndoRecord>,
            pages: Vec<u64>,
            scopes: Vec<usize>,
            ghosts: Vec<(u64, Vec<u8>)>,
        }

        let (anchors, master_pages) = read_master_undo(&self.store, record.master_undo_page)?;
        *self.prev_master_pages.lock() = master_pages;
        let mut txns: HashMap<u64, RecTxn> = HashMap::new();
        let mut max_txn_id = 0u64;
        for (txn_id, top) in anchors {
            max_txn_id = max_txn_id.max(txn_id);
            let (records, pages) = read_chain(&self.store, top)?;
            txns.insert(
                txn_id,
                RecTxn {
                    records,
                    pages,
                    ..Default::default()
                },
            );
        }

        let mut reader = RedoReader::new(
            &self.store,
            RedoPosition {
                page: record.redo_page,
                off: record.redo_off,
                position: record.redo_pos,
            },
        )?;

        let mut replayed = 0u64;

        let rollback = |db: &DbInner, records: &[UndoRecord]| -> Result<()> {
            for record in records.iter().rev() {
                db.apply_undo(record)?;
            }
            Ok(())
        };

        while let Some(op) = reader.next()? {
            match op {
                RedoOp::CheckpointMark {
                    root_id: marked_root,
                } => {
                    if marked_root != record.registry_root_id {
                        warn!(
                            marked_root,
                            header_root = record.registry_root_id,
                            "checkpoint mark disagrees with header"
                        );
                    }
                }
                RedoOp::Store {
                    txn_id,
                    index_id,
                    key,
                    value,
                } => {
                    max_txn_id = max_txn_id.max(txn_id);
                    let Some(tree) = self.tree_by_id(index_id)? else {
                        warn!(index = index_id, "replayed store for unknown index");
                        continue;
                    };
                    let mut replay_txn = Transaction::bogus(Arc::clone(&me));
                    self.store.commit_lock.acquire_shared();
                    let prior = tree.apply_raw(
                        &me,
                        &mut replay_txn,
                        WriteOp::Store(value.as_deref()),
                        &key,
                    );
                    self.store.commit_lock.release_shared();
                    let prior = prior?;

                    let entry = txns.entry(txn_id).or_default();
                    match (&value, prior) {
                        (Some(_), Some(old)) => entry.records.push(UndoRecord::Unupdate {
                            index_id,
                            key,
                            value: old,
                        }),
                        (Some(_), None) => entry
                            .records
                            .push(UndoRecord::Uninsert { index_id, key }),
                        (None, Some(old)) => {
                            entry.ghosts.push((index_id, key.clone()));
                            entry.records.push(UndoRecord::Undelete {
                                index_id,
                                key,
                                value: old,
                            });
                        }
                        (None, None) => {}
                    }
                    replayed += 1;
                }
                RedoOp::Commit { txn_id } => {
                    max_txn_id = max_txn_id.max(txn_id);
                    if let Some(entry) = txns.remove(&txn_id) {
                        for (index_id, key) in entry.ghosts {
                            if let Some(tree) = self.tree_by_id(index_id)? {
                                let mut reap_txn = Transaction::bogus(Arc::clone(&me));
                                self.store.commit_lock.acquire_shared();
                                let result =
                                    tree.apply_raw(&me, &mut reap_txn, WriteOp::ReapGhost, &key);
                                self.store.commit_lock.release_shared();
                                result?;
                            }
                        }
                        for page in entry.pages {
                            self.store.delete_page(page);
                        }
                    }
                }
                RedoOp::Rollback { txn_id } => {
                    max_txn_id = max_txn_id.max(txn_id);
                    if let Some(entry) = txns.remove(&txn_id) {
                        rollback(self, &entry.records)?;
                        for page in entry.pages {
                            self.store.delete_page(page);
                        }
                        replayed += 1;
                    }
                }
                RedoOp::Enter { txn_id } => {
                    let entry = txns.entry(txn_id).or_default();
                    let mark = entry.records.len();
                    entry.scopes.push(mark);
                }
                RedoOp::Exit { txn_id } => {
                    let undone = txns.get_mut(&txn_id).map(|entry| {
                        let mark = entry.scopes.pop().unwrap_or(0);
                        let records: Vec<UndoRecord> = entry.records.split_off(mark);
                        (records, entry.scopes.is_empty() && mark == 0)
                    });
                    if let Some((records, outermost)) = undone {
                        rollback(self, &records)?;
                        if outermost {
                            if let Some(entry) = txns.remove(&txn_id) {
                                for page in entry.pages {
                                    self.store.delete_page(page);
                                }
                            }
                        }
                        replayed += 1;
                    }
                }
                RedoOp::Custom { handler_id, .. } => {
                    debug!(handler_id, "custom redo record ignored");
                }
            }
        }

        // Transactions with no commit in the durable redo roll back.
        let pending = txns.len();
        for (txn_id, entry) in txns.drain() {
            debug!(txn = txn_id, "rolling back unfinished transaction");
            if let Err(err) = rollback(self, &entry.records) {
                // Quarantine: this transaction's state is suspect, but the
                // rest of the recovery proceeds.
                warn!(txn = txn_id, %err, "rollback failed during recovery");
            }
            for page in entry.pages {
                self.store.delete_page(page);
            }
        }

        self.txn_counter
            .store(max_txn_id.max(1) + 1, Ordering::Relaxed);

        // The counter entry only reflects replayed creations now that the
        // registry has settled.
        let mut bogus = Transaction::bogus(Arc::clone(&me));
        if let Some(bytes) = self.registry.load(Some(&mut bogus), &[REG_COUNTER])? {
            if bytes.len() == 8 {
                self.index_counter.store(
                    u64::from_be_bytes(bytes[..8].try_into().unwrap()),
                    Ordering::Relaxed,
                );
            }
        }

        let (page, off, position, chain) = reader.finish();
        let redo = RedoLog::recovered(Arc::clone(&self.store), page, off, position, chain);
        let _ = self.redo.set(redo);

        info!(replayed, pending, "recovery complete");
        if replayed > 0 || pending > 0 {
            // Consolidate so redo and undo space is reclaimed promptly.
            self.checkpoint()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Wake the checkpointer so it can exit.
        {
            let mut stop = self.ckpt_signal.lock();
            *stop = true;
            self.ckpt_condvar.notify_all();
        }
        self.locks.close();
        let result = if self.broken.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.checkpoint()
        };
        {
            let trees = self.open_trees.lock();
            for tree in trees.values() {
                tree.mark_closed();
            }
        }
        self.registry.mark_closed();
        info!("database closed");
        result
    }
}

/// An embedded, transactional, ordered key/value database.
pub struct Database {
    inner: Arc<DbInner>,
    checkpointer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Database {
    /// Opens (creating or recovering) the database described by `config`.
    pub fn open(config: Config) -> Result<Database> {
        config.validate()?;
        let (store, recovered) = PageStore::open(&config)?;
        let store = Arc::new(store);

        // Pinned registry root: loaded from the header's root id, or a
        // fresh empty leaf for a new database.
        let registry_root_id = recovered.map(|r| r.registry_root_id).unwrap_or(0);
        let root = Arc::new(Node::new(config.page_size, config.direct_page_access));
        root.latch.acquire_exclusive();
        if registry_root_id != 0 {
            store.read_page(registry_root_id, &mut root.inner_mut().page)?;
            root.inner_mut().sync_kind_from_page();
            root.inner_mut().state = CachedState::Clean;
            root.set_id(registry_root_id);
            let kind = root.inner().kind;
            if kind & KIND_REGISTRY == 0 {
                root.latch.release_exclusive();
                return Err(DbError::CorruptPageStore(format!(
                    "registry root has kind {kind:#x}"
                )));
            }
        } else {
            root.inner_mut().init_leaf(KIND_REGISTRY);
        }
        root.latch.release_exclusive();

        let cache = NodeCache::new(&config);
        let inner = Arc::new_cyclic(|weak: &Weak<DbInner>| DbInner {
            registry: Tree::new(weak.clone(), REGISTRY_INDEX_ID, Box::from(&b""[..]), root),
            config: config.clone(),
            store: Arc::clone(&store),
            cache,
            locks: LockManager::new(),
            redo: OnceLock::new(),
            open_trees: Mutex::new(HashMap::new()),
            open_names: Mutex::new(HashMap::new()),
            index_open_lock: Mutex::new(()),
            commit_parity: AtomicUsize::new(0),
            txn_counter: AtomicU64::new(1),
            index_counter: AtomicU64::new(1),
            active_txns: Mutex::new(HashMap::new()),
            checkpoint_lock: Mutex::new(()),
            prev_master_pages: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            stats: CheckpointStats::default(),
            ckpt_signal: Mutex::new(false),
            ckpt_condvar: Condvar::new(),
            self_weak: weak.clone(),
        });

        match recovered {
            // A redo page of 0 means no header commit ever referenced a
            // redo chain; there is nothing durable to replay.
            Some(record) if record.redo_page != 0 => {
                info!("recovering database");
                inner.recover(record)?;
            }
            _ => {
                let redo = RedoLog::create(Arc::clone(&store))?;
                let start = redo.checkpoint_position()?;
                let _ = inner.redo.set(redo);
                // Anchor the empty redo chain in a durable header, so a
                // commit that syncs before the first checkpoint is
                // recoverable.
                store.commit(CommitRecord {
                    registry_root_id: 0,
                    redo_page: start.page,
                    redo_off: start.off,
                    redo_pos: start.position,
                    master_undo_page: 0,
                })?;
                info!("database ready");
            }
        }

        let checkpointer = config.checkpoint_rate.map(|rate| {
            let db = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("tupelo-checkpointer".into())
                .spawn(move || loop {
                    {
                        let mut stop = db.ckpt_signal.lock();
                        if *stop {
                            return;
                        }
                        db.ckpt_condvar.wait_for(&mut stop, rate);
                        if *stop {
                            return;
                        }
                    }
                    if let Err(err) = db.checkpoint() {
                        warn!(%err, "periodic checkpoint failed");
                        if err.is_fatal() {
                            return;
                        }
                    }
                })
                .expect("spawn checkpointer")
        });

        Ok(Database {
            inner,
            checkpointer: Mutex::new(checkpointer),
        })
    }

    /// Opens an index by name, creating it on first use.
    pub fn open_index(&self, name: &[u8]) -> Result<Arc<Tree>> {
        self.inner.check_open()?;
        self.inner.open_index_inner(name)
    }

    /// Opens an index by name without creating it.
    pub fn find_index(&self, name: &[u8]) -> Result<Option<Arc<Tree>>> {
        self.inner.check_open()?;
        let me = self.inner.arc()?;
        let mut bogus = Transaction::bogus(me);
        match self.inner.registry.load(Some(&mut bogus), &name_key(name))? {
            Some(bytes) if bytes.len() == 8 => {
                let id = u64::from_be_bytes(bytes[..8].try_into().unwrap());
                self.inner.tree_by_id(id)
            }
            Some(_) => Err(DbError::CorruptPageStore(
                "malformed registry name entry".into(),
            )),
            None => Ok(None),
        }
    }

    /// Begins a transaction with the configured durability mode.
    pub fn begin_transaction(&self) -> Result<Transaction> {
        self.inner.check_open()?;
        Ok(Transaction::new(
            Arc::clone(&self.inner),
            self.inner.config.durability_mode,
        ))
    }

    /// Begins a transaction with an explicit durability mode.
    pub fn begin_transaction_with(&self, mode: DurabilityMode) -> Result<Transaction> {
        self.inner.check_open()?;
        if mode == DurabilityMode::NoRedo {
            return Err(DbError::IllegalArgument(
                "NoRedo transactions are internal".into(),
            ));
        }
        Ok(Transaction::new(Arc::clone(&self.inner), mode))
    }

    /// Runs a manual checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.checkpoint()
    }

    /// Flushes the redo log to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.redo().flush()?;
        self.inner.store.sync()
    }

    /// Checkpoints, interrupts waiters, and shuts the database down.
    pub fn close(&self) -> Result<()> {
        let result = self.inner.close();
        if let Some(handle) = self.checkpointer.lock().take() {
            let _ = handle.join();
        }
        result
    }

    /// Shuts down without flushing or checkpointing, leaving the durable
    /// state exactly as a process kill would. Crash-recovery test support.
    #[doc(hidden)]
    pub fn close_abruptly(&self) {
        self.inner.broken.store(true, Ordering::Release);
        let _ = self.close();
    }

    pub fn checkpoint_stats(&self) -> &CheckpointStats {
        &self.inner.stats
    }

    pub fn cache_stats(&self) -> &crate::node::CacheStats {
        &self.inner.cache.stats
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "close on drop failed");
        }
    }
}
