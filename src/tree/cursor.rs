// Cursors.
//
// A cursor keeps one frame per tree level, root to leaf. Frames hold plain
// node references, not latches; each operation latches the top frame,
// revalidates it against the node's version counter, and falls back to a
// fresh descent keyed by the cursor's current key when the node changed
// underneath it. A frame that observes a split descriptor with a matching
// version is rebound to the correct half by the split fix-up rules instead,
// and searches against a split leaf go through a combined coordinate space
// that presents the illusion of the un-split node.
//
// Positions step by 2. Non-negative means an exact binding; a negative
// value is the bitwise complement of the insertion position, and such
// frames carry a copy of the key that was not found.

use std::sync::Arc;

use crate::db::DbInner;
use crate::error::{DbError, Result};
use crate::node::{NodeInner, NodeRef, Split};
use crate::tree::Tree;

struct Frame {
    node: NodeRef,
    version: u64,
    pos: i32,
    not_found_key: Option<Vec<u8>>,
}

pub struct Cursor {
    tree: Arc<Tree>,
    frames: Vec<Frame>,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

impl Cursor {
    pub fn new(tree: Arc<Tree>) -> Cursor {
        Cursor {
            tree,
            frames: Vec::new(),
            key: None,
            value: None,
        }
    }

    /// Key the cursor is positioned at.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Value at the cursor's key; `None` when absent or ghosted.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.key = None;
        self.value = None;
    }

    fn db(&self) -> Result<Arc<DbInner>> {
        self.tree.check_open()?;
        self.tree.db.upgrade().ok_or(DbError::DatabaseClosed)
    }

    /// Positions at `key` exactly. Returns true when a live value is there.
    pub fn find(&mut self, key: &[u8]) -> Result<bool> {
        let db = self.db()?;
        self.descend(&db, key)?;
        Ok(self.value.is_some())
    }

    /// Positions at the first live entry with a key ≥ `key`.
    pub fn find_ge(&mut self, key: &[u8]) -> Result<bool> {
        let db = self.db()?;
        self.descend(&db, key)?;
        self.advance(&db, true, true)
    }

    /// Positions at the first live entry with a key > `key`.
    pub fn find_gt(&mut self, key: &[u8]) -> Result<bool> {
        let db = self.db()?;
        self.descend(&db, key)?;
        self.advance(&db, true, false)
    }

    /// Positions at the last live entry with a key ≤ `key`.
    pub fn find_le(&mut self, key: &[u8]) -> Result<bool> {
        let db = self.db()?;
        self.descend(&db, key)?;
        self.advance(&db, false, true)
    }

    /// Positions at the last live entry with a key < `key`.
    pub fn find_lt(&mut self, key: &[u8]) -> Result<bool> {
        let db = self.db()?;
        self.descend(&db, key)?;
        self.advance(&db, false, false)
    }

    /// Like `find`, but reuses the current leaf when the key falls inside
    /// its bounds, skipping the root descent for clustered access.
    pub fn find_nearby(&mut self, key: &[u8]) -> Result<bool> {
        let db = self.db()?;
        let nearby = match self.frames.last() {
            Some(top) => {
                let node = top.node.clone();
                node.latch.acquire_shared();
                let usable = node.version() == top.version
                    && node.inner().is_leaf()
                    && node.inner().split.is_none()
                    && node.inner().entry_count() > 0;
                let result = if usable {
                    let inner = node.inner();
                    let high = inner.highest_leaf_pos();
                    if key >= inner.leaf_key(0) && key <= inner.leaf_key(high) {
                        let pos = inner.binary_search_leaf(key);
                        let value = if pos >= 0 {
                            inner.leaf_value(pos).map(|v| v.to_vec())
                        } else {
                            None
                        };
                        Some((pos, value))
                    } else {
                        None
                    }
                } else {
                    None
                };
                node.latch.release_shared();
                result
            }
            None => None,
        };

        if let Some((pos, value)) = nearby {
            let top = self.frames.last_mut().unwrap();
            top.pos = pos;
            top.not_found_key = (pos < 0).then(|| key.to_vec());
            self.key = Some(key.to_vec());
            let found = value.is_some();
            self.value = value;
            return Ok(found);
        }
        self.descend(&db, key)?;
        Ok(self.value.is_some())
    }

    pub fn first(&mut self) -> Result<bool> {
        let db = self.db()?;
        self.descend_edge(&db, true)?;
        self.advance(&db, true, true)
    }

    pub fn last(&mut self) -> Result<bool> {
        let db = self.db()?;
        self.descend_edge(&db, false)?;
        self.advance(&db, false, true)
    }

    /// Moves to the next live entry in ascending key order.
    pub fn next(&mut self) -> Result<bool> {
        let db = self.db()?;
        if self.frames.is_empty() {
            return Err(DbError::IllegalState("cursor is not positioned".into()));
        }
        self.advance(&db, true, false)
    }

    /// Moves to the previous live entry.
    pub fn previous(&mut self) -> Result<bool> {
        let db = self.db()?;
        if self.frames.is_empty() {
            return Err(DbError::IllegalState("cursor is not positioned".into()));
        }
        self.advance(&db, false, false)
    }

    // ------------------------------------------------------------------

    /// Builds frames root to leaf for `key` with shared coupled latching.
    fn descend(&mut self, db: &Arc<DbInner>, key: &[u8]) -> Result<()> {
        self.frames.clear();
        let store = db.store();
        let cache = db.cache();
        let mut node = self.tree.root.clone();
        node.latch.acquire_shared();
        loop {
            let is_leaf = node.inner().is_leaf();
            if !is_leaf && node.inner().split.is_some() {
                node = self.tree.select_node(db, node, key, false)?;
            }
            if node.inner().is_leaf() {
                let (bound, pos, value) = self.search_leaf(db, node, key)?;
                self.key = Some(key.to_vec());
                let version = bound.version();
                self.value = value;
                self.frames.push(Frame {
                    node: bound.clone(),
                    version,
                    pos,
                    not_found_key: (pos < 0).then(|| key.to_vec()),
                });
                bound.latch.release_shared();
                return Ok(());
            }
            let inner = node.inner();
            let version = node.version();
            let ci = inner.internal_search(key);
            let child_id = inner.child_id(ci);
            self.frames.push(Frame {
                node: node.clone(),
                version,
                pos: 2 * ci as i32,
                not_found_key: None,
            });
            let child = match cache.acquire_loaded(&store, child_id, false) {
                Ok(child) => child,
                Err(err) => {
                    node.latch.release_shared();
                    self.frames.clear();
                    return Err(err);
                }
            };
            node.latch.release_shared();
            node = child;
        }
    }

    /// Searches a latched leaf for `key`, seeing through an attached split:
    /// the search runs in the combined coordinate space and the result is
    /// mapped onto the half the frame binds to. Returns the bound half
    /// (latched shared), the local position, and the value.
    fn search_leaf(
        &self,
        db: &Arc<DbInner>,
        node: NodeRef,
        key: &[u8],
    ) -> Result<(NodeRef, i32, Option<Vec<u8>>)> {
        if node.inner().split.is_none() {
            let pos = node.inner().binary_search_leaf(key);
            let value = if pos >= 0 {
                node.inner().leaf_value(pos).map(|v| v.to_vec())
            } else {
                None
            };
            return Ok((node, pos, value));
        }

        let sibling = latch_split_sibling(db, &node, false)?;
        let (to_sibling, local_pos) = {
            let inner = node.inner();
            let split = inner.split.as_ref().unwrap();
            let combined = binary_search_leaf_split(inner, split, sibling.inner(), key);
            decide_rebind(inner, split, sibling.inner(), combined, Some(key))
                .expect("a key copy is always supplied here")
        };
        let bound = if to_sibling {
            node.latch.release_shared();
            sibling
        } else {
            sibling.latch.release_shared();
            node
        };
        let value = if local_pos >= 0 {
            bound.inner().leaf_value(local_pos).map(|v| v.to_vec())
        } else {
            None
        };
        Ok((bound, local_pos, value))
    }

    /// Builds frames along the leftmost (or rightmost) edge.
    fn descend_edge(&mut self, db: &Arc<DbInner>, forward: bool) -> Result<()> {
        self.frames.clear();
        self.key = None;
        self.value = None;
        let store = db.store();
        let cache = db.cache();
        let mut node = self.tree.root.clone();
        node.latch.acquire_shared();
        loop {
            if node.inner().split.is_some() {
                node = self.edge_half(db, node, forward)?;
            }
            let version = node.version();
            let inner = node.inner();
            if inner.is_leaf() {
                // Park just off the edge; advance() steps onto the entry.
                let pos = if forward {
                    !0
                } else {
                    !(inner.highest_leaf_pos() + 2)
                };
                self.frames.push(Frame {
                    node: node.clone(),
                    version,
                    pos,
                    not_found_key: None,
                });
                node.latch.release_shared();
                return Ok(());
            }
            let ci = if forward { 0 } else { inner.entry_count() };
            self.frames.push(Frame {
                node: node.clone(),
                version,
                pos: 2 * ci as i32,
                not_found_key: None,
            });
            let child_id = inner.child_id(ci);
            let child = match cache.acquire_loaded(&store, child_id, false) {
                Ok(child) => child,
                Err(err) => {
                    node.latch.release_shared();
                    self.frames.clear();
                    return Err(err);
                }
            };
            node.latch.release_shared();
            node = child;
        }
    }

    /// Chooses the edge half of a split node, releasing the other. The left
    /// half is selected by probing with a strict prefix of the split key,
    /// which orders below it; the right half by the split key itself.
    fn edge_half(&self, db: &Arc<DbInner>, node: NodeRef, forward: bool) -> Result<NodeRef> {
        let probe: Vec<u8> = {
            let split = node.inner().split.as_ref().expect("edge of a split node");
            if forward {
                let mut k = split.key.to_vec();
                k.pop();
                k
            } else {
                split.key.to_vec()
            }
        };
        self.tree.select_node(db, node, &probe, false)
    }

    /// Advances from the top frame to the nearest live entry. `inclusive`
    /// admits the currently bound position itself.
    fn advance(&mut self, db: &Arc<DbInner>, forward: bool, inclusive: bool) -> Result<bool> {
        let Some((node, version, pos)) = self
            .frames
            .last()
            .map(|f| (f.node.clone(), f.version, f.pos))
        else {
            return Ok(false);
        };

        node.latch.acquire_shared();
        if node.version() != version || !node.inner().is_leaf() {
            node.latch.release_shared();
            return self.refind(db, forward, inclusive);
        }
        let (node, pos) = if node.inner().split.is_some() {
            let not_found = self.frames.last().and_then(|f| f.not_found_key.clone());
            match rebind_frame(db, pos, not_found.as_deref(), node)? {
                Some((bound, new_pos)) => {
                    let top = self.frames.last_mut().unwrap();
                    top.node = bound.clone();
                    top.version = bound.version();
                    top.pos = new_pos;
                    (bound, new_pos)
                }
                None => return self.refind(db, forward, inclusive),
            }
        } else {
            (node, pos)
        };

        let start = if pos >= 0 {
            if inclusive {
                pos
            } else if forward {
                pos + 2
            } else {
                pos - 2
            }
        } else {
            let ins = !pos;
            if forward {
                ins
            } else {
                ins - 2
            }
        };

        if let Some(found) = scan_leaf(&node, start, forward) {
            let inner = node.inner();
            self.key = Some(inner.leaf_key(found).to_vec());
            self.value = inner.leaf_value(found).map(|v| v.to_vec());
            let new_version = node.version();
            node.latch.release_shared();
            let top = self.frames.last_mut().unwrap();
            top.pos = found;
            top.not_found_key = None;
            top.version = new_version;
            return Ok(true);
        }
        node.latch.release_shared();
        self.climb(db, forward)
    }

    /// Exhausted the leaf: walk up until a parent has a further child, then
    /// follow the matching edge down to the next leaf.
    fn climb(&mut self, db: &Arc<DbInner>, forward: bool) -> Result<bool> {
        let store = db.store();
        let cache = db.cache();
        self.frames.pop();
        'up: loop {
            let Some((node, version, pos)) = self
                .frames
                .last()
                .map(|f| (f.node.clone(), f.version, f.pos))
            else {
                // Ran off the end of the tree.
                self.reset();
                return Ok(false);
            };

            node.latch.acquire_shared();
            let stale = node.version() != version
                || node.inner().is_leaf()
                || node.inner().split.is_some();
            if stale {
                node.latch.release_shared();
                return self.refind(db, forward, false);
            }
            let high = node.inner().highest_internal_pos();
            let next = pos + if forward { 2 } else { -2 };
            if next < 0 || next > high {
                node.latch.release_shared();
                self.frames.pop();
                continue 'up;
            }
            {
                let top = self.frames.last_mut().unwrap();
                top.pos = next;
            }

            // Descend the matching edge to the adjacent leaf.
            let mut child_id = node.inner().child_id((next / 2) as usize);
            let mut parent = node;
            loop {
                let child = match cache.acquire_loaded(&store, child_id, false) {
                    Ok(child) => child,
                    Err(err) => {
                        parent.latch.release_shared();
                        self.reset();
                        return Err(err);
                    }
                };
                parent.latch.release_shared();
                if child.inner().split.is_some() {
                    child.latch.release_shared();
                    return self.refind(db, forward, false);
                }
                let version = child.version();
                if child.inner().is_leaf() {
                    let high = child.inner().highest_leaf_pos();
                    self.frames.push(Frame {
                        node: child.clone(),
                        version,
                        pos: if forward { !0 } else { !(high + 2) },
                        not_found_key: None,
                    });
                    let start = if forward { 0 } else { high };
                    if let Some(found) = scan_leaf(&child, start, forward) {
                        let inner = child.inner();
                        self.key = Some(inner.leaf_key(found).to_vec());
                        self.value = inner.leaf_value(found).map(|v| v.to_vec());
                        child.latch.release_shared();
                        let top = self.frames.last_mut().unwrap();
                        top.pos = found;
                        return Ok(true);
                    }
                    // Everything in this leaf is ghosted; keep climbing.
                    child.latch.release_shared();
                    self.frames.pop();
                    continue 'up;
                }
                let ci = if forward {
                    0
                } else {
                    child.inner().entry_count()
                };
                self.frames.push(Frame {
                    node: child.clone(),
                    version,
                    pos: 2 * ci as i32,
                    not_found_key: None,
                });
                child_id = child.inner().child_id(ci);
                parent = child;
            }
        }
    }

    /// Full re-find keyed by the cursor's current key, used whenever a
    /// frame went stale.
    fn refind(&mut self, db: &Arc<DbInner>, forward: bool, inclusive: bool) -> Result<bool> {
        match self.key.take() {
            Some(key) => {
                self.descend(db, &key)?;
                self.advance(db, forward, inclusive)
            }
            None => {
                self.descend_edge(db, forward)?;
                self.advance(db, forward, true)
            }
        }
    }
}

/// Scans within a latched leaf for the nearest live entry.
fn scan_leaf(node: &NodeRef, start: i32, forward: bool) -> Option<i32> {
    let inner = node.inner();
    let high = inner.highest_leaf_pos();
    let mut pos = start;
    while pos >= 0 && pos <= high {
        if !inner.leaf_is_ghost(pos) {
            return Some(pos);
        }
        pos += if forward { 2 } else { -2 };
    }
    None
}

/// Latches the split sibling of a latched node, reloading a stale cached
/// reference under the descriptor mutex.
fn latch_split_sibling(db: &Arc<DbInner>, node: &NodeRef, exclusive: bool) -> Result<NodeRef> {
    let inner = node.inner();
    let split = inner.split.as_ref().expect("node has no split");
    let mut slot = split.sibling.lock();
    let mut sibling = slot.clone();
    if exclusive {
        sibling.latch.acquire_exclusive();
    } else {
        sibling.latch.acquire_shared();
    }
    if sibling.id() != split.sibling_id {
        if exclusive {
            sibling.latch.release_exclusive();
        } else {
            sibling.latch.release_shared();
        }
        let reloaded = db
            .cache()
            .acquire_loaded(&db.store(), split.sibling_id, true)?;
        reloaded.inner_mut().split_sibling = true;
        if !exclusive {
            reloaded.latch.downgrade();
        }
        *slot = reloaded.clone();
        sibling = reloaded;
    }
    Ok(sibling)
}

// ---------------------------------------------------------------------------
// Split fix-up
// ---------------------------------------------------------------------------

/// Rebinds a frame position through the split attached to `node` (latched
/// shared). Returns the bound half latched shared with the translated
/// position, or `None` when a not-found frame lost its key copy and a
/// fresh descent is required. The unbound half's latch is released.
fn rebind_frame(
    db: &Arc<DbInner>,
    pos: i32,
    not_found_key: Option<&[u8]>,
    node: NodeRef,
) -> Result<Option<(NodeRef, i32)>> {
    let sibling = latch_split_sibling(db, &node, false)?;
    let decision = {
        let inner = node.inner();
        let split = inner.split.as_ref().unwrap();
        decide_rebind(inner, split, sibling.inner(), pos, not_found_key)
    };
    match decision {
        Some((true, new_pos)) => {
            node.latch.release_shared();
            Ok(Some((sibling, new_pos)))
        }
        Some((false, new_pos)) => {
            sibling.latch.release_shared();
            Ok(Some((node, new_pos)))
        }
        None => {
            sibling.latch.release_shared();
            node.latch.release_shared();
            Ok(None)
        }
    }
}

/// The split fix-up case analysis, in the pre-split coordinate space of
/// `node`. Returns (bind-to-sibling, translated position), or `None` when a
/// not-found frame lacks its key copy.
fn decide_rebind(
    node: &NodeInner,
    split: &Split,
    sibling: &NodeInner,
    pos: i32,
    not_found_key: Option<&[u8]>,
) -> Option<(bool, i32)> {
    if split.right {
        // Sibling holds the high half; highestPos comes from this node.
        let high = node.highest_leaf_pos();
        if pos >= 0 {
            if pos <= high {
                Some((false, pos))
            } else {
                Some((true, pos - high - 2))
            }
        } else {
            let q = !pos;
            if q <= high {
                Some((false, pos))
            } else if q == high + 2 {
                let key = not_found_key?;
                if key < &split.key[..] {
                    Some((false, pos))
                } else {
                    Some((true, !(q - high - 2)))
                }
            } else {
                Some((true, !(q - high - 2)))
            }
        }
    } else {
        // Sibling holds the low half; highestPos comes from the sibling.
        let high = sibling.highest_leaf_pos();
        if pos >= 0 {
            if pos <= high {
                Some((true, pos))
            } else {
                Some((false, pos - high - 2))
            }
        } else {
            let q = !pos;
            if q <= high {
                Some((true, pos))
            } else if q == high + 2 {
                let key = not_found_key?;
                if key < &split.key[..] {
                    Some((true, pos))
                } else {
                    Some((false, !(q - high - 2)))
                }
            } else {
                Some((false, !(q - high - 2)))
            }
        }
    }
}

/// Split-transparent binary search: the result is a position in the
/// combined, pre-split coordinate space, as if the node had not split.
pub(crate) fn binary_search_leaf_split(
    node: &NodeInner,
    split: &Split,
    sibling: &NodeInner,
    key: &[u8],
) -> i32 {
    let (left, right) = if split.right {
        (node, sibling)
    } else {
        (sibling, node)
    };
    let gap = left.highest_leaf_pos() + 2;
    if key < &split.key[..] {
        left.binary_search_leaf(key)
    } else {
        let pos = right.binary_search_leaf(key);
        if pos >= 0 {
            pos + gap
        } else {
            !(!pos + gap)
        }
    }
}

/// Highest position of a split leaf in the combined coordinate space.
#[allow(dead_code)]
pub(crate) fn highest_leaf_pos_split(node: &NodeInner, split: &Split, sibling: &NodeInner) -> i32 {
    let (left, right) = if split.right {
        (node, sibling)
    } else {
        (sibling, node)
    };
    left.highest_leaf_pos() + right.highest_leaf_pos() + 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use parking_lot::Mutex as PlMutex;

    fn leaf_with(keys: &[&[u8]]) -> NodeRef {
        let node = Arc::new(Node::new(1024, false));
        node.latch.acquire_exclusive();
        node.inner_mut().init_leaf(0);
        for (i, key) in keys.iter().enumerate() {
            node.inner_mut().leaf_insert(2 * i as i32, key, Some(b"v"));
        }
        node.latch.release_exclusive();
        node
    }

    fn make_split(right: bool, sibling: &NodeRef, key: &[u8]) -> Split {
        Split {
            right,
            sibling_id: sibling.id(),
            sibling: PlMutex::new(sibling.clone()),
            key: key.into(),
        }
    }

    #[test]
    fn test_rebind_split_right_exact_positions() {
        // Pre-split leaf held a,c,e,g; e and g moved to the sibling.
        let node = leaf_with(&[b"a", b"c"]);
        let sibling = leaf_with(&[b"e", b"g"]);
        let split = make_split(true, &sibling, b"e");

        // Position 2 ("c") stays; position 4 ("e") rebinds to sibling at 0.
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), 2, None),
            Some((false, 2))
        );
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), 4, None),
            Some((true, 0))
        );
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), 6, None),
            Some((true, 2))
        );
    }

    #[test]
    fn test_rebind_split_right_insertion_points() {
        let node = leaf_with(&[b"a", b"c"]);
        let sibling = leaf_with(&[b"e", b"g"]);
        let split = make_split(true, &sibling, b"e");

        // Insertion before "c" stays put.
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), !2, Some(b"b")),
            Some((false, !2))
        );
        // The boundary insertion point consults the not-found key.
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), !4, Some(b"d")),
            Some((false, !4))
        );
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), !4, Some(b"f")),
            Some((true, !0))
        );
        // Past the boundary always rebinds.
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), !6, Some(b"h")),
            Some((true, !2))
        );
    }

    #[test]
    fn test_rebind_split_left_is_symmetric() {
        // Sibling took the low half a,c; the node kept e,g.
        let node = leaf_with(&[b"e", b"g"]);
        let sibling = leaf_with(&[b"a", b"c"]);
        let split = make_split(false, &sibling, b"e");

        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), 0, None),
            Some((true, 0))
        );
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), 4, None),
            Some((false, 0))
        );
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), !4, Some(b"d")),
            Some((true, !4))
        );
        assert_eq!(
            decide_rebind(node.inner(), &split, sibling.inner(), !4, Some(b"f")),
            Some((false, !0))
        );
    }

    #[test]
    fn test_binary_search_across_split_matches_pre_split_leaf() {
        let whole = leaf_with(&[b"a", b"c", b"e", b"g"]);
        let node = leaf_with(&[b"a", b"c"]);
        let sibling = leaf_with(&[b"e", b"g"]);
        let split = make_split(true, &sibling, b"e");

        for probe in [&b"a"[..], b"b", b"c", b"d", b"e", b"f", b"g", b"h"] {
            let expected = whole.inner().binary_search_leaf(probe);
            let got = binary_search_leaf_split(node.inner(), &split, sibling.inner(), probe);
            assert_eq!(got, expected, "probe {probe:?}");
        }
        assert_eq!(
            highest_leaf_pos_split(node.inner(), &split, sibling.inner()),
            whole.inner().highest_leaf_pos()
        );
    }

    #[test]
    fn test_split_left_search_is_also_transparent() {
        let whole = leaf_with(&[b"a", b"c", b"e", b"g"]);
        let node = leaf_with(&[b"e", b"g"]);
        let sibling = leaf_with(&[b"a", b"c"]);
        let split = make_split(false, &sibling, b"e");

        for probe in [&b"a"[..], b"b", b"d", b"e", b"f", b"h"] {
            let expected = whole.inner().binary_search_leaf(probe);
            let got = binary_search_leaf_split(node.inner(), &split, sibling.inner(), probe);
            assert_eq!(got, expected, "probe {probe:?}");
        }
    }
}
