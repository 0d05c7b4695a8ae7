//! Filepath: src/tree.rs
//!
//! The tree driver: root and height management, lock-free descent, retry
//! loops, and propagation of structural changes between levels.
//!
//! [`BLinkTree`] owns the node arena and the root handle. Operations
//! descend from the root without taking any lock; only the node finally
//! being mutated gets locked. A descent can therefore land on a stale node,
//! and every operation carries its recovery: follow the sibling chain when
//! a split moved the target range rightward, restart from the root when a
//! merge tombstoned the landing node.
//!
//! Structural changes propagate by re-descending from the *current* root to
//! the affected level instead of caching parent references. Concurrent
//! splits and merges can change any node's parent at any time; paying an
//! extra traversal removes the entire class of stale-parent bugs.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize};

use crate::arena::{NodeArena, NodeId};
use crate::config::{Key, PayloadRef, KEY_SENTINEL};
use crate::node::{LeafHit, Node, ParentLink, RemoveOutcome, StoreOutcome};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::trace::{debug_log, trace_log};

// ============================================================================
//  BLinkTree
// ============================================================================

/// A concurrent, in-memory B+tree index.
///
/// Point reads and range scans are lock-free; writers lock only the nodes
/// they restructure. Keys are 64-bit signed scalars and need not be unique:
/// the tree behaves as a secondary index, storing any number of entries per
/// key. Payloads are opaque non-zero handles ([`PayloadRef`]).
///
/// All operations take `&self`; share the tree across threads with
/// [`std::sync::Arc`].
///
/// # Example
///
/// ```rust
/// use blinktree::{BLinkTree, PayloadRef};
///
/// let tree = BLinkTree::new();
/// tree.insert(31, PayloadRef::new(1000).unwrap());
/// tree.insert(16, PayloadRef::new(2000).unwrap());
///
/// assert_eq!(tree.get(16).map(|p| p.get()), Some(2000));
///
/// let mut out = Vec::new();
/// assert_eq!(tree.scan_range(10, 51, &mut out), 2);
/// ```
pub struct BLinkTree {
    /// Owns every node, live and tombstoned; nothing is freed before the
    /// tree itself drops.
    arena: NodeArena,

    /// Handle of the current root node, swapped wholesale on root split
    /// and collapse. A stale root stays valid and reachable, so a reader
    /// holding it sees a safe, merely outdated, view.
    root: AtomicU32,

    /// Tree height, informational. 1 while the root is a leaf.
    height: AtomicU32,

    /// Approximate live-entry count. Maintained with relaxed counters and
    /// not part of the correctness contract under concurrency.
    len: AtomicUsize,
}

impl BLinkTree {
    /// Create an empty tree. The root starts as an empty leaf.
    #[must_use]
    pub fn new() -> Self {
        let arena = NodeArena::new();
        let (root_id, _) = arena.alloc(0);
        Self {
            arena,
            root: AtomicU32::new(root_id.get()),
            height: AtomicU32::new(1),
            len: AtomicUsize::new(0),
        }
    }

    // ========================================================================
    //  Public API
    // ========================================================================

    /// Insert an entry for `key`.
    ///
    /// Never fails observably: transient races with concurrent splits and
    /// merges are resolved by restarting from the root until the insert
    /// lands. Duplicate keys are allowed and accumulate.
    ///
    /// Valid keys are strictly below `i64::MAX`, which is reserved as the
    /// empty-slot sentinel.
    pub fn insert(&self, key: Key, payload: PayloadRef) {
        debug_assert!(key < KEY_SENTINEL, "key collides with the slot sentinel");
        loop {
            let Some(leaf_id) = self.descend_to_leaf(key) else {
                continue;
            };
            let leaf: &Node = self.arena.get(leaf_id);
            match leaf.store(self, leaf_id, key, payload.to_slot()) {
                StoreOutcome::Stored(_) => {
                    self.len.fetch_add(1, RELAXED);
                    return;
                }
                StoreOutcome::Tombstoned => {
                    trace_log!("insert: landed on tombstone, restarting from root");
                }
            }
        }
    }

    /// Look up one live entry for `key`.
    ///
    /// Lock-free. When duplicates exist, returns the payload of the
    /// occurrence the descent reaches first.
    #[must_use]
    pub fn get(&self, key: Key) -> Option<PayloadRef> {
        loop {
            let Some(leaf_id) = self.descend_to_leaf(key) else {
                continue;
            };
            let mut node: &Node = self.arena.get(leaf_id);
            loop {
                match node.search_leaf(&self.arena, key) {
                    LeafHit::Found(slot) => return PayloadRef::from_slot(slot),
                    LeafHit::Forward(sib) => node = self.arena.get(sib),
                    LeafHit::Miss => return None,
                }
            }
        }
    }

    /// Remove exactly one live occurrence of `key`.
    ///
    /// Removes the leftmost occurrence in the covering leaf, so repeated
    /// calls peel duplicates off one at a time, deterministically.
    ///
    /// # Returns
    /// `false` when no entry for `key` was found; absence is a reported
    /// no-op, not an error.
    pub fn remove(&self, key: Key) -> bool {
        loop {
            let Some(leaf_id) = self.descend_to_leaf(key) else {
                continue;
            };
            let mut id: NodeId = leaf_id;
            let mut node: &Node = self.arena.get(id);
            loop {
                match node.search_leaf(&self.arena, key) {
                    LeafHit::Forward(sib) => {
                        id = sib;
                        node = self.arena.get(id);
                    }
                    LeafHit::Found(_) => break,
                    LeafHit::Miss => return false,
                }
            }
            match node.remove(self, id, key, false) {
                RemoveOutcome::Removed(hit) => {
                    if hit {
                        self.len.fetch_sub(1, RELAXED);
                    }
                    return hit;
                }
                RemoveOutcome::Tombstoned => {
                    trace_log!("remove: landed on tombstone, restarting from root");
                }
            }
        }
    }

    /// Collect every live payload with key strictly inside `(min, max)`.
    ///
    /// Lock-free. Payloads are appended to `out` in ascending key order;
    /// the walk follows the leaf sibling chain until a key at or above
    /// `max` is seen.
    ///
    /// # Returns
    /// The number of payloads appended.
    pub fn scan_range(&self, min: Key, max: Key, out: &mut Vec<PayloadRef>) -> usize {
        let start: usize = out.len();
        let leaf_id: NodeId = loop {
            if let Some(id) = self.descend_to_leaf(min) {
                break id;
            }
        };
        self.arena.get(leaf_id).collect_range(&self.arena, min, max, out);
        out.len() - start
    }

    /// Current tree height; 1 while the root is a leaf. Informational.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height.load(READ_ORD)
    }

    /// Approximate number of live entries.
    ///
    /// Exact once all concurrent operations have quiesced.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(RELAXED)
    }

    /// Check whether the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total nodes ever allocated, tombstones included. Tombstoned nodes
    /// are never reclaimed while the tree lives.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    // ========================================================================
    //  Internal Plumbing
    // ========================================================================

    /// The node arena.
    #[inline]
    pub(crate) fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// Handle of the current root.
    #[inline]
    pub(crate) fn root_id(&self) -> NodeId {
        NodeId::new(self.root.load(READ_ORD))
    }

    /// Descend by key comparison to the leaf level, without locks.
    ///
    /// # Returns
    /// `None` on a routing dead end (transient race); callers restart.
    fn descend_to_leaf(&self, key: Key) -> Option<NodeId> {
        let mut id: NodeId = self.root_id();
        let mut node: &Node = self.arena.get(id);
        while node.level() > 0 {
            id = node.route(&self.arena, key)?;
            node = self.arena.get(id);
        }
        Some(id)
    }

    /// Install a fresh root `{left, separator, right}` above `left`.
    ///
    /// Serialized by the old root's node lock, which every caller holds.
    pub(crate) fn grow_root(&self, left: NodeId, separator: Key, right: NodeId, level: u32) {
        let (root_id, root) = self.arena.alloc(level);
        root.install_branch(left, separator, right);
        self.root.store(root_id.get(), WRITE_ORD);
        self.height.store(level + 1, WRITE_ORD);
        debug_log!(
            "root grown: node {} level {} separator {}",
            root_id.get(),
            level,
            separator
        );
    }

    /// Swap the root down onto `next_root` after an internal root emptied.
    pub(crate) fn collapse_root(&self, next_root: NodeId) {
        self.root.store(next_root.get(), WRITE_ORD);
        self.height
            .store(self.arena.get(next_root).level() + 1, WRITE_ORD);
    }

    /// Insert a separator for `child` into the chain at `level`.
    ///
    /// Re-descends from the current root each attempt; the parent observed
    /// during a split may itself have split or merged since. Drops the
    /// propagation when the root level sank below the target, which means
    /// a concurrent collapse already rewired the levels.
    pub(crate) fn insert_at_level(&self, separator: Key, child: NodeId, level: u32) {
        loop {
            let root_id: NodeId = self.root_id();
            let root: &Node = self.arena.get(root_id);
            if level > root.level() {
                trace_log!("separator propagation dropped: root level sank");
                return;
            }

            let mut id: NodeId = root_id;
            let mut node: &Node = root;
            let mut routed: bool = true;
            while node.level() > level {
                match node.route(&self.arena, separator) {
                    Some(next) => {
                        id = next;
                        node = self.arena.get(id);
                    }
                    None => {
                        routed = false;
                        break;
                    }
                }
            }
            if !routed {
                continue;
            }

            match node.store(self, id, separator, child.to_slot()) {
                StoreOutcome::Stored(_) => return,
                StoreOutcome::Tombstoned => {
                    trace_log!("separator insert hit a tombstone, retrying");
                }
            }
        }
    }

    /// Find the parent of `child` at `level`, remove the separator that
    /// references it, and report what the rebalance needs: whether `child`
    /// is the parent's leftmost child and, if not, its immediate left
    /// sibling.
    ///
    /// The parent is always re-derived from the current root. The parent's
    /// lock is held only for the duration of this call; the separator
    /// extraction and removal happen atomically under it.
    ///
    /// # Returns
    /// `None` when no parent at `level` references `child` anymore; the
    /// caller abandons the rebalance and lets a later operation retry.
    pub(crate) fn detach_from_parent(
        &self,
        key: Key,
        child: NodeId,
        level: u32,
    ) -> Option<ParentLink> {
        let root_id: NodeId = self.root_id();
        let root: &Node = self.arena.get(root_id);
        if level > root.level() {
            return None;
        }

        let mut id: NodeId = root_id;
        let mut node: &Node = root;
        while node.level() > level {
            id = node.route(&self.arena, key)?;
            node = self.arena.get(id);
        }

        // Walk the parent-level chain: the separator may have moved right
        // under a concurrent parent split.
        loop {
            let mut guard = node.version().lock();
            if guard.is_deleted() {
                let sib: NodeId = node.sibling()?;
                drop(guard);
                id = sib;
                node = self.arena.get(id);
                continue;
            }
            match node.parent_link_of(&guard, child) {
                Some(link) => {
                    if let ParentLink::Interior { separator, .. } = link {
                        let _ = node.remove_locked(self, id, separator, false, &mut guard, false);
                    }
                    return Some(link);
                }
                None => {
                    let sib: NodeId = node.sibling()?;
                    drop(guard);
                    trace_log!("detach: child not here, walking to sibling {}", sib.get());
                    id = sib;
                    node = self.arena.get(id);
                }
            }
        }
    }
}

impl Default for BLinkTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BLinkTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BLinkTree")
            .field("height", &self.height())
            .field("len", &self.len())
            .field("node_count", &self.node_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  Tests
// ============================================================================
