//! Filepath: src/node.rs
//!
//! Tree nodes and the entry-array algorithms.
//!
//! A [`Node`] is one fixed-capacity page of the tree: a small header plus
//! [`CARDINALITY`](crate::config::CARDINALITY) entry slots holding
//! `(key, payload)` pairs in ascending key order. Leaf slots carry caller
//! payloads; internal slots carry child [`NodeId`]s, with one extra
//! `leftmost` child for keys below the first entry. Nodes at the same level
//! are joined by a right-directed sibling chain, which is what lets lock-free
//! readers and writers recover when a concurrent split moves a key range
//! rightward after they have already descended.
//!
//! # Concurrency Model
//!
//! - **Readers** never lock. They capture a stable version snapshot, scan
//!   the live prefix, and retry when the snapshot fails revalidation.
//! - **Writers** lock only the node they mutate (two adjacent nodes during
//!   a rebalance) and bracket every visible entry-array mutation in a
//!   change window so that in-flight scans detect instability.
//! - **Tombstones** stay readable forever. A node that was merged away or
//!   replaced as root keeps its entries and links; nothing is ever freed.
//!
//! The live prefix of the entry array ends at the first null payload word;
//! unused slots hold the maximum-key sentinel.

use std::fmt;
use std::sync::atomic::{AtomicI16, AtomicI64, AtomicU32, AtomicU64};

use crate::arena::{NodeArena, NodeId};
use crate::config::{Key, CARDINALITY, KEY_SENTINEL};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::trace::{debug_log, trace_log};
use crate::tree::BLinkTree;
use crate::version::{LockGuard, NodeVersion};

// ============================================================================
//  Operation Outcomes
// ============================================================================

/// Result of inserting through [`Node::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreOutcome {
    /// The entry was placed; the id names the node that received it.
    Stored(NodeId),

    /// The located node was tombstoned by a concurrent merge.
    /// The caller restarts the operation from the root.
    Tombstoned,
}

/// Result of deleting through [`Node::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveOutcome {
    /// The operation completed. The flag reports whether an entry was
    /// actually removed from this node.
    Removed(bool),

    /// The located node was tombstoned by a concurrent merge.
    /// The caller restarts the operation from the root.
    Tombstoned,
}

/// Private outcome of the locked removal body.
///
/// The leftmost-child case must release this node's lock before touching
/// the right sibling; only the frame that owns the lock can do that, so the
/// locked body reports the deferral instead of performing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockedOutcome {
    Done(RemoveOutcome),
    DeferToSibling { sibling: NodeId, hit: bool },
}

/// Where a node sits under its parent, as reported by
/// [`BLinkTree::detach_from_parent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParentLink {
    /// The node is its parent's leftmost child; it has no separator entry.
    Leftmost,

    /// The node is referenced by a separator entry. `left` is the child
    /// immediately preceding it, `separator` the key that was removed from
    /// the parent on its behalf.
    Interior { separator: Key, left: NodeId },
}

/// Result of a leaf point search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafHit {
    /// Exact match; the slot word holds the payload.
    Found(u64),

    /// The key range moved right under a concurrent split; continue at the
    /// sibling.
    Forward(NodeId),

    /// No live entry with this key here.
    Miss,
}

// ============================================================================
//  Node
// ============================================================================

/// One fixed-capacity page of the tree.
///
/// Every field is atomic: readers traverse nodes without locks and validate
/// through the version word, writers publish field by field inside a change
/// window. A node never holds more than `CARDINALITY - 1` live entries, so
/// scans always terminate on a null slot.
#[repr(align(64))]
pub struct Node {
    /// Versioned lock word: exclusive lock, change flag, tombstone flag,
    /// mutation counter.
    version: NodeVersion,

    /// Tree level; 0 is the leaf level. Set once at allocation.
    level: AtomicU32,

    /// Child for keys below the first entry. Zero on leaves; a non-zero
    /// leftmost link is what classifies a node as internal.
    leftmost: AtomicU32,

    /// Right sibling at the same level. Zero terminates the chain.
    sibling: AtomicU32,

    /// Advisory index of the last live slot, -1 when empty. A hint only;
    /// it is never trusted without the version-retry protocol.
    last_index: AtomicI16,

    /// Entry keys. Unused slots hold the maximum-key sentinel.
    keys: [AtomicI64; CARDINALITY],

    /// Entry payload words. Zero marks the end of the live prefix.
    slots: [AtomicU64; CARDINALITY],
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("level", &self.level())
            .field("occupancy", &self.occupancy())
            .field("deleted", &self.version.is_deleted())
            .field("has_sibling", &self.sibling().is_some())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Create a pristine empty node. Used by the arena when it grows a
    /// segment; nodes become live through [`NodeArena::alloc`].
    pub(crate) fn empty() -> Self {
        Self {
            version: NodeVersion::new(),
            level: AtomicU32::new(0),
            leftmost: AtomicU32::new(0),
            sibling: AtomicU32::new(0),
            last_index: AtomicI16::new(-1),
            keys: std::array::from_fn(|_| AtomicI64::new(KEY_SENTINEL)),
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Stamp the level on a freshly allocated node.
    pub(crate) fn init_level(&self, level: u32) {
        self.level.store(level, WRITE_ORD);
    }

    // ========================================================================
    //  Header Accessors
    // ========================================================================

    /// The node's versioned lock word.
    #[inline]
    pub(crate) const fn version(&self) -> &NodeVersion {
        &self.version
    }

    /// Tree level; 0 is the leaf level.
    #[inline]
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level.load(READ_ORD)
    }

    /// Check whether this node is a leaf (it has no leftmost child).
    #[inline]
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.leftmost.load(READ_ORD) == 0
    }

    /// The leftmost child, if this node is internal.
    #[inline]
    pub(crate) fn leftmost(&self) -> Option<NodeId> {
        NodeId::from_raw(self.leftmost.load(READ_ORD))
    }

    /// The right sibling, if any.
    #[inline]
    pub(crate) fn sibling(&self) -> Option<NodeId> {
        NodeId::from_raw(self.sibling.load(READ_ORD))
    }

    /// Raw sibling word; zero when the chain ends here.
    #[inline]
    pub(crate) fn sibling_raw(&self) -> u32 {
        self.sibling.load(READ_ORD)
    }

    /// First key of the node; the sentinel when the node is empty.
    ///
    /// Used for the sibling-handoff probes. Reading a possibly tombstoned
    /// sibling here is safe only because nodes are never freed.
    #[inline]
    pub(crate) fn first_key(&self) -> Key {
        self.keys[0].load(READ_ORD)
    }

    #[inline]
    pub(crate) fn key_at(&self, i: usize) -> Key {
        self.keys[i].load(READ_ORD)
    }

    #[inline]
    fn slot_at(&self, i: usize) -> u64 {
        self.slots[i].load(READ_ORD)
    }

    #[inline]
    fn set_sibling(&self, id: NodeId) {
        self.sibling.store(id.get(), WRITE_ORD);
    }

    #[inline]
    fn set_sibling_raw(&self, raw: u32) {
        self.sibling.store(raw, WRITE_ORD);
    }

    #[inline]
    fn set_leftmost(&self, id: NodeId) {
        self.leftmost.store(id.get(), WRITE_ORD);
    }

    /// Adopt a child out of an entry slot word as the leftmost link.
    #[inline]
    fn set_leftmost_slot(&self, slot: u64) {
        debug_assert!(slot > 0 && slot <= u64::from(u32::MAX), "bad child slot");
        self.leftmost
            .store(u32::try_from(slot).unwrap_or(0), WRITE_ORD);
    }

    // ========================================================================
    //  Occupancy
    // ========================================================================

    /// Count the live entries without blocking writers.
    ///
    /// Starts from the `last_index` hint, probes forward while slots are
    /// live and backward while they are not, then revalidates the version
    /// snapshot and retries on mismatch. The hint may be arbitrarily stale;
    /// only the validated scan is trusted.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        loop {
            let snapshot: u64 = self.version.stable();
            let hint: i16 = self.last_index.load(READ_ORD);
            let mut count: usize = usize::try_from(hint + 1).unwrap_or(0).min(CARDINALITY);
            while count < CARDINALITY && self.slot_at(count) != 0 {
                count += 1;
            }
            while count > 0 && self.slot_at(count - 1) == 0 {
                count -= 1;
            }
            if !self.version.has_changed(snapshot) {
                return count;
            }
        }
    }

    /// Count live entries under the lock. Plain forward scan; valid only
    /// while no change window is open on this node.
    fn live_count(&self, guard: &LockGuard<'_>) -> usize {
        debug_assert!(guard.guards(&self.version), "guard is for another node");
        let mut n: usize = 0;
        while n < CARDINALITY && self.slots[n].load(RELAXED) != 0 {
            n += 1;
        }
        n
    }

    // ========================================================================
    //  Entry-Array Mutation (locked)
    // ========================================================================

    /// Shift an entry into sorted position. Raw helper: the caller is
    /// responsible for the change window. Duplicates land after existing
    /// equal keys.
    fn shift_in(&self, guard: &mut LockGuard<'_>, key: Key, slot: u64) {
        debug_assert!(guard.guards(&self.version), "guard is for another node");
        debug_assert_ne!(slot, 0, "null payload word");
        let n: usize = self.live_count(guard);
        debug_assert!(n < CARDINALITY, "shift_in into a full node");

        let mut pos: usize = n;
        for i in 0..n {
            if self.key_at(i) > key {
                pos = i;
                break;
            }
        }
        let mut i: usize = n;
        while i > pos {
            self.keys[i].store(self.keys[i - 1].load(RELAXED), WRITE_ORD);
            self.slots[i].store(self.slots[i - 1].load(RELAXED), WRITE_ORD);
            i -= 1;
        }
        self.keys[pos].store(key, WRITE_ORD);
        self.slots[pos].store(slot, WRITE_ORD);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        self.last_index.store(n as i16, WRITE_ORD);
    }

    /// Clear every slot from `m` upward. Raw helper; caller owns the
    /// change window.
    fn truncate_from(&self, guard: &mut LockGuard<'_>, m: usize) {
        debug_assert!(guard.guards(&self.version), "guard is for another node");
        for i in m..CARDINALITY {
            self.keys[i].store(KEY_SENTINEL, WRITE_ORD);
            self.slots[i].store(0, WRITE_ORD);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        self.last_index.store(m as i16 - 1, WRITE_ORD);
    }

    /// Insert one entry inside its own change window.
    pub(crate) fn insert_entry(&self, guard: &mut LockGuard<'_>, key: Key, slot: u64) {
        guard.begin_change();
        self.shift_in(guard, key, slot);
        guard.end_change();
    }

    /// Remove the leftmost live entry matching `key`, closing the gap.
    ///
    /// # Returns
    /// `false` when no live entry matches; the node is left untouched and
    /// no change window opens.
    pub(crate) fn remove_entry(&self, guard: &mut LockGuard<'_>, key: Key) -> bool {
        let n: usize = self.live_count(guard);
        let mut pos: Option<usize> = None;
        for i in 0..n {
            if self.key_at(i) == key {
                pos = Some(i);
                break;
            }
        }
        let Some(pos) = pos else {
            return false;
        };

        guard.begin_change();
        for i in pos..n - 1 {
            self.keys[i].store(self.keys[i + 1].load(RELAXED), WRITE_ORD);
            self.slots[i].store(self.slots[i + 1].load(RELAXED), WRITE_ORD);
        }
        self.keys[n - 1].store(KEY_SENTINEL, WRITE_ORD);
        self.slots[n - 1].store(0, WRITE_ORD);
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        self.last_index.store(n as i16 - 2, WRITE_ORD);
        guard.end_change();
        true
    }

    /// Turn a fresh node into a one-entry branch `{left, key, right}`.
    ///
    /// Only valid on a node that is not yet reachable from the tree.
    pub(crate) fn install_branch(&self, left: NodeId, key: Key, right: NodeId) {
        let mut guard = self.version.lock();
        self.set_leftmost(left);
        self.shift_in(&mut guard, key, right.to_slot());
        drop(guard);
    }

    // ========================================================================
    //  Point Search
    // ========================================================================

    /// Route a key through an internal node.
    ///
    /// Returns the leftmost child whose range can hold `key`: the child
    /// left of the first entry whose key is at or above `key`, or the
    /// leftmost child when `key` is at or below every entry. Keys equal to
    /// a separator descend left, so a lookup always lands at the leftmost
    /// candidate leaf and reaches every duplicate through the leaf chain
    /// walk. A sibling whose first key is strictly below `key` wins
    /// instead, recovering from a split that happened after descent
    /// reached this node.
    ///
    /// # Returns
    /// `None` only when the node has no children at all, which a caller
    /// treats as a transient race and restarts.
    pub(crate) fn route(&self, arena: &NodeArena, key: Key) -> Option<NodeId> {
        debug_assert!(self.level() > 0, "route called on a leaf");
        let mut chosen: Option<NodeId>;
        loop {
            let snapshot: u64 = self.version.stable();
            if key <= self.key_at(0) {
                chosen = self.leftmost();
            } else {
                let mut last: u64 = 0;
                for i in 0..CARDINALITY {
                    let slot: u64 = self.slot_at(i);
                    if slot == 0 || key <= self.key_at(i) {
                        break;
                    }
                    last = slot;
                }
                chosen = NodeId::from_slot(last);
            }
            if !self.version.has_changed(snapshot) {
                break;
            }
        }

        if let Some(sib) = self.sibling() {
            if key > arena.get(sib).first_key() {
                trace_log!("route: handing key off to sibling {}", sib.get());
                return Some(sib);
            }
        }
        chosen.or_else(|| self.leftmost())
    }

    /// Search a leaf for an exact key match.
    pub(crate) fn search_leaf(&self, arena: &NodeArena, key: Key) -> LeafHit {
        let mut found: Option<u64>;
        loop {
            let snapshot: u64 = self.version.stable();
            found = None;
            for i in 0..CARDINALITY {
                let slot: u64 = self.slot_at(i);
                if slot == 0 {
                    break;
                }
                let k: Key = self.key_at(i);
                if k == key {
                    found = Some(slot);
                    break;
                }
                if k > key {
                    break;
                }
            }
            if !self.version.has_changed(snapshot) {
                break;
            }
        }

        if let Some(slot) = found {
            return LeafHit::Found(slot);
        }
        if let Some(sib) = self.sibling() {
            if key >= arena.get(sib).first_key() {
                return LeafHit::Forward(sib);
            }
        }
        LeafHit::Miss
    }

    // ========================================================================
    //  Range Scan
    // ========================================================================

    /// Collect every live payload with key strictly inside `(min, max)`,
    /// ascending, starting at this leaf and following the sibling chain.
    ///
    /// A scan that fails validation rolls `out` back to its length at the
    /// start of the node and retries, so the caller's buffer never holds
    /// torn results.
    pub(crate) fn collect_range(
        &self,
        arena: &NodeArena,
        min: Key,
        max: Key,
        out: &mut Vec<crate::config::PayloadRef>,
    ) {
        let mut node: &Node = self;
        loop {
            let mark: usize = out.len();
            let mut past_max: bool;
            loop {
                out.truncate(mark);
                past_max = false;
                let snapshot: u64 = node.version.stable();
                for i in 0..CARDINALITY {
                    let slot: u64 = node.slot_at(i);
                    if slot == 0 {
                        break;
                    }
                    let k: Key = node.key_at(i);
                    if k <= min {
                        continue;
                    }
                    if k >= max {
                        past_max = true;
                        break;
                    }
                    if let Some(payload) = crate::config::PayloadRef::from_slot(slot) {
                        out.push(payload);
                    }
                }
                if !node.version.has_changed(snapshot) {
                    break;
                }
            }

            if past_max {
                return;
            }
            match node.sibling() {
                Some(sib) => node = arena.get(sib),
                None => return,
            }
        }
    }

    // ========================================================================
    //  Store (insert into a located node)
    // ========================================================================

    /// Insert `(key, slot)` into this node or, after recovery, a sibling.
    ///
    /// The node was located by a lock-free descent and may be stale by the
    /// time the lock lands:
    /// - a tombstone means a concurrent merge removed it; the caller
    ///   restarts from the root;
    /// - a sibling whose first key is below `key` means a concurrent split
    ///   moved the covering range rightward; the insert follows the chain.
    ///
    /// A full node splits; see [`split_store`](Self::split_store).
    pub(crate) fn store(
        &self,
        tree: &BLinkTree,
        self_id: NodeId,
        key: Key,
        slot: u64,
    ) -> StoreOutcome {
        let arena: &NodeArena = tree.arena();
        let mut node: &Node = self;
        let mut id: NodeId = self_id;
        loop {
            let mut guard = node.version.lock();
            if guard.is_deleted() {
                return StoreOutcome::Tombstoned;
            }

            if let Some(sib) = node.sibling() {
                let sib_node: &Node = arena.get(sib);
                if key > sib_node.first_key() {
                    drop(guard);
                    trace_log!("store: forwarding key to sibling {}", sib.get());
                    node = sib_node;
                    id = sib;
                    continue;
                }
            }

            let n: usize = node.live_count(&guard);
            if n < CARDINALITY - 1 {
                node.insert_entry(&mut guard, key, slot);
                return StoreOutcome::Stored(id);
            }
            return node.split_store(tree, id, key, slot, n, guard);
        }
    }

    /// Pick the split index: the median, nudged to the nearest boundary
    /// between distinct keys so a run of duplicates does not straddle the
    /// separator. Falls back to the median when every key is equal.
    fn split_point(&self, n: usize) -> usize {
        let mid: usize = n.div_ceil(2);
        if self.key_at(mid - 1) != self.key_at(mid) {
            return mid;
        }
        for d in 1..n {
            let right: usize = mid + d;
            if right < n && self.key_at(right - 1) != self.key_at(right) {
                return right;
            }
            if let Some(left) = mid.checked_sub(d) {
                if left >= 1 && self.key_at(left - 1) != self.key_at(left) {
                    return left;
                }
            }
        }
        mid
    }

    /// Split this full node and place the incoming entry.
    ///
    /// Entries above the split index migrate into a freshly allocated right
    /// sibling (for an internal node the entry at the index becomes the
    /// sibling's leftmost child instead of a keyed entry). The sibling is
    /// fully built, incoming entry included when its range covers it,
    /// before the single change window that splices it into the chain and
    /// cuts the moved tail. The split key then propagates upward: a new
    /// root when this node was the root, otherwise a re-descent from the
    /// current root to the parent level.
    fn split_store(
        &self,
        tree: &BLinkTree,
        self_id: NodeId,
        key: Key,
        slot: u64,
        n: usize,
        mut guard: LockGuard<'_>,
    ) -> StoreOutcome {
        let arena: &NodeArena = tree.arena();
        let level: u32 = self.level();
        let m: usize = self.split_point(n);
        let split_key: Key = self.key_at(m);

        let (sib_id, sibling) = arena.alloc(level);
        let mut sib_guard = sibling.version().lock();
        if self.leftmost().is_some() {
            sibling.set_leftmost_slot(self.slot_at(m));
            for i in (m + 1)..n {
                sibling.shift_in(&mut sib_guard, self.key_at(i), self.slot_at(i));
            }
        } else {
            for i in m..n {
                sibling.shift_in(&mut sib_guard, self.key_at(i), self.slot_at(i));
            }
        }
        sibling.set_sibling_raw(self.sibling_raw());
        let goes_right: bool = key >= split_key;
        if goes_right {
            sibling.shift_in(&mut sib_guard, key, slot);
        }
        drop(sib_guard);

        // Publish everything in one change window: splice the sibling, cut
        // the migrated tail, place the entry if it stays here.
        guard.begin_change();
        self.set_sibling(sib_id);
        self.truncate_from(&mut guard, m);
        if !goes_right {
            self.shift_in(&mut guard, key, slot);
        }
        guard.end_change();

        debug_log!(
            "split: node {} level {} separator {}",
            self_id.get(),
            level,
            split_key
        );

        let target: NodeId = if goes_right { sib_id } else { self_id };
        if tree.root_id() == self_id {
            tree.grow_root(self_id, split_key, sib_id, level + 1);
            drop(guard);
        } else {
            drop(guard);
            tree.insert_at_level(split_key, sib_id, level + 1);
        }
        StoreOutcome::Stored(target)
    }

    // ========================================================================
    //  Remove (delete from a located node)
    // ========================================================================

    /// Remove one occurrence of `key` from this node, rebalancing with the
    /// left sibling when occupancy sinks below the minimum.
    ///
    /// With `only_rebalance` the key removal is skipped and only the
    /// rebalancing obligation is discharged; used when a leftmost child
    /// hands its obligation to the right sibling.
    pub(crate) fn remove(
        &self,
        tree: &BLinkTree,
        self_id: NodeId,
        key: Key,
        only_rebalance: bool,
    ) -> RemoveOutcome {
        let mut guard = self.version.lock();
        match self.remove_locked(tree, self_id, key, only_rebalance, &mut guard, true) {
            LockedOutcome::Done(outcome) => outcome,
            LockedOutcome::DeferToSibling { sibling, hit } => {
                // Release before going rightward; holding a node while
                // locking its right sibling inverts the lock order.
                drop(guard);
                let node: &Node = tree.arena().get(sibling);
                let first: Key = node.first_key();
                trace_log!("remove: deferring rebalance to sibling {}", sibling.get());
                let _ = node.remove(tree, sibling, first, true);
                RemoveOutcome::Removed(hit)
            }
        }
    }

    /// Locked removal body, shared between the owning wrapper above and the
    /// parent-separator removal inside
    /// [`BLinkTree::detach_from_parent`], which already holds the lock.
    pub(crate) fn remove_locked(
        &self,
        tree: &BLinkTree,
        self_id: NodeId,
        key: Key,
        only_rebalance: bool,
        guard: &mut LockGuard<'_>,
        owns_lock: bool,
    ) -> LockedOutcome {
        debug_assert!(guard.guards(&self.version), "guard is for another node");
        if guard.is_deleted() {
            return LockedOutcome::Done(RemoveOutcome::Tombstoned);
        }

        let mut hit: bool = false;
        if !only_rebalance {
            let before: usize = self.live_count(guard);
            if tree.root_id() == self_id {
                // Root special case: an internal root down to one separator
                // and no sibling collapses onto its surviving child.
                if self.level() > 0 && before == 1 && self.sibling().is_none() {
                    if let Some(next_root) = self.leftmost() {
                        tree.collapse_root(next_root);
                        guard.mark_deleted();
                        debug_log!("root collapsed onto node {}", next_root.get());
                    }
                }
                hit = self.remove_entry(guard, key);
                return LockedOutcome::Done(RemoveOutcome::Removed(hit));
            }

            hit = self.remove_entry(guard, key);
            let min_live: usize = (CARDINALITY - 1).div_ceil(2);
            if before.saturating_sub(1) >= min_live {
                return LockedOutcome::Done(RemoveOutcome::Removed(hit));
            }
        }

        let level: u32 = self.level();
        let Some(link) = tree.detach_from_parent(key, self_id, level + 1) else {
            // The parent no longer references this node, or the root level
            // sank below it. The removal above stands; only the rebalance
            // is abandoned.
            trace_log!("remove: parent lost node {}, rebalance abandoned", self_id.get());
            return LockedOutcome::Done(RemoveOutcome::Removed(hit));
        };

        match link {
            ParentLink::Leftmost => {
                let Some(sibling) = self.sibling() else {
                    return LockedOutcome::Done(RemoveOutcome::Removed(hit));
                };
                if owns_lock {
                    LockedOutcome::DeferToSibling { sibling, hit }
                } else {
                    // The lock belongs to a caller frame and cannot be
                    // released here; leave the node under-filled rather
                    // than acquire rightward while holding it.
                    LockedOutcome::Done(RemoveOutcome::Removed(hit))
                }
            }
            ParentLink::Interior { separator, left } => {
                self.rebalance_with_left(tree, self_id, guard, separator, left);
                LockedOutcome::Done(RemoveOutcome::Removed(hit))
            }
        }
    }

    /// Combine this under-filled node with its left sibling: redistribute
    /// when the pair still overflows one page, merge otherwise.
    fn rebalance_with_left(
        &self,
        tree: &BLinkTree,
        self_id: NodeId,
        guard: &mut LockGuard<'_>,
        separator: Key,
        left_hint: NodeId,
    ) {
        let arena: &NodeArena = tree.arena();
        let mut left_id: NodeId = left_hint;
        let mut left: &Node = arena.get(left_id);
        let mut left_guard = left.version().lock();

        // The parent named the left sibling before we locked it; it may
        // have split since. Walk right until the node whose link points
        // back here, relocking as we go.
        while left.sibling_raw() != self_id.get() {
            let Some(next) = left.sibling() else {
                trace_log!(
                    "rebalance: chain no longer reaches node {}, abandoned",
                    self_id.get()
                );
                return;
            };
            drop(left_guard);
            left_id = next;
            left = arena.get(left_id);
            left_guard = left.version().lock();
        }
        if left_guard.is_deleted() {
            // Merged away between the parent naming it and the lock
            // landing; merging into a tombstone would strand the entries.
            return;
        }

        let n: usize = self.live_count(guard);
        let ln: usize = left.live_count(&left_guard);
        let internal: bool = self.leftmost().is_some();
        let total: usize = n + ln + usize::from(internal);

        if total > CARDINALITY - 1 {
            self.redistribute(
                tree, self_id, guard, left_id, left, &mut left_guard, separator, n, ln, total,
            );
        } else {
            self.merge_into_left(guard, left, &mut left_guard, separator, n);
            debug_log!("merge: node {} into {}", self_id.get(), left_id.get());
        }
    }

    /// Rebalance by moving entries across the boundary.
    ///
    /// When this node is the smaller it pulls from the left sibling's tail;
    /// otherwise its own entries spill into the left sibling and a fresh
    /// right node that replaces this one in the chain. Either way a new
    /// separator goes back up through the tree.
    #[allow(clippy::too_many_arguments)]
    fn redistribute(
        &self,
        tree: &BLinkTree,
        self_id: NodeId,
        guard: &mut LockGuard<'_>,
        left_id: NodeId,
        left: &Node,
        left_guard: &mut LockGuard<'_>,
        separator: Key,
        n: usize,
        ln: usize,
        total: usize,
    ) {
        let arena: &NodeArena = tree.arena();
        let internal: bool = self.leftmost().is_some();
        let level: u32 = self.level();
        let m: usize = total.div_ceil(2);

        if n < ln {
            // Pull the left sibling's tail into this node.
            let parent_key: Key;
            if internal {
                // Keep the transferred child at a live index.
                let m: usize = m.min(ln - 1);
                guard.begin_change();
                if let Some(lm) = self.leftmost() {
                    self.shift_in(guard, separator, lm.to_slot());
                }
                for i in ((m + 1)..ln).rev() {
                    self.shift_in(guard, left.key_at(i), left.slot_at(i));
                }
                parent_key = left.key_at(m);
                self.set_leftmost_slot(left.slot_at(m));
                guard.end_change();

                left_guard.begin_change();
                left.truncate_from(left_guard, m);
                left_guard.end_change();
            } else {
                guard.begin_change();
                for i in (m..ln).rev() {
                    self.shift_in(guard, left.key_at(i), left.slot_at(i));
                }
                parent_key = self.key_at(0);
                guard.end_change();

                left_guard.begin_change();
                left.truncate_from(left_guard, m);
                left_guard.end_change();
            }
            debug_log!(
                "redistribute: {} <- {} new separator {}",
                self_id.get(),
                left_id.get(),
                parent_key
            );

            if tree.root_id() == left_id {
                tree.grow_root(left_id, parent_key, self_id, level + 1);
            } else {
                tree.insert_at_level(parent_key, self_id, level + 1);
            }
        } else {
            // Spill this node's head into the left sibling and its tail
            // into a fresh right node; this node drops out of the chain.
            guard.mark_deleted();
            let (new_id, fresh) = arena.alloc(level);
            let mut fresh_guard = fresh.version().lock();
            fresh.set_sibling_raw(self.sibling_raw());

            // An internal pair can sit one entry short of a clean split;
            // move at least one so the fresh node keeps a leftmost child.
            let num_dist: usize = if internal { (n - m).max(1) } else { n - m };
            let parent_key: Key;

            left_guard.begin_change();
            if internal {
                if let Some(lm) = self.leftmost() {
                    left.shift_in(left_guard, separator, lm.to_slot());
                }
                for i in 0..num_dist - 1 {
                    left.shift_in(left_guard, self.key_at(i), self.slot_at(i));
                }
                parent_key = self.key_at(num_dist - 1);
                fresh.set_leftmost_slot(self.slot_at(num_dist - 1));
                for i in num_dist..n {
                    fresh.shift_in(&mut fresh_guard, self.key_at(i), self.slot_at(i));
                }
            } else {
                for i in 0..num_dist {
                    left.shift_in(left_guard, self.key_at(i), self.slot_at(i));
                }
                for i in num_dist..n {
                    fresh.shift_in(&mut fresh_guard, self.key_at(i), self.slot_at(i));
                }
                parent_key = fresh.first_key();
            }
            left.set_sibling(new_id);
            left_guard.end_change();

            debug_log!(
                "redistribute: {} replaced by {} separator {}",
                self_id.get(),
                new_id.get(),
                parent_key
            );

            if tree.root_id() == left_id {
                tree.grow_root(left_id, parent_key, new_id, level + 1);
            } else {
                tree.insert_at_level(parent_key, new_id, level + 1);
            }
            drop(fresh_guard);
        }
    }

    /// Fold every surviving entry into the left sibling and drop out of the
    /// sibling chain. This node keeps its entries as a readable tombstone.
    fn merge_into_left(
        &self,
        guard: &mut LockGuard<'_>,
        left: &Node,
        left_guard: &mut LockGuard<'_>,
        separator: Key,
        n: usize,
    ) {
        guard.mark_deleted();
        left_guard.begin_change();
        if let Some(lm) = self.leftmost() {
            left.shift_in(left_guard, separator, lm.to_slot());
        }
        for i in 0..n {
            left.shift_in(left_guard, self.key_at(i), self.slot_at(i));
        }
        left.set_sibling_raw(self.sibling_raw());
        left_guard.end_change();
    }

    /// Report where `child` hangs under this (locked) internal node.
    ///
    /// # Returns
    /// `None` when `child` is not referenced here, which the caller treats
    /// as a stale parent and recovers from.
    pub(crate) fn parent_link_of(
        &self,
        guard: &LockGuard<'_>,
        child: NodeId,
    ) -> Option<ParentLink> {
        debug_assert!(guard.guards(&self.version), "guard is for another node");
        if self.leftmost() == Some(child) {
            return Some(ParentLink::Leftmost);
        }
        let n: usize = self.live_count(guard);
        for i in 0..n {
            if NodeId::from_slot(self.slot_at(i)) == Some(child) {
                let left: Option<NodeId> = if i == 0 {
                    self.leftmost()
                } else {
                    NodeId::from_slot(self.slot_at(i - 1))
                };
                return left.map(|left| ParentLink::Interior {
                    separator: self.key_at(i),
                    left,
                });
            }
        }
        None
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn locked_insert(node: &Node, key: Key, slot: u64) {
        let mut guard = node.version().lock();
        node.insert_entry(&mut guard, key, slot);
    }

    fn locked_remove(node: &Node, key: Key) -> bool {
        let mut guard = node.version().lock();
        node.remove_entry(&mut guard, key)
    }

    fn keys_of(node: &Node) -> Vec<Key> {
        (0..node.occupancy()).map(|i| node.key_at(i)).collect()
    }

    #[test]
    fn test_empty_node_shape() {
        let node = Node::empty();
        assert!(node.is_leaf());
        assert_eq!(node.occupancy(), 0);
        assert_eq!(node.first_key(), KEY_SENTINEL);
        assert!(node.sibling().is_none());
    }

    #[test]
    fn test_insert_entry_keeps_sorted_order() {
        let node = Node::empty();
        for (k, s) in [(50, 1), (10, 2), (30, 3), (20, 4)] {
            locked_insert(&node, k, s);
        }
        assert_eq!(keys_of(&node), vec![10, 20, 30, 50]);
        assert_eq!(node.occupancy(), 4);
    }

    #[test]
    fn test_duplicate_inserts_after_equal_keys() {
        let node = Node::empty();
        locked_insert(&node, 31, 1);
        locked_insert(&node, 16, 2);
        locked_insert(&node, 31, 3);
        assert_eq!(keys_of(&node), vec![16, 31, 31]);
        // The later duplicate sits to the right of the earlier one.
        assert_eq!(node.slot_at(1), 1);
        assert_eq!(node.slot_at(2), 3);
    }

    #[test]
    fn test_remove_entry_takes_leftmost_occurrence() {
        let node = Node::empty();
        locked_insert(&node, 31, 1);
        locked_insert(&node, 31, 2);
        locked_insert(&node, 50, 3);
        assert!(locked_remove(&node, 31));
        assert_eq!(keys_of(&node), vec![31, 50]);
        assert_eq!(node.slot_at(0), 2, "the earlier duplicate must go first");
    }

    #[test]
    fn test_remove_entry_miss_leaves_node_untouched() {
        let node = Node::empty();
        locked_insert(&node, 10, 1);
        let before = node.version().stable();
        assert!(!locked_remove(&node, 99));
        assert!(!node.version().has_changed(before));
        assert_eq!(keys_of(&node), vec![10]);
    }

    #[test]
    fn test_remove_clears_vacated_tail_slot() {
        let node = Node::empty();
        locked_insert(&node, 1, 1);
        locked_insert(&node, 2, 2);
        assert!(locked_remove(&node, 1));
        assert_eq!(node.occupancy(), 1);
        assert_eq!(node.slot_at(1), 0);
        assert_eq!(node.key_at(1), KEY_SENTINEL);
    }

    #[test]
    fn test_occupancy_survives_bogus_hint() {
        let node = Node::empty();
        locked_insert(&node, 1, 1);
        locked_insert(&node, 2, 2);

        node.last_index.store(5, WRITE_ORD);
        assert_eq!(node.occupancy(), 2);

        node.last_index.store(-1, WRITE_ORD);
        assert_eq!(node.occupancy(), 2);
    }

    #[test]
    fn test_search_leaf_found_and_miss() {
        let arena = NodeArena::new();
        let (_, node) = arena.alloc(0);
        locked_insert(node, 20, 7);
        assert_eq!(node.search_leaf(&arena, 20), LeafHit::Found(7));
        assert_eq!(node.search_leaf(&arena, 21), LeafHit::Miss);
    }

    #[test]
    fn test_search_leaf_forwards_to_covering_sibling() {
        let arena = NodeArena::new();
        let (a_id, a) = arena.alloc(0);
        let (b_id, b) = arena.alloc(0);
        let _ = a_id;
        locked_insert(a, 5, 1);
        locked_insert(b, 10, 2);
        a.set_sibling(b_id);

        assert_eq!(a.search_leaf(&arena, 10), LeafHit::Forward(b_id));
        assert_eq!(a.search_leaf(&arena, 7), LeafHit::Miss);
        assert_eq!(a.search_leaf(&arena, 5), LeafHit::Found(1));
    }

    #[test]
    fn test_route_picks_covering_child() {
        let arena = NodeArena::new();
        let (lm_id, _) = arena.alloc(0);
        let (c1_id, _) = arena.alloc(0);
        let (c2_id, _) = arena.alloc(0);
        let (_, parent) = arena.alloc(1);
        parent.set_leftmost(lm_id);
        locked_insert(parent, 10, c1_id.to_slot());
        locked_insert(parent, 20, c2_id.to_slot());

        assert_eq!(parent.route(&arena, 5), Some(lm_id));
        // A key equal to a separator descends left; the leaf chain walk
        // reaches any duplicates sitting right of the boundary.
        assert_eq!(parent.route(&arena, 10), Some(lm_id));
        assert_eq!(parent.route(&arena, 11), Some(c1_id));
        assert_eq!(parent.route(&arena, 19), Some(c1_id));
        assert_eq!(parent.route(&arena, 20), Some(c1_id));
        assert_eq!(parent.route(&arena, 21), Some(c2_id));
        assert_eq!(parent.route(&arena, 1000), Some(c2_id));
    }

    #[test]
    fn test_route_hands_off_to_sibling() {
        let arena = NodeArena::new();
        let (lm_id, _) = arena.alloc(0);
        let (c_id, _) = arena.alloc(0);
        let (_, parent) = arena.alloc(1);
        let (sib_id, sib) = arena.alloc(1);
        parent.set_leftmost(lm_id);
        locked_insert(parent, 10, c_id.to_slot());
        locked_insert(sib, 30, c_id.to_slot());
        parent.set_sibling(sib_id);

        assert_eq!(parent.route(&arena, 31), Some(sib_id));
        assert_eq!(parent.route(&arena, 30), Some(c_id), "equal first key stays");
        assert_eq!(parent.route(&arena, 29), Some(c_id));
    }

    #[test]
    fn test_collect_range_is_exclusive_and_follows_chain() {
        let arena = NodeArena::new();
        let (_, a) = arena.alloc(0);
        let (b_id, b) = arena.alloc(0);
        for (k, s) in [(16, 1), (20, 2), (31, 3)] {
            locked_insert(a, k, s);
        }
        for (k, s) in [(31, 4), (50, 5), (75, 6)] {
            locked_insert(b, k, s);
        }
        a.set_sibling(b_id);

        let mut out = Vec::new();
        a.collect_range(&arena, 10, 51, &mut out);
        let raw: Vec<u64> = out.iter().map(|p| p.get()).collect();
        assert_eq!(raw, vec![1, 2, 3, 4, 5]);

        // Exclusive bounds on both ends.
        out.clear();
        a.collect_range(&arena, 16, 31, &mut out);
        let raw: Vec<u64> = out.iter().map(|p| p.get()).collect();
        assert_eq!(raw, vec![2]);
    }

    #[test]
    fn test_split_point_avoids_straddling_duplicates() {
        let node = Node::empty();
        for (k, s) in [(16, 1), (20, 2), (31, 3), (31, 4), (75, 5)] {
            locked_insert(&node, k, s);
        }
        // The median (index 3) falls inside the run of 31s; the split must
        // land on a distinct-key boundary instead.
        let m = node.split_point(5);
        assert_ne!(node.key_at(m - 1), node.key_at(m));
    }

    #[test]
    fn test_split_point_all_equal_falls_back_to_median() {
        let node = Node::empty();
        for s in 1..=5 {
            locked_insert(&node, 31, s);
        }
        assert_eq!(node.split_point(5), 3);
    }

    #[test]
    fn test_parent_link_of() {
        let arena = NodeArena::new();
        let (lm_id, _) = arena.alloc(0);
        let (c1_id, _) = arena.alloc(0);
        let (c2_id, _) = arena.alloc(0);
        let (other_id, _) = arena.alloc(0);
        let (_, parent) = arena.alloc(1);
        parent.set_leftmost(lm_id);
        locked_insert(parent, 10, c1_id.to_slot());
        locked_insert(parent, 20, c2_id.to_slot());

        let guard = parent.version().lock();
        assert_eq!(
            parent.parent_link_of(&guard, lm_id),
            Some(ParentLink::Leftmost)
        );
        assert_eq!(
            parent.parent_link_of(&guard, c1_id),
            Some(ParentLink::Interior {
                separator: 10,
                left: lm_id
            })
        );
        assert_eq!(
            parent.parent_link_of(&guard, c2_id),
            Some(ParentLink::Interior {
                separator: 20,
                left: c1_id
            })
        );
        assert_eq!(parent.parent_link_of(&guard, other_id), None);
    }
}
