//! Filepath: src/arena.rs
//!
//! Append-only node arena with stable handles.
//!
//! Nodes are addressed by [`NodeId`] indices instead of raw pointers. The
//! arena grows in fixed-size segments that are allocated once and never
//! moved or freed, so a `NodeId` handed out at any point stays valid for
//! the lifetime of the arena. Tombstoned nodes are intentionally never
//! reclaimed: lock-free readers may still be traversing them, and their
//! remaining valid is what keeps those reads memory-safe.
//!
//! # Concurrency
//!
//! Allocation bumps an atomic cursor; segment growth is serialized behind a
//! [`parking_lot::Mutex`] while lookups stay lock-free (a single Acquire
//! load of the segment pointer).

use std::sync::atomic::{AtomicPtr, AtomicU32};

use parking_lot::Mutex;

use crate::node::Node;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};

/// Nodes per segment.
const SEGMENT_LEN: usize = 1 << 12;

/// Maximum number of segments in the directory.
///
/// Bounds the arena at a few million nodes. Exhaustion is fatal; there is
/// no reclamation to fall back on.
const MAX_SEGMENTS: usize = 1024;

// ============================================================================
//  NodeId
// ============================================================================

/// A stable handle to a node in the arena.
///
/// Id 0 is reserved as the null handle and is never allocated, so a zero
/// slot word inside a node unambiguously means "no entry".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Wrap a raw index known to be non-zero (e.g. the tree's root word).
    #[inline]
    pub(crate) const fn new(raw: u32) -> Self {
        debug_assert!(raw != 0, "null handle");
        Self(raw)
    }

    /// Raw index value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Encode this id into a node slot word.
    #[inline]
    pub(crate) const fn to_slot(self) -> u64 {
        self.0 as u64
    }

    /// Decode an id from a node slot word. Zero decodes to `None`.
    #[inline]
    pub(crate) fn from_slot(raw: u64) -> Option<Self> {
        u32::try_from(raw).ok().filter(|&id| id != 0).map(Self)
    }

    /// Decode an id from a raw header field. Zero decodes to `None`.
    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

// ============================================================================
//  NodeArena
// ============================================================================

/// Append-only arena owning every node of one tree.
pub struct NodeArena {
    /// Segment directory. Entries are null until their segment exists.
    segments: Box<[AtomicPtr<Node>]>,

    /// Next id to hand out. Starts at 1; id 0 is the null handle.
    next: AtomicU32,

    /// Serializes segment creation. Lookups never take it.
    grow: Mutex<()>,
}

impl NodeArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        let segments: Vec<AtomicPtr<Node>> = (0..MAX_SEGMENTS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self {
            segments: segments.into_boxed_slice(),
            next: AtomicU32::new(1),
            grow: Mutex::new(()),
        }
    }

    /// Allocate a fresh, empty node at the given tree level.
    ///
    /// The returned node is not yet reachable from the tree; the caller
    /// publishes it by linking it into a parent, a sibling chain, or the
    /// root reference.
    ///
    /// # Panics
    /// Panics when the segment directory is exhausted or the segment
    /// allocation itself fails. Allocation failure is fatal in this design;
    /// there is no recovery path.
    pub fn alloc(&self, level: u32) -> (NodeId, &Node) {
        let id: u32 = self.next.fetch_add(1, RELAXED);
        let seg: usize = id as usize / SEGMENT_LEN;
        assert!(seg < MAX_SEGMENTS, "node arena exhausted");

        let base: *mut Node = self.segment(seg);
        // The slot has never been handed out, so the node is pristine.
        let node: &Node = unsafe { &*base.add(id as usize % SEGMENT_LEN) };
        node.init_level(level);
        (NodeId(id), node)
    }

    /// Resolve a handle to its node.
    ///
    /// Valid for any id previously returned by [`alloc`](Self::alloc);
    /// tombstoned nodes resolve like live ones.
    #[inline]
    #[must_use]
    pub fn get(&self, id: NodeId) -> &Node {
        let seg: usize = id.0 as usize / SEGMENT_LEN;
        debug_assert!(seg < MAX_SEGMENTS, "node id out of range");
        let base: *mut Node = self.segments[seg].load(READ_ORD);
        debug_assert!(!base.is_null(), "node id references a missing segment");
        unsafe { &*base.add(id.0 as usize % SEGMENT_LEN) }
    }

    /// Number of nodes allocated so far, live and tombstoned alike.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.next.load(RELAXED) as usize - 1
    }

    /// Check whether no node has been allocated yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the base pointer of segment `seg`, creating it if needed.
    fn segment(&self, seg: usize) -> *mut Node {
        let existing: *mut Node = self.segments[seg].load(READ_ORD);
        if !existing.is_null() {
            return existing;
        }

        let _growth = self.grow.lock();
        // Re-check under the lock; another thread may have grown first.
        let existing: *mut Node = self.segments[seg].load(READ_ORD);
        if !existing.is_null() {
            return existing;
        }

        let nodes: Box<[Node]> = (0..SEGMENT_LEN).map(|_| Node::empty()).collect();
        let base: *mut Node = Box::into_raw(nodes).cast::<Node>();
        self.segments[seg].store(base, WRITE_ORD);
        base
    }
}

impl Drop for NodeArena {
    fn drop(&mut self) {
        // Drop requires unique access, so no reader can still hold a node.
        for slot in self.segments.iter() {
            let base: *mut Node = slot.load(RELAXED);
            if !base.is_null() {
                let raw: *mut [Node] = std::ptr::slice_from_raw_parts_mut(base, SEGMENT_LEN);
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeArena")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
