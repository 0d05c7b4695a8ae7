//! # `BLinkTree`
//!
//! A concurrent, in-memory B+tree index with lock-free optimistic reads
//! and fine-grained per-node write locking.
//!
//! The tree is built from fixed-capacity nodes sized to a small logical
//! page, linked rightward per level into sibling chains. Readers never
//! block: they validate every scan against a per-node version word and
//! retry on interference. Writers lock only the node they restructure,
//! never the descent path, and recover from concurrent splits and merges
//! through the sibling chain and restart-from-root.
//!
//! | Feature | Status |
//! |---------|--------|
//! | Point insert | Lock-free descent, per-node locked placement |
//! | Point search | Lock-free, version-validated |
//! | Range scan | Lock-free, follows the leaf sibling chain |
//! | Duplicate-aware delete | Removes exactly one occurrence |
//! | Split / merge / redistribution | Under concurrent mutation |
//! | Memory reclamation | None by design; tombstones stay readable |
//!
//! ## Thread Safety
//!
//! [`BLinkTree`] is `Send + Sync`; every operation takes `&self`. Share it
//! across threads with `Arc`:
//!
//! ```rust
//! use blinktree::{BLinkTree, PayloadRef};
//! use std::sync::Arc;
//!
//! let tree = Arc::new(BLinkTree::new());
//! let t = Arc::clone(&tree);
//! let handle = std::thread::spawn(move || {
//!     t.insert(31, PayloadRef::new(1000).unwrap());
//! });
//! handle.join().unwrap();
//!
//! assert!(tree.get(31).is_some());
//! ```
//!
//! ## Keys and Payloads
//!
//! Keys are `i64`, strictly below `i64::MAX` (the empty-slot sentinel).
//! Keys need not be unique; the tree behaves as a secondary index and
//! duplicates accumulate. Payloads are opaque non-zero 64-bit handles
//! ([`PayloadRef`]), typically record addresses or row ids.
//!
//! ## Resource Model
//!
//! Nodes live in an append-only arena and are never freed while the tree
//! exists, tombstoned or not. That guarantee is what makes the lock-free
//! read paths safe: a reader overtaken by a merge keeps scanning a valid,
//! merely outdated, node. Memory use is therefore monotonic; dropping the
//! tree releases everything at once.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod arena;
pub mod config;
pub mod node;
pub mod ordering;
mod trace;
pub mod tree;
pub mod version;

pub use config::{Key, PayloadRef, CARDINALITY, KEY_SENTINEL};
pub use tree::BLinkTree;
