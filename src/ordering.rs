//! Standard memory orderings for concurrent node access.
//!
//! Naming the orderings keeps the intent visible at each access site and
//! keeps usage consistent across the codebase.

use std::sync::atomic::Ordering;

/// Ordering for reading node fields on optimistic paths.
/// Pairs with writer Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for writing node fields under lock.
/// Pairs with reader Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for a successful compare-and-swap (lock acquisition, root swap).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for a failed compare-and-swap.
/// Only the current value needs to be observed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for loads inside a locked region.
/// The lock already provides the synchronization.
pub const RELAXED: Ordering = Ordering::Relaxed;
