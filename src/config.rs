//! Page geometry and the key/payload scalar types.
//!
//! Node capacity is derived from a logical page size at compile time. A
//! smaller page means fewer entries per node, which trades fan-out for
//! finer-grained write locking and more tree levels.

use std::num::NonZeroU64;

/// Logical page size of one node, in bytes.
pub const PAGE_BYTES: usize = 128;

/// Bytes reserved for the node header inside a page.
pub const HEADER_BYTES: usize = 32;

/// Bytes per entry slot (key + payload word).
pub const ENTRY_BYTES: usize = 16;

/// Number of entry slots in a node.
///
/// A node never holds more than `CARDINALITY - 1` live entries; the last
/// slot always stays null so that scans terminate on a null payload.
pub const CARDINALITY: usize = (PAGE_BYTES - HEADER_BYTES) / ENTRY_BYTES;

/// The key type indexed by the tree.
///
/// Keys are totally ordered 64-bit signed scalars. Duplicates are allowed;
/// the tree behaves as a secondary index.
pub type Key = i64;

/// Sentinel key stored in unused slots.
///
/// Valid user keys must be strictly less than this value.
pub const KEY_SENTINEL: Key = i64::MAX;

// ============================================================================
//  PayloadRef
// ============================================================================

/// An opaque, non-null payload reference stored in leaf entries.
///
/// The tree never interprets the payload. Callers typically store a record
/// address, a row id, or any other non-zero 64-bit handle. Zero is reserved
/// as the null slot marker inside nodes, which is why a payload can never
/// be zero.
///
/// # Example
///
/// ```rust
/// use blinktree::PayloadRef;
///
/// let p = PayloadRef::new(42).unwrap();
/// assert_eq!(p.get(), 42);
/// assert!(PayloadRef::new(0).is_none());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PayloadRef(NonZeroU64);

impl PayloadRef {
    /// Create a payload reference from a raw handle.
    ///
    /// # Returns
    /// `None` if `raw` is zero.
    #[inline]
    #[must_use]
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Create a payload reference from the address of a caller record.
    ///
    /// References are never null, so this cannot fail.
    #[inline]
    #[must_use]
    pub fn from_addr<T>(record: &T) -> Self {
        Self(NonZeroU64::new(std::ptr::from_ref(record) as u64).unwrap_or(NonZeroU64::MIN))
    }

    /// Get the raw handle back.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Encode for storage in a node slot.
    #[inline]
    pub(crate) const fn to_slot(self) -> u64 {
        self.0.get()
    }

    /// Decode from a node slot word.
    ///
    /// A zero word is the null slot marker, not a payload.
    #[inline]
    pub(crate) fn from_slot(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

impl From<NonZeroU64> for PayloadRef {
    fn from(raw: NonZeroU64) -> Self {
        Self(raw)
    }
}
