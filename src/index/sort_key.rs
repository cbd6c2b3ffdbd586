//! Sort Keys
//!
//! What a sort key factory answers for an object, and the descending recency
//! key used by the MRU cache.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of a sort key factory for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortKey<S> {
    /// Place the object at this position (moving it if already present).
    Sort(S),
    /// Remove the object from the sort.
    Delete,
    /// Leave the object where it is.
    Ignore,
}

impl<S> SortKey<S> {
    /// The sort value, if this is a [`SortKey::Sort`].
    pub fn value(&self) -> Option<&S> {
        match self {
            SortKey::Sort(value) => Some(value),
            SortKey::Delete | SortKey::Ignore => None,
        }
    }
}

impl<S> From<Option<S>> for SortKey<S> {
    /// `None` deletes.
    fn from(value: Option<S>) -> Self {
        match value {
            Some(value) => SortKey::Sort(value),
            None => SortKey::Delete,
        }
    }
}

// =============================================================================
// Descending Long
// =============================================================================

/// An `i64` that sorts in descending order.
///
/// Equal values are ordered by a tie-break, also descending, so that of two
/// keys created with the same value the one created later comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescendingLong {
    value: i64,
    tie: u64,
}

impl DescendingLong {
    /// Key for `value`, taking the next tie-break from `ties`.
    pub fn new(value: i64, ties: &TieBreaker) -> Self {
        Self {
            value,
            tie: ties.next(),
        }
    }

    /// Key with an explicit tie-break.
    pub fn with_tie(value: i64, tie: u64) -> Self {
        Self { value, tie }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn tie(&self) -> u64 {
        self.tie
    }
}

impl Ord for DescendingLong {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .value
            .cmp(&self.value)
            .then_with(|| other.tie.cmp(&self.tie))
    }
}

impl PartialOrd for DescendingLong {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DescendingLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.value, self.tie)
    }
}

/// Monotonic source of tie-breaks for [`DescendingLong`].
#[derive(Debug, Default)]
pub struct TieBreaker {
    next: AtomicU64,
}

impl TieBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next tie-break; strictly greater than all previous ones.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
