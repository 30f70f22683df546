//! Process-wide slot index allocation.
//!
//! Every [`ThreadLocalVariable`] is assigned exactly one [`SlotIndex`] when it
//! is constructed. Indices are handed out by a monotonic atomic counter and are
//! never recycled: a slot, once given meaning, must not be reinterpreted for a
//! different variable while stale values may still sit in some thread's table.
//!
//! Slot 0 is reserved for the per-thread removal-tracking set, so the global
//! registry starts counting at 1.
//!
//! [`ThreadLocalVariable`]: crate::ThreadLocalVariable

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{ExhaustedResource, LocalError, Result};
use crate::metrics::{LocalMetrics, global_metrics};

/// Largest index the registry will ever hand out (`i32::MAX`).
pub const MAX_SLOT_INDEX: usize = i32::MAX as usize;

/// Slot holding each thread's removal-tracking set.
pub const REMOVAL_SET_SLOT: SlotIndex = SlotIndex(0);

/// First index available to variables.
const FIRST_VARIABLE_SLOT: usize = 1;

/// Position of one variable's value in every thread's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub(crate) const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw table position.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic allocator of slot indices.
#[derive(Debug)]
pub struct IndexRegistry {
    first: usize,
    next: AtomicUsize,
}

impl IndexRegistry {
    /// A registry whose first index is 1 (slot 0 stays reserved).
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(FIRST_VARIABLE_SLOT)
    }

    /// A registry whose first index is `first`.
    #[must_use]
    pub const fn starting_at(first: usize) -> Self {
        Self {
            first,
            next: AtomicUsize::new(first),
        }
    }

    /// Allocate the next index.
    ///
    /// Fails with `ResourceExhausted` once [`MAX_SLOT_INDEX`] has been handed
    /// out. The counter never moves past the limit, so a failed allocation
    /// leaves the registry unchanged.
    pub fn allocate(&self) -> Result<SlotIndex> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n <= MAX_SLOT_INDEX).then_some(n + 1)
            })
            .map(SlotIndex)
            .map_err(|_| LocalError::ResourceExhausted {
                resource: ExhaustedResource::SlotIndices,
                limit: MAX_SLOT_INDEX,
            })
    }

    /// The most recently allocated index, if any.
    #[must_use]
    pub fn last_allocated(&self) -> Option<SlotIndex> {
        let next = self.next.load(Ordering::Relaxed);
        (next > self.first).then(|| SlotIndex(next - 1))
    }

    /// Number of indices handed out so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.next.load(Ordering::Relaxed) - self.first
    }
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: IndexRegistry = IndexRegistry::new();

/// The registry every [`ThreadLocalVariable`](crate::ThreadLocalVariable) draws from.
#[must_use]
pub fn global_registry() -> &'static IndexRegistry {
    &GLOBAL_REGISTRY
}

/// Allocate a variable slot from the global registry.
pub(crate) fn allocate_variable_slot() -> Result<SlotIndex> {
    let slot = GLOBAL_REGISTRY.allocate()?;
    LocalMetrics::inc(&global_metrics().variables_registered);
    Ok(slot)
}
