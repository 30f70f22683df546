//! Per-thread growable slot table.
//!
//! A [`SlotTable`] is an array of type-erased values indexed by [`SlotIndex`],
//! pre-filled with the [`SlotValue::Unset`] sentinel. It belongs to exactly one
//! thread and is only reached through a [`TableHandle`], which is `!Send`.
//!
//! ## Growth
//!
//! Capacity starts at [`INITIAL_CAPACITY`] and only ever grows: `expand`
//! doubles until the requested index fits, keeps existing contents in place
//! and fills the new tail with `Unset`. Expansions get exponentially rarer, so
//! `set` is amortized O(1). Reads past the end are not errors; they simply see
//! `Unset`.
//!
//! ## Borrow discipline
//!
//! Operations that overwrite a slot hand the previous value back to the
//! caller instead of dropping it, so user destructors never run while the
//! table is mutably borrowed.

use core::fmt;
use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::config::{SentinelPolicy, sentinel_policy};
use crate::error::{ExhaustedResource, LocalError, Result};
use crate::metrics::{LocalMetrics, global_metrics};
use crate::registry::{REMOVAL_SET_SLOT, SlotIndex};

/// Capacity of a freshly created table.
pub const INITIAL_CAPACITY: usize = 32;

/// Largest capacity a table may grow to (covers every allocatable index).
pub const MAX_TABLE_CAPACITY: usize = 1 << 31;

/// Contents of one slot.
#[derive(Clone, Default)]
pub enum SlotValue {
    /// Nothing stored. Distinct from any stored value, including `None`.
    #[default]
    Unset,
    /// A stored value.
    Set(Rc<dyn Any>),
}

impl SlotValue {
    /// Wrap a value.
    pub fn new<T: Any>(value: T) -> Self {
        Self::Set(Rc::new(value))
    }

    #[must_use]
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.is_unset()
    }

    /// A typed handle to the stored value, if set and of type `T`.
    #[must_use]
    pub fn downcast<T: Any>(&self) -> Option<Rc<T>> {
        match self {
            Self::Set(value) => Rc::clone(value).downcast::<T>().ok(),
            Self::Unset => None,
        }
    }
}

impl fmt::Debug for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => f.write_str("Unset"),
            Self::Set(_) => f.write_str("Set(..)"),
        }
    }
}

/// Result of storing into a slot.
#[derive(Debug)]
pub struct StoreOutcome {
    /// The slot went from unset to set.
    pub newly_set: bool,
    /// What the slot held before. Drop it after releasing the table borrow.
    pub previous: SlotValue,
}

/// Growable array of slot values owned by one thread.
pub struct SlotTable {
    slots: Vec<SlotValue>,
    policy: SentinelPolicy,
}

impl SlotTable {
    /// Create a table using the process sentinel policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(sentinel_policy())
    }

    /// Create a table with an explicit sentinel policy.
    #[must_use]
    pub fn with_policy(policy: SentinelPolicy) -> Self {
        LocalMetrics::inc(&global_metrics().tables_created);
        Self {
            slots: vec![SlotValue::Unset; INITIAL_CAPACITY],
            policy,
        }
    }

    /// Current number of addressable slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn sentinel_policy(&self) -> SentinelPolicy {
        self.policy
    }

    /// Read a slot. Slots beyond capacity read as `Unset`.
    #[must_use]
    pub fn get(&self, slot: SlotIndex) -> SlotValue {
        self.slots.get(slot.get()).cloned().unwrap_or_default()
    }

    /// Store `value`, growing the table if needed.
    pub fn set(&mut self, slot: SlotIndex, value: Rc<dyn Any>) -> Result<StoreOutcome> {
        let index = slot.get();
        if index >= self.slots.len() {
            self.expand(index)?;
        }
        let previous = core::mem::replace(&mut self.slots[index], SlotValue::Set(value));
        Ok(StoreOutcome {
            newly_set: previous.is_unset(),
            previous,
        })
    }

    /// Store a raw entry, which may be the sentinel.
    ///
    /// Storing `Unset` is a misuse: under the strict policy it fails with
    /// `MisuseOfSentinel`, under the lenient policy it removes the slot.
    pub fn set_entry(&mut self, slot: SlotIndex, entry: SlotValue) -> Result<StoreOutcome> {
        match entry {
            SlotValue::Set(value) => self.set(slot, value),
            SlotValue::Unset if self.policy.rejects_sentinel() => {
                Err(LocalError::MisuseOfSentinel { slot })
            }
            SlotValue::Unset => Ok(StoreOutcome {
                newly_set: false,
                previous: self.remove(slot),
            }),
        }
    }

    /// Reset a slot to `Unset`, returning what it held.
    ///
    /// Out-of-capacity slots hold nothing, so removing them is a no-op.
    pub fn remove(&mut self, slot: SlotIndex) -> SlotValue {
        self.slots
            .get_mut(slot.get())
            .map(core::mem::take)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_set(&self, slot: SlotIndex) -> bool {
        self.slots.get(slot.get()).is_some_and(SlotValue::is_set)
    }

    /// Grow until `to_index` is addressable.
    ///
    /// Capacity doubles until it exceeds `to_index`. Fails without touching
    /// the table if that would pass [`MAX_TABLE_CAPACITY`].
    pub fn expand(&mut self, to_index: usize) -> Result<()> {
        let old_capacity = self.slots.len();
        let mut new_capacity = old_capacity.max(1);
        while new_capacity <= to_index {
            new_capacity = new_capacity
                .checked_mul(2)
                .filter(|&c| c <= MAX_TABLE_CAPACITY)
                .ok_or(LocalError::ResourceExhausted {
                    resource: ExhaustedResource::TableCapacity,
                    limit: MAX_TABLE_CAPACITY,
                })?;
        }
        if new_capacity > old_capacity {
            self.slots.resize(new_capacity, SlotValue::Unset);
            LocalMetrics::inc(&global_metrics().table_expansions);
        }
        Ok(())
    }

    /// Number of populated variable slots (the reserved removal-set slot is
    /// not counted).
    #[must_use]
    pub fn size(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, v)| *i != REMOVAL_SET_SLOT.get() && v.is_set())
            .count()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Shared handle to one thread's slot table.
///
/// Cloning is cheap and yields a handle to the same table. The handle cannot
/// leave its thread.
#[derive(Clone, Default)]
pub struct TableHandle(Rc<RefCell<SlotTable>>);

impl TableHandle {
    /// A handle to a fresh table.
    #[must_use]
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SlotTable::new())))
    }

    /// Wrap an existing table.
    #[must_use]
    pub fn from_table(table: SlotTable) -> Self {
        Self(Rc::new(RefCell::new(table)))
    }

    /// Read-only view of the table.
    ///
    /// # Panics
    ///
    /// Panics if the table is being mutated further up the stack, which only
    /// happens if this is called from inside a table operation.
    #[must_use]
    pub fn borrow(&self) -> Ref<'_, SlotTable> {
        self.0.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, SlotTable> {
        self.0.borrow_mut()
    }

    /// Swap in a fresh table, returning the old one so its values are dropped
    /// outside the borrow.
    pub(crate) fn reset(&self) -> SlotTable {
        self.0.replace(SlotTable::new())
    }

    /// True if both handles refer to the same table.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.borrow().capacity()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.borrow().size()
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TableHandle").field(&*self.borrow()).finish()
    }
}
