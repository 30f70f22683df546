//! The public thread-local variable handle.
//!
//! A [`ThreadLocalVariable`] owns one slot index for its whole life and keeps
//! its per-thread value in that slot of the calling thread's table. The first
//! time a variable is set on a thread it registers itself in that thread's
//! removal set. The set is stored in slot 0 of the same table, so
//! [`remove_all`] can find and clear exactly the variables the thread touched
//! without any process-wide map keyed by thread.
//!
//! Membership in the removal set mirrors "slot is set": `set`, `get` (when it
//! initializes) and `remove` keep the two synchronized, so the set never holds
//! more entries than the thread has live values.

use core::fmt;
use core::hash::{Hash, Hasher};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::carrier::{
    SlotTableCarrier, current_table, current_table_if_set, destroy_fallback,
    discard_current_table, release_carried,
};
use crate::config::runtime_config;
use crate::error::Result;
use crate::metrics::{LocalMetrics, global_metrics};
use crate::registry::{REMOVAL_SET_SLOT, SlotIndex, allocate_variable_slot};
use crate::slot_table::{SlotValue, TableHandle};
use crate::watcher;

type Initializer<V> = Box<dyn Fn() -> V + Send + Sync>;
type RemovalHook<V> = Box<dyn Fn(&V) + Send + Sync>;

// -----------------------------------------------------------------------------
// Removal bookkeeping
// -----------------------------------------------------------------------------

/// Type-erased view of a variable, as seen by the removal set.
trait TrackedVariable {
    fn slot(&self) -> SlotIndex;

    /// Reset this variable's slot in `table`, running its removal hook.
    fn clear_in(&self, table: &TableHandle);
}

/// Variables holding a value on one thread, keyed by slot.
#[derive(Default)]
struct RemovalSet {
    members: RefCell<HashMap<SlotIndex, Arc<dyn TrackedVariable>>>,
}

impl RemovalSet {
    fn insert(&self, variable: Arc<dyn TrackedVariable>) {
        let replaced = self.members.borrow_mut().insert(variable.slot(), variable);
        drop(replaced);
    }

    fn remove(&self, slot: SlotIndex) {
        let removed = self.members.borrow_mut().remove(&slot);
        drop(removed);
    }

    /// Empty the set, returning members in slot order.
    fn drain(&self) -> Vec<Arc<dyn TrackedVariable>> {
        let mut drained: Vec<_> = self.members.borrow_mut().drain().map(|(_, v)| v).collect();
        drained.sort_by_key(|v| v.slot());
        drained
    }

    fn len(&self) -> usize {
        self.members.borrow().len()
    }
}

fn existing_removal_set(table: &TableHandle) -> Option<Rc<RemovalSet>> {
    let entry = table.borrow().get(REMOVAL_SET_SLOT);
    entry.downcast::<RemovalSet>()
}

fn removal_set(table: &TableHandle) -> Result<Rc<RemovalSet>> {
    if let Some(set) = existing_removal_set(table) {
        return Ok(set);
    }
    let set = Rc::new(RemovalSet::default());
    let outcome = table.borrow_mut().set(REMOVAL_SET_SLOT, set.clone())?;
    drop(outcome);
    if runtime_config().death_watch {
        watcher::track_current_thread();
    }
    Ok(set)
}

// -----------------------------------------------------------------------------
// Variable
// -----------------------------------------------------------------------------

struct VariableInner<V> {
    slot: SlotIndex,
    initial: Initializer<V>,
    on_removal: Option<RemovalHook<V>>,
}

impl<V: 'static> TrackedVariable for VariableInner<V> {
    fn slot(&self) -> SlotIndex {
        self.slot
    }

    fn clear_in(&self, table: &TableHandle) {
        let removed = table.borrow_mut().remove(self.slot);
        self.run_hook(&removed);
    }
}

impl<V: 'static> VariableInner<V> {
    fn run_hook(&self, removed: &SlotValue) {
        if let (Some(hook), Some(value)) = (&self.on_removal, removed.downcast::<V>()) {
            hook(&*value);
        }
    }
}

/// A raw value for [`ThreadLocalVariable::store`]: a real value, or the
/// reserved unset sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<V> {
    /// The sentinel. Storing it is a misuse, handled per
    /// [`SentinelPolicy`](crate::SentinelPolicy).
    Unset,
    Set(V),
}

/// A variable with an independent value on every thread.
///
/// Cloning yields another handle to the same variable (same slot).
pub struct ThreadLocalVariable<V: 'static> {
    inner: Arc<VariableInner<V>>,
}

impl<V: 'static> ThreadLocalVariable<V> {
    /// A variable whose initial value is `V::default()`.
    pub fn new() -> Result<Self>
    where
        V: Default,
    {
        Self::with_initial(V::default)
    }

    /// A variable whose initial value is produced by `initial`, once per
    /// thread, on the first `get`.
    pub fn with_initial<F>(initial: F) -> Result<Self>
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        Self::builder(initial).build()
    }

    /// Start building a variable with extra hooks.
    pub fn builder<F>(initial: F) -> VariableBuilder<V>
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        VariableBuilder {
            initial: Box::new(initial),
            on_removal: None,
        }
    }

    /// The slot this variable occupies in every thread's table.
    #[must_use]
    pub fn slot(&self) -> SlotIndex {
        self.inner.slot
    }

    /// This thread's value, initializing it on first access.
    pub fn get(&self) -> Result<V>
    where
        V: Clone,
    {
        self.get_in(&current_table())
    }

    pub fn get_in<C>(&self, carrier: &C) -> Result<V>
    where
        C: SlotTableCarrier + ?Sized,
        V: Clone,
    {
        self.with_in(carrier, V::clone)
    }

    /// Run `f` on this thread's value, initializing it on first access.
    ///
    /// No table borrow is held while `f` runs, so `f` may use other
    /// variables freely.
    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> Result<R> {
        self.with_in(&current_table(), f)
    }

    pub fn with_in<C, R>(&self, carrier: &C, f: impl FnOnce(&V) -> R) -> Result<R>
    where
        C: SlotTableCarrier + ?Sized,
    {
        let value = self.value_in(carrier.slot_table())?;
        Ok(f(&*value))
    }

    /// Store `value` for this thread.
    pub fn set(&self, value: V) -> Result<()> {
        self.set_in(&current_table(), value)
    }

    pub fn set_in<C>(&self, carrier: &C, value: V) -> Result<()>
    where
        C: SlotTableCarrier + ?Sized,
    {
        let previous = self.store_value(carrier.slot_table(), Rc::new(value))?;
        drop(previous);
        Ok(())
    }

    /// Store `value`, returning the value it replaced, if any.
    ///
    /// The replaced value is handed back rather than removed, so the removal
    /// hook does not run.
    pub fn replace(&self, value: V) -> Result<Option<V>>
    where
        V: Clone,
    {
        self.replace_in(&current_table(), value)
    }

    pub fn replace_in<C>(&self, carrier: &C, value: V) -> Result<Option<V>>
    where
        C: SlotTableCarrier + ?Sized,
        V: Clone,
    {
        let previous = self.store_value(carrier.slot_table(), Rc::new(value))?;
        Ok(previous.downcast::<V>().map(Rc::unwrap_or_clone))
    }

    /// Store a raw entry.
    ///
    /// `Entry::Unset` fails with
    /// [`LocalError::MisuseOfSentinel`](crate::LocalError::MisuseOfSentinel)
    /// under the strict policy and acts as [`remove`](Self::remove) under the
    /// lenient one.
    pub fn store(&self, entry: Entry<V>) -> Result<()> {
        self.store_in(&current_table(), entry)
    }

    pub fn store_in<C>(&self, carrier: &C, entry: Entry<V>) -> Result<()>
    where
        C: SlotTableCarrier + ?Sized,
    {
        let table = carrier.slot_table();
        let raw = match entry {
            Entry::Set(value) => SlotValue::new(value),
            Entry::Unset => SlotValue::Unset,
        };
        let outcome = table.borrow_mut().set_entry(self.slot(), raw)?;
        if outcome.newly_set {
            removal_set(table)?.insert(self.inner.clone());
        } else if !self.is_set_in(table) {
            // Lenient sentinel store: the slot was removed.
            self.untrack(table);
            self.inner.run_hook(&outcome.previous);
        }
        drop(outcome);
        Ok(())
    }

    /// Take this thread's value out, leaving the variable unset.
    ///
    /// Like [`replace`](Self::replace), the removal hook does not run.
    pub fn take(&self) -> Option<V>
    where
        V: Clone,
    {
        current_table_if_set().and_then(|table| self.take_in(&table))
    }

    pub fn take_in<C>(&self, carrier: &C) -> Option<V>
    where
        C: SlotTableCarrier + ?Sized,
        V: Clone,
    {
        let table = carrier.slot_table();
        self.untrack(table);
        let removed = table.borrow_mut().remove(self.slot());
        removed.downcast::<V>().map(Rc::unwrap_or_clone)
    }

    /// Unset this thread's value. A no-op if the thread has no table yet.
    pub fn remove(&self) {
        if let Some(table) = current_table_if_set() {
            self.remove_in(&table);
        }
    }

    pub fn remove_in<C>(&self, carrier: &C)
    where
        C: SlotTableCarrier + ?Sized,
    {
        let table = carrier.slot_table();
        self.untrack(table);
        self.inner.clear_in(table);
    }

    /// True if this thread holds a value. Never creates a table.
    #[must_use]
    pub fn is_set(&self) -> bool {
        current_table_if_set().is_some_and(|table| self.is_set_in(&table))
    }

    #[must_use]
    pub fn is_set_in<C>(&self, carrier: &C) -> bool
    where
        C: SlotTableCarrier + ?Sized,
    {
        carrier.slot_table().borrow().is_set(self.slot())
    }

    fn value_in(&self, table: &TableHandle) -> Result<Rc<V>> {
        let current = table.borrow().get(self.slot());
        match current.downcast::<V>() {
            Some(value) => Ok(value),
            None => self.initialize_in(table),
        }
    }

    fn initialize_in(&self, table: &TableHandle) -> Result<Rc<V>> {
        LocalMetrics::inc(&global_metrics().initializations);
        let value = Rc::new((self.inner.initial)());
        let previous = self.store_value(table, Rc::clone(&value))?;
        drop(previous);
        Ok(value)
    }

    /// Store and register on first set. Returns the replaced slot contents,
    /// for the caller to drop once no borrow is held.
    fn store_value(&self, table: &TableHandle, value: Rc<V>) -> Result<SlotValue> {
        let outcome = table.borrow_mut().set(self.slot(), value)?;
        if outcome.newly_set {
            removal_set(table)?.insert(self.inner.clone());
        }
        Ok(outcome.previous)
    }

    fn untrack(&self, table: &TableHandle) {
        if let Some(set) = existing_removal_set(table) {
            set.remove(self.slot());
        }
    }
}

impl<V: 'static> Clone for ThreadLocalVariable<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: 'static> PartialEq for ThreadLocalVariable<V> {
    fn eq(&self, other: &Self) -> bool {
        self.slot() == other.slot()
    }
}

impl<V: 'static> Eq for ThreadLocalVariable<V> {}

impl<V: 'static> Hash for ThreadLocalVariable<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot().hash(state);
    }
}

impl<V: 'static> fmt::Debug for ThreadLocalVariable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalVariable")
            .field("slot", &self.slot())
            .field("on_removal", &self.inner.on_removal.is_some())
            .finish()
    }
}

/// Builder returned by [`ThreadLocalVariable::builder`].
#[must_use]
pub struct VariableBuilder<V> {
    initial: Initializer<V>,
    on_removal: Option<RemovalHook<V>>,
}

impl<V: 'static> VariableBuilder<V> {
    /// Run `hook` with the value whenever a set value is removed through
    /// `remove` or [`remove_all`].
    pub fn on_removal<H>(mut self, hook: H) -> Self
    where
        H: Fn(&V) + Send + Sync + 'static,
    {
        self.on_removal = Some(Box::new(hook));
        self
    }

    /// Allocate the slot. Fails once the process has run out of slot indices.
    pub fn build(self) -> Result<ThreadLocalVariable<V>> {
        let slot = allocate_variable_slot()?;
        Ok(ThreadLocalVariable {
            inner: Arc::new(VariableInner {
                slot,
                initial: self.initial,
                on_removal: self.on_removal,
            }),
        })
    }
}

// -----------------------------------------------------------------------------
// Process-wide operations
// -----------------------------------------------------------------------------

/// Clear every variable set on the calling thread, then discard its table.
///
/// Removal hooks run in slot order. Variables never touched on this thread
/// are unaffected and initialize normally on their next `get`.
pub fn remove_all() {
    if clear_current_table() {
        discard_current_table();
    }
}

/// The last `remove_all` of an exiting table-carrying thread.
///
/// The carried table is released rather than reset.
pub(crate) fn remove_all_on_exit() {
    if clear_current_table() && release_carried().is_none() {
        discard_current_table();
    }
}

/// Untrack the thread, then clear every tracked variable in its table.
/// Returns false if the thread had no table.
fn clear_current_table() -> bool {
    // A thread can be tracked with no live table: its fallback table went
    // stale, or it only ever used explicit tables.
    if runtime_config().death_watch {
        watcher::untrack_current_thread();
    }
    let Some(table) = current_table_if_set() else {
        return false;
    };
    let detached = table.borrow_mut().remove(REMOVAL_SET_SLOT);
    if let Some(set) = detached.downcast::<RemovalSet>() {
        for variable in set.drain() {
            variable.clear_in(&table);
        }
    }
    LocalMetrics::inc(&global_metrics().remove_all_passes);
    true
}

/// Drop every generic thread's fallback table.
///
/// Each stale table is released on its own thread at that thread's next
/// access. Tables of table-carrying threads are untouched.
pub fn destroy() {
    destroy_fallback();
}

/// Number of variables currently set on the calling thread.
#[must_use]
pub fn tracked_variable_count() -> usize {
    current_table_if_set()
        .and_then(|table| existing_removal_set(&table))
        .map_or(0, |set| set.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SentinelPolicy;
    use crate::error::LocalError;
    use crate::slot_table::SlotTable;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn on_fresh_thread<F: FnOnce() + Send + 'static>(f: F) {
        std::thread::spawn(f).join().unwrap();
    }

    fn table_with(policy: SentinelPolicy) -> TableHandle {
        TableHandle::from_table(SlotTable::with_policy(policy))
    }

    #[test]
    fn get_initializes_once_per_thread() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let var = ThreadLocalVariable::with_initial(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            7u32
        })
        .unwrap();

        let v = var.clone();
        on_fresh_thread(move || {
            assert_eq!(v.get().unwrap(), 7);
            assert_eq!(v.get().unwrap(), 7);
            assert!(v.is_set());
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let v = var.clone();
        on_fresh_thread(move || assert_eq!(v.get().unwrap(), 7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_then_get_reinitializes() {
        on_fresh_thread(|| {
            let var = ThreadLocalVariable::<u32>::new().unwrap();
            assert_eq!(var.get().unwrap(), 0);
            var.set(5).unwrap();
            assert_eq!(var.get().unwrap(), 5);
            var.remove();
            assert!(!var.is_set());
            assert_eq!(tracked_variable_count(), 0);
            assert_eq!(var.get().unwrap(), 0);
            assert_eq!(tracked_variable_count(), 1);
        });
    }

    #[test]
    fn untouched_thread_has_no_table() {
        on_fresh_thread(|| {
            let var = ThreadLocalVariable::<u32>::new().unwrap();
            assert!(!var.is_set());
            var.remove();
            assert!(var.take().is_none());
            assert!(current_table_if_set().is_none());
            assert_eq!(tracked_variable_count(), 0);
        });
    }

    #[test]
    fn replace_and_take_hand_back_values() {
        on_fresh_thread(|| {
            let var = ThreadLocalVariable::<String>::new().unwrap();
            assert_eq!(var.replace("a".into()).unwrap(), None);
            assert_eq!(var.replace("b".into()).unwrap(), Some("a".to_string()));
            assert_eq!(var.take(), Some("b".to_string()));
            assert!(!var.is_set());
            assert_eq!(tracked_variable_count(), 0);
            assert_eq!(var.take(), None);
        });
    }

    #[test]
    fn with_does_not_hold_the_table_borrow() {
        on_fresh_thread(|| {
            let outer = ThreadLocalVariable::with_initial(|| 1u8).unwrap();
            let inner = ThreadLocalVariable::with_initial(|| 2u8).unwrap();
            let sum = outer
                .with(|a| {
                    inner.set(40).unwrap();
                    *a + inner.get().unwrap()
                })
                .unwrap();
            assert_eq!(sum, 41);
        });
    }

    #[test]
    fn explicit_table_bypasses_resolution() {
        on_fresh_thread(|| {
            let var = ThreadLocalVariable::with_initial(|| 3u64).unwrap();
            let table = TableHandle::new();
            var.set_in(&table, 9).unwrap();
            assert_eq!(var.get_in(&table).unwrap(), 9);
            assert!(var.is_set_in(&table));
            // The thread's own table never saw it.
            assert!(!var.is_set());
            var.remove_in(&table);
            assert!(!var.is_set_in(&table));
        });
    }

    #[test]
    fn strict_policy_rejects_unset_entry() {
        let var = ThreadLocalVariable::<u32>::new().unwrap();
        let table = table_with(SentinelPolicy::Strict);
        var.store_in(&table, Entry::Set(4)).unwrap();
        let err = var.store_in(&table, Entry::Unset).unwrap_err();
        assert_eq!(err, LocalError::MisuseOfSentinel { slot: var.slot() });
        assert_eq!(var.get_in(&table).unwrap(), 4);
    }

    #[test]
    fn strict_rejection_keeps_value_tracked() {
        let var = ThreadLocalVariable::<u32>::new().unwrap();
        let table = table_with(SentinelPolicy::Strict);
        var.store_in(&table, Entry::Set(4)).unwrap();
        assert!(var.store_in(&table, Entry::Unset).is_err());
        assert_eq!(existing_removal_set(&table).map_or(0, |s| s.len()), 1);
    }

    #[test]
    fn lenient_policy_treats_unset_entry_as_remove() {
        let removed = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&removed);
        let var = ThreadLocalVariable::builder(|| 0u32)
            .on_removal(move |v| {
                r.store(*v as usize, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        let table = table_with(SentinelPolicy::Lenient);
        var.store_in(&table, Entry::Set(4)).unwrap();
        assert_eq!(existing_removal_set(&table).map_or(0, |s| s.len()), 1);
        var.store_in(&table, Entry::Unset).unwrap();
        assert!(!var.is_set_in(&table));
        assert_eq!(existing_removal_set(&table).map_or(0, |s| s.len()), 0);
        assert_eq!(removed.load(Ordering::SeqCst), 4);

        // Storing the sentinel into an unset slot is a no-op.
        removed.store(0, Ordering::SeqCst);
        var.store_in(&table, Entry::Unset).unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn removal_hook_sees_removed_value() {
        on_fresh_thread(|| {
            let seen = Arc::new(AtomicUsize::new(0));
            let s = Arc::clone(&seen);
            let var = ThreadLocalVariable::builder(|| 0usize)
                .on_removal(move |v| {
                    s.store(*v, Ordering::SeqCst);
                })
                .build()
                .unwrap();
            var.set(12).unwrap();
            var.remove();
            assert_eq!(seen.load(Ordering::SeqCst), 12);

            // Removing an unset variable does not run the hook.
            seen.store(0, Ordering::SeqCst);
            var.remove();
            assert_eq!(seen.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn remove_all_clears_touched_variables_in_slot_order() {
        thread_local! {
            static ORDER: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
        }

        on_fresh_thread(|| {
            let vars: Vec<_> = (0..4)
                .map(|_| {
                    ThreadLocalVariable::builder(|| 0usize)
                        .on_removal(|v| ORDER.with(|o| o.borrow_mut().push(*v)))
                        .build()
                        .unwrap()
                })
                .collect();
            for (i, var) in vars.iter().enumerate().rev() {
                var.set(i).unwrap();
            }
            assert_eq!(tracked_variable_count(), 4);

            remove_all();
            ORDER.with(|o| assert_eq!(*o.borrow(), vec![0, 1, 2, 3]));
            assert!(current_table_if_set().is_none());
            assert!(vars.iter().all(|v| !v.is_set()));
        });
    }

    #[test]
    fn remove_all_without_table_is_noop() {
        on_fresh_thread(|| {
            let before = global_metrics().snapshot().remove_all_passes;
            remove_all();
            assert!(current_table_if_set().is_none());
            assert_eq!(global_metrics().snapshot().remove_all_passes, before);
        });
    }

    #[test]
    fn values_are_dropped_on_remove() {
        struct Flag(Rc<Cell<bool>>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        on_fresh_thread(|| {
            let dropped = Rc::new(Cell::new(false));
            let var = ThreadLocalVariable::<Option<Flag>>::new().unwrap();
            var.set(Some(Flag(Rc::clone(&dropped)))).unwrap();
            assert!(!dropped.get());
            var.remove();
            assert!(dropped.get());
        });
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = ThreadLocalVariable::<u8>::new().unwrap();
        let b = ThreadLocalVariable::<u8>::new().unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(b.slot() > a.slot());
    }
}
