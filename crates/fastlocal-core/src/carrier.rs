//! Resolution of "the current thread's slot table".
//!
//! Two storage strategies sit behind one lookup:
//!
//! - **Carried** (fast path): a table-carrying thread owns its table for its
//!   whole life. It lives in a const-initialized thread-local that is installed
//!   when the thread starts, so resolving it is a single TLS read with no
//!   lazy-init check.
//! - **Fallback**: any other thread gets a table lazily through a conventional
//!   thread-local. Fallback tables are stamped with a process-wide epoch.
//!   [`destroy_fallback`] bumps the epoch, and every stale table is dropped
//!   and replaced on its own thread at the next access. No thread ever
//!   touches another thread's table.
//!
//! Once a thread's locals are being torn down, neither slot can be reached.
//! Resolution then hands out a detached table that lives only as long as the
//! caller holds it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::metrics::{LocalMetrics, global_metrics};
use crate::slot_table::TableHandle;

/// Capability: "owns an indexed slot table".
///
/// Passing a carrier to the `*_in` variable operations skips table
/// resolution entirely.
pub trait SlotTableCarrier {
    fn slot_table(&self) -> &TableHandle;
}

impl SlotTableCarrier for TableHandle {
    fn slot_table(&self) -> &TableHandle {
        self
    }
}

// Process-wide fallback generation.
//
// Fallback tables remember the epoch they were created in; a table from an
// older epoch is treated as absent.
static FALLBACK_EPOCH: AtomicU64 = AtomicU64::new(1);

struct FallbackTable {
    epoch: u64,
    table: TableHandle,
}

thread_local! {
    static CARRIED: RefCell<Option<TableHandle>> = const { RefCell::new(None) };
    static FALLBACK: RefCell<Option<FallbackTable>> = RefCell::new(None);
}

/// True if the calling thread carries its own table.
#[must_use]
pub fn is_table_carrying() -> bool {
    carried_table().is_some()
}

fn carried_table() -> Option<TableHandle> {
    CARRIED.try_with(|c| c.borrow().clone()).ok().flatten()
}

fn fallback_table(create: bool) -> Option<TableHandle> {
    let epoch = FALLBACK_EPOCH.load(Ordering::Acquire);
    let (table, stale) = FALLBACK
        .try_with(|cell| {
            let mut cell = cell.borrow_mut();
            let is_stale = cell.as_ref().is_some_and(|f| f.epoch != epoch);
            let stale = if is_stale { cell.take() } else { None };
            if cell.is_none() && create {
                *cell = Some(FallbackTable {
                    epoch,
                    table: TableHandle::new(),
                });
            }
            (cell.as_ref().map(|f| f.table.clone()), stale)
        })
        .ok()?;
    // Stale values may run arbitrary destructors; the cell is released by now.
    drop(stale);
    table
}

/// The calling thread's table, created on first use.
#[must_use]
pub fn current_table() -> TableHandle {
    carried_table()
        .or_else(|| fallback_table(true))
        .unwrap_or_else(TableHandle::new)
}

/// The calling thread's table if one exists. Never creates one.
#[must_use]
pub fn current_table_if_set() -> Option<TableHandle> {
    carried_table().or_else(|| fallback_table(false))
}

/// Discard the calling thread's table so the next access starts fresh.
///
/// A carried table is reset in place (the thread keeps carrying it); a
/// fallback table is dropped.
pub fn discard_current_table() {
    if let Some(carried) = carried_table() {
        drop(carried.reset());
        return;
    }
    let dropped = FALLBACK
        .try_with(|cell| cell.borrow_mut().take())
        .ok()
        .flatten();
    drop(dropped);
}

/// Invalidate every thread's fallback table.
///
/// Carried tables are unaffected.
pub fn destroy_fallback() {
    FALLBACK_EPOCH.fetch_add(1, Ordering::AcqRel);
    LocalMetrics::inc(&global_metrics().fallback_destroys);
}

/// Make the calling thread table-carrying.
///
/// A live fallback table is promoted so values already stored on this thread
/// survive. Returns the carried table, or a detached one during thread-local
/// teardown.
pub(crate) fn adopt_current() -> TableHandle {
    if let Some(carried) = carried_table() {
        return carried;
    }
    let epoch = FALLBACK_EPOCH.load(Ordering::Acquire);
    let promoted = FALLBACK
        .try_with(|cell| cell.borrow_mut().take())
        .ok()
        .flatten();
    let table = match promoted {
        Some(fallback) if fallback.epoch == epoch => fallback.table,
        stale => {
            drop(stale);
            TableHandle::new()
        }
    };
    // Once thread-locals are being torn down the table cannot be installed.
    // The caller still gets a working table, detached like the ones
    // `current_table` hands out then, and `is_table_carrying` stays false.
    let _ = CARRIED.try_with(|c| *c.borrow_mut() = Some(table.clone()));
    table
}

/// Stop carrying a table on the calling thread, returning it.
pub(crate) fn release_carried() -> Option<TableHandle> {
    CARRIED.try_with(|c| c.borrow_mut().take()).ok().flatten()
}
