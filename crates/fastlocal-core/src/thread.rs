//! Table-carrying threads.
//!
//! A thread spawned through [`Builder`] or [`spawn`] owns its slot table for
//! its whole life, so every variable access on it takes the fast path. When
//! the user closure returns or unwinds, the thread runs
//! [`remove_all`](crate::remove_all) before it exits. Values stored on it
//! are therefore released deterministically, in the thread's own context.
//!
//! Threads created any other way can opt in with [`adopt_current`].

use std::io;
use std::thread::JoinHandle;

use crate::carrier::{self, SlotTableCarrier};
use crate::slot_table::TableHandle;
use crate::variable::remove_all_on_exit;

pub use crate::carrier::is_table_carrying;

/// Handed to closures run with [`Builder::spawn_with_context`].
///
/// It carries the thread's table, so `*_in` calls through it skip table
/// resolution entirely.
#[derive(Debug, Clone)]
pub struct FastThreadContext {
    table: TableHandle,
}

impl FastThreadContext {
    #[must_use]
    pub fn table(&self) -> &TableHandle {
        &self.table
    }
}

impl SlotTableCarrier for FastThreadContext {
    fn slot_table(&self) -> &TableHandle {
        &self.table
    }
}

/// Make the calling thread table-carrying.
///
/// Values already stored through the fallback path stay visible. Unlike a
/// spawned fast thread, an adopted thread gets no automatic teardown; call
/// [`remove_all`](crate::remove_all) when its work is done.
///
/// Called from a thread-local destructor, the thread cannot start carrying a
/// table: the context holds a detached table and [`is_table_carrying`]
/// stays false.
pub fn adopt_current() -> FastThreadContext {
    FastThreadContext {
        table: carrier::adopt_current(),
    }
}

/// Stop carrying a table on the calling thread.
///
/// The thread goes back to the fallback path with no values. The detached
/// table is returned so its values can be read or dropped by the caller.
pub fn release_current() -> Option<TableHandle> {
    carrier::release_carried()
}

/// Factory for table-carrying threads, mirroring [`std::thread::Builder`].
#[derive(Debug)]
#[must_use]
pub struct Builder {
    inner: std::thread::Builder,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            inner: std::thread::Builder::new(),
        }
    }

    pub fn name(self, name: String) -> Self {
        Self {
            inner: self.inner.name(name),
        }
    }

    pub fn stack_size(self, size: usize) -> Self {
        Self {
            inner: self.inner.stack_size(size),
        }
    }

    /// Spawn a table-carrying thread running `f`.
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with_context(move |_| f())
    }

    /// Spawn a table-carrying thread, handing `f` the thread's context.
    pub fn spawn_with_context<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce(&FastThreadContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.spawn(move || run_carrying(f))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a table-carrying thread with default settings.
pub fn spawn<F, T>(f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

// ---------------------------------------------------------------------------
// Thread body
// ---------------------------------------------------------------------------

/// Runs `remove_all` and releases the carried table when dropped, including
/// during unwinding.
struct TeardownGuard;

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        remove_all_on_exit();
    }
}

fn run_carrying<F, T>(f: F) -> T
where
    F: FnOnce(&FastThreadContext) -> T,
{
    let context = adopt_current();
    let _teardown = TeardownGuard;
    f(&context)
}
