//! # fastlocal-core
//!
//! Indexed thread-local variables with O(1) access.
//!
//! Every [`ThreadLocalVariable`] is assigned a slot index once, at
//! construction, from a process-wide counter. Its value on a given thread
//! lives at that index in the thread's growable [`SlotTable`], so a lookup is
//! a single array access instead of a hash probe.
//!
//! Threads spawned through [`thread::spawn`] (or opted in with
//! [`thread::adopt_current`]) carry their table directly. All other threads
//! get one lazily through a conventional thread-local. Both paths behave
//! identically; only the cost of resolving the table differs.
//!
//! [`remove_all`] clears every variable the calling thread has touched and
//! discards its table, e.g. before a pooled thread picks up unrelated work.
//!
//! ```
//! use fastlocal_core::ThreadLocalVariable;
//!
//! let counter = ThreadLocalVariable::with_initial(|| 0u32)?;
//! counter.set(counter.get()? + 1)?;
//! assert_eq!(counter.get()?, 1);
//! counter.remove();
//! assert!(!counter.is_set());
//! # Ok::<(), fastlocal_core::LocalError>(())
//! ```

#![deny(unsafe_code)]

pub mod carrier;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod slot_table;
pub mod thread;
pub mod variable;
pub mod watcher;

pub use carrier::SlotTableCarrier;
pub use config::{RuntimeConfig, SentinelPolicy, runtime_config};
pub use error::{ExhaustedResource, LocalError, Result};
pub use metrics::{MetricsSnapshot, global_metrics};
pub use registry::{IndexRegistry, SlotIndex, global_registry};
pub use slot_table::{SlotTable, SlotValue, TableHandle};
pub use thread::FastThreadContext;
pub use variable::{
    Entry, ThreadLocalVariable, VariableBuilder, destroy, remove_all, tracked_variable_count,
};
pub use watcher::tracked_thread_count;
