//! Error types for indexed thread-local storage.
//!
//! Only two things can go wrong in this crate: a process-lifetime resource
//! runs out, or a caller tries to store the reserved "unset" sentinel as a
//! real value. Everything else (table resolution, slot access) always
//! succeeds.

use core::fmt;

use thiserror::Error;

use crate::registry::SlotIndex;

/// The resource that ran out in a [`LocalError::ResourceExhausted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExhaustedResource {
    /// The process-wide slot counter.
    SlotIndices,
    /// The capacity of one thread's slot table.
    TableCapacity,
}

impl fmt::Display for ExhaustedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotIndices => f.write_str("thread-local slot indices"),
            Self::TableCapacity => f.write_str("slot table capacity"),
        }
    }
}

/// Errors raised by the indexed thread-local storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocalError {
    /// A process-lifetime limit was hit. Not retried, never truncated.
    #[error("{resource} exhausted (limit {limit})")]
    ResourceExhausted {
        resource: ExhaustedResource,
        limit: usize,
    },
    /// The unset sentinel was passed where a value was expected and the
    /// sentinel policy is strict.
    #[error("refusing to store the unset sentinel into slot {slot}")]
    MisuseOfSentinel { slot: SlotIndex },
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, LocalError>;
