//! Error types for the offload crate.
//!
//! One crate-level [`Error`] enum covers every failure class in the system.
//! The variants are deliberately coarse: each one maps to a distinct recovery
//! policy, not to a distinct call site. Only [`Error::Serialization`] is ever
//! recovered locally (it is scoped to a single task); every other kind is
//! terminal for the context or worker that raised it.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by contexts, workers, and pools.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was attempted in a lifecycle state that does not permit
    /// it: starting a context twice, enqueueing on a shut-down worker,
    /// receiving before start. Programmer error; never retried.
    #[error("invalid operation for current state: {0}")]
    Status(String),

    /// The executor died or its channel broke. Terminal for the context and
    /// any worker built on it.
    #[error("context failure: {0}")]
    Context(String),

    /// The byte stream under a channel failed: short read at EOF inside a
    /// frame, a frame above the configured cap, or an I/O error.
    #[error("channel failure: {0}")]
    Channel(String),

    /// A payload could not be encoded or decoded. Scoped to the one task
    /// that carried it; other tasks on the same worker continue.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// The worker cancelled its pending tasks, propagated to every awaiter
    /// it held.
    #[error("worker failure: {0}")]
    Worker(String),

    /// The child violated the protocol: an out-of-band exit result, a
    /// malformed task result, or a result for an unknown job id. Terminal
    /// for the worker.
    #[error("synchronization failure: {0}")]
    Synchronization(String),

    /// A message was rejected before it reached the wire (for example,
    /// attempting to send an exit result from the parent side).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A failure reported by the child side, re-raised locally with the
    /// remote kind, message, and stack preserved.
    #[error("remote panic [{kind}]: {message}")]
    Panic {
        /// Remote failure classification (for example `"panic"` or
        /// `"bootstrap"`).
        kind: String,
        /// Remote failure message.
        message: String,
        /// Remote stack trace, when the child captured one.
        stack: Option<String>,
    },
}

impl Error {
    /// Builds a [`Error::Panic`] from the pieces of a remote failure
    /// descriptor.
    pub(crate) fn panic(kind: impl Into<String>, message: impl Into<String>, stack: Option<String>) -> Self {
        Self::Panic {
            kind: kind.into(),
            message: message.into(),
            stack,
        }
    }

    /// True when this error is scoped to one task rather than the whole
    /// worker.
    pub fn is_task_scoped(&self) -> bool {
        matches!(self, Self::Serialization(_) | Self::Panic { .. })
    }
}
