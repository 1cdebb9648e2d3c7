//! Error taxonomy at the pool's component boundaries.

use thiserror::Error;

/// Per-task failures, surfaced through completion handles and translated to
/// HTTP status codes by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The input could not be decoded or was empty. Never retried.
    #[error("bad image: {0}")]
    BadImage(String),
    /// Admission denied: the queue is at capacity (or the pool is shutting
    /// down and no longer admits work).
    #[error("queue full")]
    QueueFull,
    /// Transient recognizer failure. Retried up to the task's retry budget.
    #[error("recognition failed: {0}")]
    Recognition(String),
    /// The recognizer handle became unusable; the owning instance moved to
    /// ERROR. The task is retried on another instance while retries remain.
    #[error("instance failure: {0}")]
    FatalInstance(String),
    /// Cancellation was observed before recognition completed.
    #[error("task cancelled")]
    Cancelled,
    /// Caller-side deadline on a synchronous wait. The underlying task keeps
    /// running and must be cancelled explicitly if unwanted.
    #[error("timed out waiting for completion")]
    Timeout,
}

/// Pool-level management failures (instance CRUD, lifecycle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No instance with the given id.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    /// The pool already holds `max_instances` instances.
    #[error("instance limit reached ({0})")]
    AtMaxInstances(usize),
    /// No port left in the allocator's range.
    #[error("no port available for a new instance")]
    NoPortAvailable,
    /// The instance is in a state that does not permit the operation.
    #[error("instance {id} is {state}")]
    InvalidState {
        /// Instance id.
        id: String,
        /// Its current lifecycle state.
        state: String,
    },
    /// The pool is shutting down.
    #[error("pool is shutting down")]
    ShuttingDown,
}
