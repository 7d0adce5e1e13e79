use std::time::Duration;

/// Error types for coordination store operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// The node at the given path does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A node already exists at the given path.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The parent path does not exist and makepath was not requested.
    #[error("no parent node for: {0}")]
    NoParent(String),

    /// Deleting a node that still has children without recursive=true.
    #[error("node has children: {0}")]
    NotEmpty(String),

    /// A bounded counter increment would exceed its maximum.
    #[error("counter {path} over limit {max}")]
    OverLimit {
        /// Counter node path.
        path: String,
        /// Configured maximum value.
        max: u64,
    },

    /// A lock could not be acquired within the wait budget.
    #[error("lock {path} held by {holder}, timed out after {waited:?}")]
    LockTimeout {
        /// Lock path.
        path: String,
        /// Identity of the current holder.
        holder: String,
        /// How long the acquire attempt waited.
        waited: Duration,
    },

    /// The session was lost while an operation was in flight.
    #[error("coordination session lost")]
    SessionLost,

    /// The store is unreachable or failed internally.
    #[error("coordination store error: {0}")]
    Backend(String),
}
