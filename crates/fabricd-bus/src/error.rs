//! Bus error types.

use thiserror::Error;

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The slowest consumer is too far behind; publishing would grow
    /// the backlog past the configured bound.
    #[error("queue full: {pending} pending messages (max {max})")]
    QueueFull {
        /// Current backlog of the slowest consumer.
        pending: u64,
        /// Configured backlog bound.
        max: u64,
    },

    /// The connection to the broker is down.
    #[error("bus disconnected")]
    Disconnected,

    /// No consumer registered under this id.
    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),

    /// Broker-side failure.
    #[error("bus backend error: {0}")]
    Backend(String),
}
