//! Bus client trait and health counters.

use crate::error::BusError;
use crate::message::{BusEvent, BusMessage};

/// Connection and throughput counters, exposed over the admin surface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Messages published since start.
    pub published: u64,
    /// Messages handed to consumers since start.
    pub consumed: u64,
    /// Times the connection dropped and was re-established.
    pub reconnects: u64,
    /// Whether the broker connection is currently up.
    pub connected: bool,
}

/// Publish/consume access to the object-change bus.
///
/// Messages from one publisher are delivered to every consumer in
/// publish order. Consumers track independent cursors; a consumer that
/// never drains its backlog eventually blocks publishers via
/// [`BusError::QueueFull`].
pub trait BusClient: Send + Sync {
    /// Publishes a message. Returns the assigned sequence number.
    fn publish(&self, msg: BusMessage) -> Result<u64, BusError>;

    /// Registers a consumer cursor starting at the head of the stream.
    fn register_consumer(&self, consumer_id: &str);

    /// Removes a consumer cursor. Returns false if unknown.
    fn unregister_consumer(&self, consumer_id: &str) -> bool;

    /// Takes up to `max_count` messages after the consumer's cursor,
    /// advancing it.
    fn consume(&self, consumer_id: &str, max_count: usize) -> Result<Vec<BusEvent>, BusError>;

    /// Backlog size for a consumer.
    fn num_pending_messages(&self, consumer_id: &str) -> Result<u64, BusError>;

    /// Connection and throughput counters.
    fn stats(&self) -> BusStats;
}
