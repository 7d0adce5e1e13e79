//! Bus-event dispatcher.
//!
//! Every engine process runs one notifier consuming the object-change
//! stream. For each event it evicts the object cache entry and hands
//! the message to the per-type notification hook, so peers converge on
//! allocator in-use state without reading each other's memory.

use fabricd_bus::BusError;

use crate::engine::Engine;

/// How many events one drain pass takes at most.
const BATCH_SIZE: usize = 256;

/// A registered consumer of the object-change stream bound to one
/// engine.
pub struct Notifier {
    engine: Engine,
    consumer_id: String,
}

impl Notifier {
    /// Registers a consumer cursor and binds it to the engine.
    pub fn new(engine: Engine, consumer_id: &str) -> Self {
        engine.bus().register_consumer(consumer_id);
        Self {
            engine,
            consumer_id: consumer_id.to_string(),
        }
    }

    /// The consumer id on the bus.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Drains one batch of events; returns how many were handled.
    pub fn run_once(&self) -> Result<usize, BusError> {
        let events = self.engine.bus().consume(&self.consumer_id, BATCH_SIZE)?;
        let n = events.len();
        for event in events {
            tracing::debug!(
                sequence = event.sequence,
                "notify {:?} {} {}",
                event.message.oper,
                event.message.type_name,
                event.message.uuid
            );
            self.engine.dispatch_notification(&event.message);
        }
        Ok(n)
    }

    /// Drains until the backlog is empty; returns the total handled.
    pub fn drain(&self) -> Result<usize, BusError> {
        let mut total = 0;
        loop {
            let n = self.run_once()?;
            total += n;
            if n < BATCH_SIZE {
                return Ok(total);
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.engine.bus().unregister_consumer(&self.consumer_id);
    }
}
