//! Object-change message bus.
//!
//! API workers publish an event for every object mutation; downstream
//! control processes consume them through per-consumer cursors. The
//! in-memory bus preserves publish order per publisher and applies
//! backpressure when the slowest consumer falls too far behind.

pub mod client;
pub mod error;
pub mod memory;
pub mod message;

pub use client::{BusClient, BusStats};
pub use error::BusError;
pub use memory::MemoryBus;
pub use message::{BusEvent, BusMessage, Oper};
