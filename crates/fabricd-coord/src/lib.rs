//! Coordination store client for fabricd.
//!
//! Wraps a hierarchical, sessioned key-value namespace used for
//! allocations, FQN locks, bounded counters, and master election.
//! The in-memory implementation provides single-session FIFO ordering
//! and ephemeral-node cleanup on session loss.

pub mod client;
pub mod counter;
pub mod election;
pub mod error;
pub mod lock;
pub mod memory;

pub use client::{CoordStore, NodeStat};
pub use counter::BoundedCounter;
pub use election::MasterElection;
pub use error::CoordError;
pub use lock::{CoordLock, LockRegistry};
pub use memory::MemoryCoordStore;
