//! Typed allocators over the coordination store.
//!
//! Every allocator is an index allocator keyed by a coordination-store
//! path: allocated IDs are znodes whose name is the zero-padded decimal
//! ID and whose value is the owner FQN. An in-process set mirrors the
//! store; cross-process allocations arrive via `set_in_use` when the
//! notification dispatcher sees a peer's create event.

pub mod error;
pub mod index;
pub mod namespaces;
pub mod quota;
pub mod subnet;

pub use error::AllocError;
pub use index::{IndexAllocator, ID_PAD};
pub use quota::QuotaCounter;
pub use subnet::{SubnetAllocator, SubnetConfig};
