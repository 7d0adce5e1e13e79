//! Wide-column object store client for fabricd.
//!
//! Resources are rows keyed by UUID; properties, parent/children edges,
//! refs and back-refs are sparse columns per the control-plane column
//! grammar. A separate table maps `(type, fq_name)` to UUID and a
//! user-agent K/V table holds opaque adapter state.

pub mod cache;
pub mod columns;
pub mod error;
pub mod object_store;
pub mod record;
pub mod table;

pub use cache::{CacheConfig, ObjectCache};
pub use columns::ColumnName;
pub use error::StoreError;
pub use object_store::{ListFilter, ListResult, ObjectStore, PropCollectionUpdate, PropOp};
pub use record::{ObjectRecord, RefEdge, StoredObject};
pub use table::{MemoryObjectTable, ObjectTable, RowOp, TableId};
