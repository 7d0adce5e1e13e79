//! Repair tool errors.

use thiserror::Error;

/// Failure talking to one of the backing stores while auditing.
///
/// Inconsistencies found in the data are never errors; they are
/// reported as findings. An error here means the audit itself could
/// not proceed.
#[derive(Debug, Error)]
pub enum RepairError {
    /// Object store failure.
    #[error(transparent)]
    Store(#[from] fabricd_store::StoreError),

    /// Coordination store failure.
    #[error(transparent)]
    Coord(#[from] fabricd_coord::CoordError),

    /// Address allocator failure during healing.
    #[error(transparent)]
    Alloc(#[from] fabricd_alloc::AllocError),
}
