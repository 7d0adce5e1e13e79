//! Allocator error types.

use thiserror::Error;

use fabricd_coord::CoordError;

/// Errors surfaced by allocators.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Every ID in the range is in use.
    #[error("allocator exhausted: {path}")]
    Exhausted {
        /// Allocator base path.
        path: String,
    },

    /// The requested ID lies outside the allocator's range.
    #[error("id {id} out of range [{start}, {end})")]
    OutOfRange {
        /// Requested ID.
        id: u64,
        /// Range start (inclusive).
        start: u64,
        /// Range end (exclusive).
        end: u64,
    },

    /// The requested ID is already held by another owner.
    #[error("id {id} already allocated to {owner}")]
    ResourceExists {
        /// Requested ID.
        id: u64,
        /// Current owner.
        owner: String,
    },

    /// A quota increment would exceed the configured bound.
    #[error("quota exceeded for {resource}: limit {limit}")]
    QuotaExceeded {
        /// Quota resource type.
        resource: String,
        /// Configured limit.
        limit: u64,
    },

    /// The subnet CIDR string could not be parsed.
    #[error("bad cidr: {0}")]
    BadCidr(String),

    /// The address does not belong to the subnet or its pools.
    #[error("address {address} not in subnet {cidr}")]
    AddressOutOfSubnet {
        /// Requested address.
        address: String,
        /// Subnet CIDR.
        cidr: String,
    },

    /// Coordination-store failure.
    #[error(transparent)]
    Coord(#[from] CoordError),
}
