//! Allocator namespaces and their ranges.
//!
//! Each constructor pins the base path and range for one ID namespace.
//! Callers own the minimum-offset policy where the table says so (the
//! virtual-network ID minimum is applied by the engine, not here).

use std::sync::Arc;

use fabricd_coord::CoordStore;

use crate::error::AllocError;
use crate::index::IndexAllocator;

/// Owner value of the reserved security-group ID 0.
pub const SG_ID_RESERVED_OWNER: &str = "__reserved__";

/// Lowest system-allocated route-target ID for any ASN.
pub const RT_SYSTEM_MIN: u64 = 8_000_000;

/// Number of pre-defined tag types (IDs below this are static).
pub const TAG_TYPE_USER_MIN: u64 = 256;

/// Virtual-network IDs: 1 .. 2²⁴.
pub fn virtual_network_ids(store: Arc<dyn CoordStore>) -> Result<IndexAllocator, AllocError> {
    IndexAllocator::new(store, "/id/virtual-networks", 1, 1 << 24, false)
}

/// Virtual-port-group IDs: 0 .. 2¹⁶−1.
pub fn virtual_port_group_ids(store: Arc<dyn CoordStore>) -> Result<IndexAllocator, AllocError> {
    IndexAllocator::new(store, "/id/virtual-port-groups", 0, (1 << 16) - 1, false)
}

/// Security-group IDs: 1 .. 2³², with 0 pre-reserved.
pub fn security_group_ids(store: Arc<dyn CoordStore>) -> Result<IndexAllocator, AllocError> {
    let alloc = IndexAllocator::new(store, "/id/security-groups", 0, 1 << 32, false)?;
    match alloc.reserve(0, SG_ID_RESERVED_OWNER) {
        Ok(_) | Err(AllocError::ResourceExists { .. }) => {}
        Err(e) => return Err(e),
    }
    Ok(alloc)
}

/// Route-target IDs: `max(RT_SYSTEM_MIN, configured_min)` .. 2³².
/// Values below the minimum are user-defined and never touched.
pub fn route_target_ids(
    store: Arc<dyn CoordStore>,
    configured_min: u64,
) -> Result<IndexAllocator, AllocError> {
    let start = RT_SYSTEM_MIN.max(configured_min);
    IndexAllocator::new(store, "/id/bgp/route-targets", start, (1 << 32) - start, false)
}

/// Tag-type IDs: 256 .. 2¹⁶−1 (the first 256 are pre-defined).
pub fn tag_type_ids(store: Arc<dyn CoordStore>) -> Result<IndexAllocator, AllocError> {
    IndexAllocator::new(
        store,
        "/id/tag-types",
        TAG_TYPE_USER_MIN,
        (1 << 16) - 1 - TAG_TYPE_USER_MIN,
        false,
    )
}

/// Tag-value IDs: 0 .. 2¹⁶−1, one allocator per tag type.
pub fn tag_value_ids(
    store: Arc<dyn CoordStore>,
    tag_type: &str,
) -> Result<IndexAllocator, AllocError> {
    let path = format!("/id/tag-values/{}", tag_type);
    IndexAllocator::new(store, &path, 0, (1 << 16) - 1, false)
}

/// Aggregated-ethernet IDs: 0 .. 127, one allocator per physical
/// router.
pub fn aggregated_ethernet_ids(
    store: Arc<dyn CoordStore>,
    router_fq_name: &str,
) -> Result<IndexAllocator, AllocError> {
    let path = format!("/id/aggregated-ethernet/{}", router_fq_name);
    IndexAllocator::new(store, &path, 0, 128, false)
}

/// Sub-cluster IDs: 1 .. 2¹⁶−1 under a 2-byte global ASN, 1 .. 2³²−1
/// under a 4-byte ASN.
pub fn sub_cluster_ids(
    store: Arc<dyn CoordStore>,
    four_byte_asn: bool,
) -> Result<IndexAllocator, AllocError> {
    let size = if four_byte_asn {
        (1u64 << 32) - 2
    } else {
        (1u64 << 16) - 2
    };
    IndexAllocator::new(store, "/id/sub-clusters", 1, size, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricd_coord::MemoryCoordStore;

    fn store() -> Arc<MemoryCoordStore> {
        Arc::new(MemoryCoordStore::new())
    }

    #[test]
    fn test_vn_ids_start_at_one() {
        let a = virtual_network_ids(store()).unwrap();
        assert_eq!(a.alloc("default-domain:p:vn").unwrap(), 1);
        assert_eq!(a.start(), 1);
        assert_eq!(a.end(), 1 + (1 << 24));
    }

    #[test]
    fn test_sg_zero_reserved() {
        let a = security_group_ids(store()).unwrap();
        assert_eq!(a.read(0).unwrap().as_deref(), Some(SG_ID_RESERVED_OWNER));
        assert_eq!(a.alloc("default-domain:p:sg").unwrap(), 1);
    }

    #[test]
    fn test_sg_reservation_survives_reload() {
        let s = store();
        security_group_ids(s.clone()).unwrap();
        // Second construction must not fail on the existing znode.
        let a = security_group_ids(s).unwrap();
        assert_eq!(a.alloc("sg").unwrap(), 1);
    }

    #[test]
    fn test_rt_minimum_applied() {
        let a = route_target_ids(store(), 0).unwrap();
        assert_eq!(a.alloc("target").unwrap(), RT_SYSTEM_MIN);
        let a = route_target_ids(store(), 9_000_000).unwrap();
        assert_eq!(a.alloc("target").unwrap(), 9_000_000);
    }

    #[test]
    fn test_tag_type_user_range() {
        let a = tag_type_ids(store()).unwrap();
        assert_eq!(a.alloc("custom-type").unwrap(), 256);
    }

    #[test]
    fn test_tag_values_per_type_independent() {
        let s = store();
        let a = tag_value_ids(s.clone(), "tier").unwrap();
        let b = tag_value_ids(s, "site").unwrap();
        assert_eq!(a.alloc("tier=web").unwrap(), 0);
        assert_eq!(b.alloc("site=dc1").unwrap(), 0);
    }

    #[test]
    fn test_ae_ids_per_router() {
        let s = store();
        let a = aggregated_ethernet_ids(s.clone(), "default-gsc:qfx1").unwrap();
        let b = aggregated_ethernet_ids(s, "default-gsc:qfx2").unwrap();
        assert_eq!(a.alloc("pi-1").unwrap(), 0);
        assert_eq!(b.alloc("pi-1").unwrap(), 0);
        assert_eq!(a.end(), 128);
    }

    #[test]
    fn test_sub_cluster_asn_ranges() {
        let a = sub_cluster_ids(store(), false).unwrap();
        assert_eq!(a.end(), (1 << 16) - 1);
        let a = sub_cluster_ids(store(), true).unwrap();
        assert_eq!(a.end(), (1 << 32) - 1);
    }
}
