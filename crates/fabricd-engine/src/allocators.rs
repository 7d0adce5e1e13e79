//! The engine's allocator set.
//!
//! Fixed-namespace allocators are built once at start-up; per-key
//! allocators (tag values, aggregated-ethernet, subnets) are created
//! on first use and cached.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fabricd_alloc::{namespaces, AllocError, IndexAllocator, SubnetAllocator, SubnetConfig};
use fabricd_coord::CoordStore;

/// All ID and address allocators owned by one engine process.
pub struct Allocators {
    /// Virtual-network IDs.
    pub vn: IndexAllocator,
    /// Security-group IDs.
    pub sg: IndexAllocator,
    /// Route-target IDs.
    pub rt: IndexAllocator,
    /// Tag-type IDs.
    pub tag_type: IndexAllocator,
    /// Sub-cluster IDs.
    pub sub_cluster: IndexAllocator,
    /// Virtual-port-group IDs.
    pub vpg: IndexAllocator,
    store: Arc<dyn CoordStore>,
    tag_values: RwLock<HashMap<String, Arc<IndexAllocator>>>,
    ae: RwLock<HashMap<String, Arc<IndexAllocator>>>,
    subnets: RwLock<HashMap<String, Arc<SubnetAllocator>>>,
}

impl Allocators {
    /// Builds the fixed allocators against the coordination store.
    pub fn new(
        store: Arc<dyn CoordStore>,
        rt_configured_min: u64,
        four_byte_asn: bool,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            vn: namespaces::virtual_network_ids(store.clone())?,
            sg: namespaces::security_group_ids(store.clone())?,
            rt: namespaces::route_target_ids(store.clone(), rt_configured_min)?,
            tag_type: namespaces::tag_type_ids(store.clone())?,
            sub_cluster: namespaces::sub_cluster_ids(store.clone(), four_byte_asn)?,
            vpg: namespaces::virtual_port_group_ids(store.clone())?,
            store,
            tag_values: RwLock::new(HashMap::new()),
            ae: RwLock::new(HashMap::new()),
            subnets: RwLock::new(HashMap::new()),
        })
    }

    /// Tag-value allocator for a tag type, created on first use.
    pub fn tag_values(&self, tag_type: &str) -> Result<Arc<IndexAllocator>, AllocError> {
        if let Some(a) = self.tag_values.read().expect("lock poisoned").get(tag_type) {
            return Ok(a.clone());
        }
        let alloc = Arc::new(namespaces::tag_value_ids(self.store.clone(), tag_type)?);
        self.tag_values
            .write()
            .expect("lock poisoned")
            .insert(tag_type.to_string(), alloc.clone());
        Ok(alloc)
    }

    /// Aggregated-ethernet allocator for a physical router.
    pub fn aggregated_ethernet(
        &self,
        router_fq_name: &str,
    ) -> Result<Arc<IndexAllocator>, AllocError> {
        if let Some(a) = self.ae.read().expect("lock poisoned").get(router_fq_name) {
            return Ok(a.clone());
        }
        let alloc = Arc::new(namespaces::aggregated_ethernet_ids(
            self.store.clone(),
            router_fq_name,
        )?);
        self.ae
            .write()
            .expect("lock poisoned")
            .insert(router_fq_name.to_string(), alloc.clone());
        Ok(alloc)
    }

    /// Subnet allocator for a CIDR, created with `config` on first use.
    pub fn subnet(&self, config: SubnetConfig) -> Result<Arc<SubnetAllocator>, AllocError> {
        let key = format!("{}:{}", config.vn_fq_name, config.cidr);
        if let Some(a) = self.subnets.read().expect("lock poisoned").get(&key) {
            return Ok(a.clone());
        }
        let alloc = Arc::new(SubnetAllocator::new(self.store.clone(), config)?);
        self.subnets
            .write()
            .expect("lock poisoned")
            .insert(key, alloc.clone());
        Ok(alloc)
    }

    /// Looks up an existing subnet allocator.
    pub fn subnet_get(&self, vn_fq_name: &str, cidr: &str) -> Option<Arc<SubnetAllocator>> {
        let key = format!("{}:{}", vn_fq_name, cidr);
        self.subnets.read().expect("lock poisoned").get(&key).cloned()
    }

    /// Drops the cached subnet allocator (subnet or VN deleted). The
    /// coordination-store nodes are the owner's to clean up.
    pub fn subnet_evict(&self, vn_fq_name: &str, cidr: &str) {
        let key = format!("{}:{}", vn_fq_name, cidr);
        self.subnets.write().expect("lock poisoned").remove(&key);
    }

    /// Keys of the cached subnet allocators, for the admin surface.
    pub fn subnet_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .subnets
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricd_coord::MemoryCoordStore;

    fn allocators() -> Allocators {
        Allocators::new(Arc::new(MemoryCoordStore::new()), 0, false).unwrap()
    }

    #[test]
    fn test_fixed_namespaces_ready() {
        let a = allocators();
        assert_eq!(a.vn.alloc("d:p:vn").unwrap(), 1);
        assert_eq!(a.sg.alloc("d:p:sg").unwrap(), 1);
    }

    #[test]
    fn test_tag_value_allocators_cached() {
        let a = allocators();
        let t1 = a.tag_values("tier").unwrap();
        let t2 = a.tag_values("tier").unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
        t1.alloc("tier=web").unwrap();
        assert_eq!(t2.in_use_count(), 1);
    }

    #[test]
    fn test_subnet_create_and_evict() {
        let a = allocators();
        let cfg = SubnetConfig::new("d:p:vn", "10.0.0.0/24");
        let s = a.subnet(cfg).unwrap();
        assert!(a.subnet_get("d:p:vn", &s.cidr()).is_some());
        a.subnet_evict("d:p:vn", &s.cidr());
        assert!(a.subnet_get("d:p:vn", &s.cidr()).is_none());
    }
}
