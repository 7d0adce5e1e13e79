//! Per-subnet address allocator.
//!
//! One allocator per subnet CIDR, layered on [`IndexAllocator`] with
//! the subnet's lock path under `/api-server/subnets/`. Network,
//! broadcast, gateway, and DNS addresses are pre-marked in use and
//! never handed out.

use std::net::IpAddr;
use std::sync::Arc;

use fabricd_coord::CoordStore;

use crate::error::AllocError;
use crate::index::IndexAllocator;

/// Hard cap on allocatable addresses per subnet.
pub const MAX_SUBNET_ADDRESSES: u64 = 65_535;

/// Static configuration of one subnet allocator.
#[derive(Clone, Debug)]
pub struct SubnetConfig {
    /// Owning virtual network, colon-joined FQN.
    pub vn_fq_name: String,
    /// Subnet CIDR, e.g. `10.0.0.0/24`.
    pub cidr: String,
    /// Allocation granularity in addresses; 1 for plain subnets.
    pub alloc_unit: u64,
    /// Default gateway; defaults to the first host address.
    pub gateway: Option<IpAddr>,
    /// DNS server; defaults to the second host address.
    pub dns_server: Option<IpAddr>,
    /// Allocation pools as inclusive ranges; empty means the whole
    /// subnet.
    pub pools: Vec<(IpAddr, IpAddr)>,
}

impl SubnetConfig {
    /// Config with defaults for a plain subnet.
    pub fn new(vn_fq_name: &str, cidr: &str) -> Self {
        Self {
            vn_fq_name: vn_fq_name.to_string(),
            cidr: cidr.to_string(),
            alloc_unit: 1,
            gateway: None,
            dns_server: None,
            pools: Vec::new(),
        }
    }
}

fn ip_to_int(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn int_to_ip(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4((value as u32).into())
    } else {
        IpAddr::V6(value.into())
    }
}

/// Parses and normalizes a CIDR string to `(network, prefix_len)`.
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8), AllocError> {
    let bad = || AllocError::BadCidr(cidr.to_string());
    let (addr, prefix) = cidr.split_once('/').ok_or_else(bad)?;
    let addr: IpAddr = addr.parse().map_err(|_| bad())?;
    let prefix: u8 = prefix.parse().map_err(|_| bad())?;
    let bits = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > bits {
        return Err(bad());
    }
    // Normalize to the network address.
    let host_bits = (bits - prefix) as u32;
    let network = if host_bits >= 128 {
        0
    } else {
        (ip_to_int(addr) >> host_bits) << host_bits
    };
    Ok((int_to_ip(network, addr.is_ipv4()), prefix))
}

/// Allocator of addresses within one subnet.
pub struct SubnetAllocator {
    index: IndexAllocator,
    config: SubnetConfig,
    network: u128,
    prefix: u8,
    v4: bool,
    total: u128,
    // Znode IDs equal the full IPv4 address integer when alloc_unit is
    // 1 (the lock-path shape external tools expect); otherwise IDs are
    // unit offsets from the network address.
    index_base: u64,
}

impl SubnetAllocator {
    /// Creates an allocator for the subnet, pre-reserving the network,
    /// broadcast, gateway, and DNS addresses.
    pub fn new(store: Arc<dyn CoordStore>, config: SubnetConfig) -> Result<Self, AllocError> {
        let (network_ip, prefix) = parse_cidr(&config.cidr)?;
        let v4 = network_ip.is_ipv4();
        let network = ip_to_int(network_ip);
        let bits: u32 = if v4 { 32 } else { 128 };
        let host_bits = (bits - prefix as u32).min(127);
        let total: u128 = 1u128 << host_bits;
        let alloc_unit = config.alloc_unit.max(1);
        let capacity = ((total / alloc_unit as u128) as u64).min(MAX_SUBNET_ADDRESSES);

        let path = format!(
            "/api-server/subnets/{}:{}/{}",
            config.vn_fq_name, network_ip, prefix
        );
        let index_base = if v4 && alloc_unit == 1 {
            network as u64
        } else {
            0
        };
        let index = IndexAllocator::new(store, &path, index_base, capacity, false)?;

        let this = Self {
            index,
            config: SubnetConfig {
                alloc_unit,
                ..config
            },
            network,
            prefix,
            v4,
            total,
            index_base,
        };

        // Reserved addresses are a deterministic function of the
        // config, so every process marks the same set locally.
        let mut reserved = vec![this.network];
        if v4 && prefix < 31 {
            reserved.push(this.network + this.total - 1);
        }
        reserved.push(ip_to_int(this.gateway()));
        reserved.push(ip_to_int(this.dns_server()));
        for addr in reserved {
            if let Ok(id) = this.id_for_int(addr) {
                this.index.set_in_use(id);
            }
        }
        Ok(this)
    }

    /// The normalized subnet CIDR.
    pub fn cidr(&self) -> String {
        format!("{}/{}", int_to_ip(self.network, self.v4), self.prefix)
    }

    /// The subnet's lock path in the coordination store.
    pub fn base_path(&self) -> &str {
        self.index.base_path()
    }

    /// Effective default gateway.
    pub fn gateway(&self) -> IpAddr {
        self.config
            .gateway
            .unwrap_or_else(|| int_to_ip(self.network + 1, self.v4))
    }

    /// Effective DNS server address.
    pub fn dns_server(&self) -> IpAddr {
        self.config
            .dns_server
            .unwrap_or_else(|| int_to_ip(self.network + 2, self.v4))
    }

    /// True if the address falls inside the subnet.
    pub fn ip_belongs(&self, address: IpAddr) -> bool {
        if address.is_ipv4() != self.v4 {
            return false;
        }
        let value = ip_to_int(address);
        value >= self.network && value < self.network + self.total
    }

    fn id_for_int(&self, value: u128) -> Result<u64, AllocError> {
        let out_of_subnet = || AllocError::AddressOutOfSubnet {
            address: int_to_ip(value, self.v4).to_string(),
            cidr: self.cidr(),
        };
        if value < self.network || value >= self.network + self.total {
            return Err(out_of_subnet());
        }
        let offset = value - self.network;
        let unit = self.config.alloc_unit as u128;
        if offset % unit != 0 {
            return Err(out_of_subnet());
        }
        Ok(self.index_base + (offset / unit) as u64)
    }

    fn id_for_addr(&self, address: IpAddr) -> Result<u64, AllocError> {
        if address.is_ipv4() != self.v4 {
            return Err(AllocError::AddressOutOfSubnet {
                address: address.to_string(),
                cidr: self.cidr(),
            });
        }
        self.id_for_int(ip_to_int(address))
    }

    fn addr_for_id(&self, id: u64) -> IpAddr {
        let offset = (id - self.index_base) as u128 * self.config.alloc_unit as u128;
        int_to_ip(self.network + offset, self.v4)
    }

    fn in_pools(&self, pools: &[(IpAddr, IpAddr)], value: u128) -> bool {
        if pools.is_empty() {
            return true;
        }
        pools
            .iter()
            .any(|(lo, hi)| value >= ip_to_int(*lo) && value <= ip_to_int(*hi))
    }

    /// Allocates an address, optionally constrained to pools and
    /// honoring a preferred address.
    pub fn alloc_from_pools(
        &self,
        owner: &str,
        pools: Option<&[(IpAddr, IpAddr)]>,
        preferred: Option<IpAddr>,
    ) -> Result<IpAddr, AllocError> {
        let pools = pools.unwrap_or(&self.config.pools);
        if let Some(addr) = preferred {
            let value = ip_to_int(addr);
            if !self.ip_belongs(addr) || !self.in_pools(pools, value) {
                return Err(AllocError::AddressOutOfSubnet {
                    address: addr.to_string(),
                    cidr: self.cidr(),
                });
            }
            let id = self.id_for_addr(addr)?;
            self.index.reserve(id, owner)?;
            return Ok(addr);
        }
        for id in self.index.start()..self.index.end() {
            if self.index.is_in_use(id) {
                continue;
            }
            let addr = self.addr_for_id(id);
            if !self.in_pools(pools, ip_to_int(addr)) {
                continue;
            }
            match self.index.reserve(id, owner) {
                Ok(_) => {
                    tracing::debug!("allocated {} from {}", addr, self.cidr());
                    return Ok(addr);
                }
                // Lost a race to a peer; keep scanning.
                Err(AllocError::ResourceExists { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AllocError::Exhausted {
            path: self.base_path().to_string(),
        })
    }

    /// Claims a specific address.
    pub fn reserve(&self, address: IpAddr, value: &str) -> Result<IpAddr, AllocError> {
        let id = self.id_for_addr(address)?;
        self.index.reserve(id, value)?;
        Ok(address)
    }

    /// Reads the owner recorded for an address, None if free.
    pub fn read(&self, address: IpAddr) -> Result<Option<String>, AllocError> {
        let id = self.id_for_addr(address)?;
        self.index.read(id)
    }

    /// Releases an address.
    pub fn free(&self, address: IpAddr) -> Result<(), AllocError> {
        let id = self.id_for_addr(address)?;
        self.index.free(id)
    }

    /// Marks an address in use locally (peer allocation).
    pub fn set_in_use(&self, address: IpAddr) -> Result<(), AllocError> {
        let id = self.id_for_addr(address)?;
        self.index.set_in_use(id);
        Ok(())
    }

    /// Clears the local in-use mark for an address.
    pub fn reset_in_use(&self, address: IpAddr) -> Result<(), AllocError> {
        let id = self.id_for_addr(address)?;
        self.index.reset_in_use(id);
        Ok(())
    }

    /// Number of addresses marked in use, reserved addresses included.
    pub fn count(&self) -> usize {
        self.index.in_use_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabricd_coord::MemoryCoordStore;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn subnet(cidr: &str) -> SubnetAllocator {
        let store = Arc::new(MemoryCoordStore::new());
        SubnetAllocator::new(store, SubnetConfig::new("default-domain:p:vn", cidr)).unwrap()
    }

    #[test]
    fn test_parse_cidr_normalizes() {
        let (net, prefix) = parse_cidr("10.0.0.57/24").unwrap();
        assert_eq!(net, v4("10.0.0.0"));
        assert_eq!(prefix, 24);
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("banana/8").is_err());
    }

    #[test]
    fn test_alloc_skips_reserved() {
        let s = subnet("10.0.0.0/24");
        // Network .0, gateway .1, DNS .2 are reserved.
        assert_eq!(s.alloc_from_pools("iip-1", None, None).unwrap(), v4("10.0.0.3"));
        assert_eq!(s.alloc_from_pools("iip-2", None, None).unwrap(), v4("10.0.0.4"));
    }

    #[test]
    fn test_broadcast_never_allocated() {
        let s = subnet("10.0.0.0/30");
        // .0 network, .1 gw, .2 dns, .3 broadcast: nothing left.
        assert!(matches!(
            s.alloc_from_pools("x", None, None),
            Err(AllocError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_free_then_reuse() {
        let s = subnet("10.0.0.0/24");
        let a = s.alloc_from_pools("iip-1", None, None).unwrap();
        s.free(a).unwrap();
        assert_eq!(s.alloc_from_pools("iip-2", None, None).unwrap(), a);
    }

    #[test]
    fn test_preferred_address() {
        let s = subnet("10.0.0.0/24");
        let got = s
            .alloc_from_pools("iip-1", None, Some(v4("10.0.0.200")))
            .unwrap();
        assert_eq!(got, v4("10.0.0.200"));
        assert!(matches!(
            s.alloc_from_pools("iip-2", None, Some(v4("10.0.0.200"))),
            Err(AllocError::ResourceExists { .. })
        ));
    }

    #[test]
    fn test_preferred_outside_subnet() {
        let s = subnet("10.0.0.0/24");
        assert!(matches!(
            s.alloc_from_pools("x", None, Some(v4("10.0.1.5"))),
            Err(AllocError::AddressOutOfSubnet { .. })
        ));
    }

    #[test]
    fn test_pools_constrain_allocation() {
        let s = subnet("10.0.0.0/24");
        let pools = vec![(v4("10.0.0.100"), v4("10.0.0.101"))];
        assert_eq!(
            s.alloc_from_pools("a", Some(&pools), None).unwrap(),
            v4("10.0.0.100")
        );
        assert_eq!(
            s.alloc_from_pools("b", Some(&pools), None).unwrap(),
            v4("10.0.0.101")
        );
        assert!(matches!(
            s.alloc_from_pools("c", Some(&pools), None),
            Err(AllocError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_reserve_and_read() {
        let s = subnet("10.0.0.0/24");
        s.reserve(v4("10.0.0.50"), "fip-1").unwrap();
        assert_eq!(s.read(v4("10.0.0.50")).unwrap().as_deref(), Some("fip-1"));
        assert!(s.read(v4("10.0.0.51")).unwrap().is_none());
    }

    #[test]
    fn test_lock_path_shape() {
        let s = subnet("10.0.0.0/24");
        assert_eq!(
            s.base_path(),
            "/api-server/subnets/default-domain:p:vn:10.0.0.0/24"
        );
    }

    #[test]
    fn test_explicit_gateway_reserved() {
        let store = Arc::new(MemoryCoordStore::new());
        let mut config = SubnetConfig::new("default-domain:p:vn", "10.0.0.0/29");
        config.gateway = Some(v4("10.0.0.6"));
        let s = SubnetAllocator::new(store, config).unwrap();
        // .0 net, .6 gw, .2 dns, .7 broadcast reserved; .1 is free.
        assert_eq!(s.alloc_from_pools("a", None, None).unwrap(), v4("10.0.0.1"));
        assert_eq!(s.alloc_from_pools("b", None, None).unwrap(), v4("10.0.0.3"));
    }

    #[test]
    fn test_count_includes_reserved() {
        let s = subnet("10.0.0.0/24");
        let base = s.count();
        s.alloc_from_pools("a", None, None).unwrap();
        assert_eq!(s.count(), base + 1);
    }

    #[test]
    fn test_ipv6_subnet() {
        let store = Arc::new(MemoryCoordStore::new());
        let s = SubnetAllocator::new(store, SubnetConfig::new("d:p:vn6", "fd00::/120")).unwrap();
        // Network ::0, gw ::1, dns ::2 reserved; no broadcast in v6.
        let a = s.alloc_from_pools("iip", None, None).unwrap();
        assert_eq!(a, "fd00::3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_capacity_capped() {
        let store = Arc::new(MemoryCoordStore::new());
        let s = SubnetAllocator::new(store, SubnetConfig::new("d:p:vn", "10.0.0.0/8")).unwrap();
        assert!(s.index.end() - s.index.start() <= MAX_SUBNET_ADDRESSES);
    }
}
