//! IP address management for bridge networks
//!
//! Provides:
//! - Per-CIDR address pools, created lazily or registered as a sub-range
//! - Lowest-free allocation and reservation of preferred addresses
//! - Release of single addresses and of whole pools

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// IP address pool for a single CIDR
///
/// Addresses are tracked as integer offsets so IPv4 and IPv6 share one
/// allocation path. The network address is never handed out; for IPv4 the
/// broadcast address is excluded as well (except on /31 and /32).
#[derive(Debug, Clone)]
pub struct IpPool {
    /// Pool subnet (host bits cleared)
    subnet: IpNet,
    /// First usable address
    first: u128,
    /// Last usable address (inclusive)
    last: u128,
    /// Allocated addresses
    allocated: BTreeSet<u128>,
}

impl IpPool {
    /// Create an empty pool covering `subnet`
    pub fn new(subnet: IpNet) -> Self {
        let subnet = subnet.trunc();
        let (first, last) = match subnet {
            IpNet::V4(net) => {
                let network = u128::from(u32::from(net.network()));
                let broadcast = u128::from(u32::from(net.broadcast()));
                if net.prefix_len() >= 31 {
                    (network, broadcast)
                } else {
                    (network + 1, broadcast - 1)
                }
            }
            IpNet::V6(net) => {
                let network = u128::from(net.network());
                let last = u128::from(net.broadcast());
                if net.prefix_len() == 128 {
                    (network, last)
                } else {
                    (network + 1, last)
                }
            }
        };

        Self {
            subnet,
            first,
            last,
            allocated: BTreeSet::new(),
        }
    }

    /// The subnet this pool allocates from
    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    /// Allocate the lowest free address
    pub fn allocate(&mut self) -> Result<IpAddr> {
        let mut candidate = self.first;
        for &used in self.allocated.range(self.first..) {
            if used != candidate {
                break;
            }
            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => return Err(Error::PoolExhausted(self.subnet.to_string())),
            };
        }

        if candidate > self.last {
            return Err(Error::PoolExhausted(self.subnet.to_string()));
        }

        self.allocated.insert(candidate);
        Ok(self.to_addr(candidate))
    }

    /// Allocate a specific address
    pub fn allocate_specific(&mut self, addr: IpAddr) -> Result<()> {
        let offset = self.to_offset(&addr).ok_or_else(|| Error::AddressNotInPool {
            ip: addr,
            cidr: self.subnet.to_string(),
        })?;

        if !self.allocated.insert(offset) {
            return Err(Error::AddressInUse {
                ip: addr,
                cidr: self.subnet.to_string(),
            });
        }

        Ok(())
    }

    /// Release an allocated address, returning whether it was allocated
    pub fn release(&mut self, addr: &IpAddr) -> bool {
        match self.to_offset(addr) {
            Some(offset) => self.allocated.remove(&offset),
            None => false,
        }
    }

    /// Check whether `addr` is a usable address of this pool
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.to_offset(addr).is_some()
    }

    /// Check whether `addr` is usable and not yet allocated
    pub fn is_available(&self, addr: &IpAddr) -> bool {
        self.to_offset(addr)
            .is_some_and(|offset| !self.allocated.contains(&offset))
    }

    /// Number of allocated addresses
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    fn to_offset(&self, addr: &IpAddr) -> Option<u128> {
        let value = match (self.subnet, addr) {
            (IpNet::V4(_), IpAddr::V4(a)) => u128::from(u32::from(*a)),
            (IpNet::V6(_), IpAddr::V6(a)) => u128::from(*a),
            _ => return None,
        };
        (self.first..=self.last).contains(&value).then_some(value)
    }

    fn to_addr(&self, value: u128) -> IpAddr {
        match self.subnet {
            // Offsets of an IPv4 pool always fit in 32 bits
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }
}

/// IP allocator managing one pool per CIDR
///
/// Pools are keyed by the normalized CIDR string. A single lock serializes
/// every request and release, so an address is never issued twice.
#[derive(Debug, Default)]
pub struct IpAllocator {
    pools: Mutex<HashMap<String, IpPool>>,
}

impl IpAllocator {
    /// Create a new IP allocator
    pub fn new() -> Self {
        Self::default()
    }

    fn key(cidr: &IpNet) -> String {
        cidr.trunc().to_string()
    }

    /// Register `subnet` as an allocation pool carved out of `network`
    ///
    /// `subnet` must be at least as specific as `network` and lie entirely
    /// inside it. The host bits of `network` are ignored, so a bridge
    /// address such as `192.168.1.1/16` can be passed directly.
    pub fn register_subnet(&self, network: IpNet, subnet: IpNet) -> Result<()> {
        let network = network.trunc();
        let subnet = subnet.trunc();

        let same_family = matches!(
            (network, subnet),
            (IpNet::V4(_), IpNet::V4(_)) | (IpNet::V6(_), IpNet::V6(_))
        );
        if !same_family || subnet.prefix_len() < network.prefix_len() || !network.contains(&subnet)
        {
            return Err(Error::SubnetNotContained { subnet, network });
        }

        let key = Self::key(&subnet);
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if pools.contains_key(&key) {
            return Err(Error::PoolExists(key));
        }

        debug!(%network, %subnet, "registered allocation pool");
        pools.insert(key, IpPool::new(subnet));
        Ok(())
    }

    /// Request an address from the pool for `cidr`
    ///
    /// Without a preferred address the lowest free address is returned. The
    /// pool is created on first use of `cidr`.
    pub fn request_ip(&self, cidr: &IpNet, preferred: Option<IpAddr>) -> Result<IpAddr> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = pools
            .entry(Self::key(cidr))
            .or_insert_with(|| IpPool::new(*cidr));

        match preferred {
            Some(addr) => {
                pool.allocate_specific(addr)?;
                Ok(addr)
            }
            None => pool.allocate().inspect_err(|_| {
                warn!(cidr = %pool.subnet(), "address pool exhausted");
            }),
        }
    }

    /// Return `ip` to the pool for `cidr`
    ///
    /// Releasing an address that was never allocated leaves the pool as is.
    pub fn release_ip(&self, cidr: &IpNet, ip: IpAddr) -> Result<()> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let released = pools
            .get_mut(&Self::key(cidr))
            .is_some_and(|pool| pool.release(&ip));

        if !released {
            debug!(%cidr, %ip, "release of unallocated address ignored");
        }
        Ok(())
    }

    /// Drop the pool for `cidr` together with its allocations
    pub fn release_pool(&self, cidr: &IpNet) -> bool {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.remove(&Self::key(cidr)).is_some()
    }

    /// Check whether a pool exists for `cidr`
    pub fn has_pool(&self, cidr: &IpNet) -> bool {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.contains_key(&Self::key(cidr))
    }

    /// Check whether `ip` is currently allocated in the pool for `cidr`
    pub fn is_allocated(&self, cidr: &IpNet, ip: &IpAddr) -> bool {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools
            .get(&Self::key(cidr))
            .is_some_and(|pool| pool.contains(ip) && !pool.is_available(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ip_pool_creation() {
        let pool = IpPool::new(net("10.0.1.7/24"));

        assert_eq!(pool.subnet(), net("10.0.1.0/24"));
        assert_eq!(pool.allocated_count(), 0);
        assert!(!pool.contains(&ip("10.0.1.0")));
        assert!(!pool.contains(&ip("10.0.1.255")));
        assert!(pool.contains(&ip("10.0.1.254")));
    }

    #[test]
    fn test_ip_allocation() {
        let mut pool = IpPool::new(net("10.0.1.0/24"));

        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.1"));
        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.2"));
    }

    #[test]
    fn test_ip_release() {
        let mut pool = IpPool::new(net("10.0.1.0/24"));

        let first = pool.allocate().unwrap();
        let _second = pool.allocate().unwrap();
        assert_eq!(pool.allocated_count(), 2);

        assert!(pool.release(&first));
        assert_eq!(pool.allocated_count(), 1);

        // Lowest free address is handed out again
        assert_eq!(pool.allocate().unwrap(), first);
    }

    #[test]
    fn test_release_unallocated() {
        let mut pool = IpPool::new(net("10.0.1.0/24"));
        pool.allocate().unwrap();

        assert!(!pool.release(&ip("10.0.1.50")));
        assert!(!pool.release(&ip("192.168.0.1")));
        assert_eq!(pool.allocated_count(), 1);
    }

    #[test]
    fn test_specific_allocation() {
        let mut pool = IpPool::new(net("10.0.1.0/24"));

        let specific = ip("10.0.1.100");
        pool.allocate_specific(specific).unwrap();
        assert!(!pool.is_available(&specific));

        assert!(matches!(
            pool.allocate_specific(specific),
            Err(Error::AddressInUse { .. })
        ));
        assert!(matches!(
            pool.allocate_specific(ip("10.0.2.1")),
            Err(Error::AddressNotInPool { .. })
        ));
        assert!(matches!(
            pool.allocate_specific(ip("10.0.1.0")),
            Err(Error::AddressNotInPool { .. })
        ));
    }

    #[test]
    fn test_allocation_skips_reserved() {
        let mut pool = IpPool::new(net("10.0.1.0/24"));
        pool.allocate_specific(ip("10.0.1.1")).unwrap();
        pool.allocate_specific(ip("10.0.1.3")).unwrap();

        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.2"));
        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.4"));
    }

    #[test]
    fn test_pool_exhausted() {
        let mut pool = IpPool::new(net("10.0.1.0/30"));

        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.1"));
        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.2"));
        assert!(matches!(pool.allocate(), Err(Error::PoolExhausted(_))));
    }

    #[test]
    fn test_point_to_point_pool() {
        let mut pool = IpPool::new(net("10.0.1.0/31"));

        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.0"));
        assert_eq!(pool.allocate().unwrap(), ip("10.0.1.1"));
        assert!(pool.allocate().is_err());
    }

    #[test]
    fn test_ipv6_pool() {
        let mut pool = IpPool::new(net("2001:db8::/64"));

        assert_eq!(pool.allocate().unwrap(), ip("2001:db8::1"));
        assert_eq!(pool.allocate().unwrap(), ip("2001:db8::2"));
        assert!(!pool.contains(&ip("10.0.0.1")));
    }

    #[test]
    fn test_request_ip_lazy_pool() {
        let allocator = IpAllocator::new();
        let cidr = net("192.168.2.0/24");

        assert!(!allocator.has_pool(&cidr));
        assert_eq!(allocator.request_ip(&cidr, None).unwrap(), ip("192.168.2.1"));
        assert!(allocator.has_pool(&cidr));
        assert_eq!(allocator.request_ip(&cidr, None).unwrap(), ip("192.168.2.2"));
    }

    #[test]
    fn test_request_preferred_ip() {
        let allocator = IpAllocator::new();
        let cidr = net("192.168.2.0/24");

        let preferred = ip("192.168.2.10");
        assert_eq!(allocator.request_ip(&cidr, Some(preferred)).unwrap(), preferred);
        assert!(matches!(
            allocator.request_ip(&cidr, Some(preferred)),
            Err(Error::AddressInUse { .. })
        ));
        assert!(matches!(
            allocator.request_ip(&cidr, Some(ip("192.168.3.10"))),
            Err(Error::AddressNotInPool { .. })
        ));
    }

    #[test]
    fn test_release_ip() {
        let allocator = IpAllocator::new();
        let cidr = net("192.168.2.0/24");

        let first = allocator.request_ip(&cidr, None).unwrap();
        assert!(allocator.is_allocated(&cidr, &first));

        allocator.release_ip(&cidr, first).unwrap();
        assert!(!allocator.is_allocated(&cidr, &first));

        // Releasing twice or on an unknown pool is harmless
        allocator.release_ip(&cidr, first).unwrap();
        allocator.release_ip(&net("10.9.0.0/16"), ip("10.9.0.1")).unwrap();

        assert_eq!(allocator.request_ip(&cidr, None).unwrap(), first);
    }

    #[test]
    fn test_register_contained_subnet() {
        let allocator = IpAllocator::new();
        let fixed = net("192.168.2.0/24");

        allocator
            .register_subnet(net("192.168.1.1/16"), fixed)
            .unwrap();
        assert_eq!(allocator.request_ip(&fixed, None).unwrap(), ip("192.168.2.1"));
    }

    #[test]
    fn test_register_uncontained_subnet() {
        let allocator = IpAllocator::new();
        let fixed = net("192.168.2.0/24");

        let err = allocator
            .register_subnet(net("192.168.1.1/24"), fixed)
            .unwrap_err();
        assert!(matches!(err, Error::SubnetNotContained { .. }));
        assert!(!allocator.has_pool(&fixed));
    }

    #[test]
    fn test_register_less_specific_subnet() {
        let allocator = IpAllocator::new();

        assert!(allocator
            .register_subnet(net("192.168.1.1/24"), net("192.168.0.0/16"))
            .is_err());
        assert!(allocator
            .register_subnet(net("192.168.1.1/24"), net("2001:db8::/64"))
            .is_err());
    }

    #[test]
    fn test_register_twice() {
        let allocator = IpAllocator::new();
        let network = net("10.0.0.1/16");
        let fixed = net("10.0.5.0/24");

        allocator.register_subnet(network, fixed).unwrap();
        assert!(matches!(
            allocator.register_subnet(network, fixed),
            Err(Error::PoolExists(_))
        ));

        assert!(allocator.release_pool(&fixed));
        allocator.register_subnet(network, fixed).unwrap();
    }

    #[test]
    fn test_concurrent_requests_are_unique() {
        let allocator = IpAllocator::new();
        let cidr = net("10.20.0.0/24");

        let mut issued: Vec<IpAddr> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..25)
                            .map(|_| allocator.request_ip(&cidr, None).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        issued.sort();
        issued.dedup();
        assert_eq!(issued.len(), 200);
    }
}
