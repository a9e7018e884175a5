//! Bridge network driver
//!
//! Each network owns one bridge device. An endpoint is a veth pair whose
//! host end is enslaved to the bridge while the other end is handed to the
//! sandbox. Endpoint addresses come from the fixed CIDR when one is
//! configured, otherwise from the bridge network.

pub mod setup;

use crate::driver::{Driver, Interface, Options, SandboxInfo};
use crate::error::{Error, Result};
use crate::ipam::IpAllocator;
use crate::link::LinkOps;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use setup::{BridgeInterface, BridgeSetup};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Network type served by the bridge driver
pub const NETWORK_TYPE: &str = "bridge";

/// Bridge device name used when none is configured
pub const DEFAULT_BRIDGE_NAME: &str = "tether0";

/// Name of the endpoint interface inside the sandbox
const SANDBOX_INTERFACE: &str = "eth0";

/// Longest interface name the kernel accepts
const MAX_IFNAME_LEN: usize = 15;

/// Bridge network options
///
/// Recognized keys: `bridge_name`, `address_ipv4`, `address_ipv6`,
/// `enable_ipv6`, `fixed_cidr`, `fixed_cidr_v6`, `mtu`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    /// Bridge device name
    pub bridge_name: String,
    /// Primary IPv4 address with the bridge network prefix
    pub address_ipv4: Option<Ipv4Net>,
    /// Primary IPv6 address
    pub address_ipv6: Option<Ipv6Net>,
    /// Enable IPv6 on the bridge
    pub enable_ipv6: bool,
    /// IPv4 sub-range of the bridge network for endpoint addresses
    pub fixed_cidr: Option<Ipv4Net>,
    /// IPv6 sub-range for endpoint addresses
    pub fixed_cidr_v6: Option<Ipv6Net>,
    /// MTU of the bridge and its veth pairs
    pub mtu: Option<u32>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            address_ipv4: None,
            address_ipv6: None,
            enable_ipv6: false,
            fixed_cidr: None,
            fixed_cidr_v6: None,
            mtu: None,
        }
    }
}

impl Configuration {
    /// Whether the bridge carries IPv6
    pub fn ipv6_enabled(&self) -> bool {
        self.enable_ipv6 || self.address_ipv6.is_some()
    }

    /// Check settings that do not depend on host state
    pub fn validate(&self) -> Result<()> {
        let name = &self.bridge_name;
        if name.is_empty() || name.len() > MAX_IFNAME_LEN {
            return Err(Error::InvalidConfiguration(format!(
                "bridge name '{}' must be 1 to {} characters",
                name, MAX_IFNAME_LEN
            )));
        }
        if name.chars().any(|c| c == '/' || c.is_whitespace()) {
            return Err(Error::InvalidConfiguration(format!(
                "bridge name '{}' contains invalid characters",
                name
            )));
        }

        if let Some(mtu) = self.mtu {
            if !(68..=65535).contains(&mtu) {
                return Err(Error::InvalidConfiguration(format!(
                    "MTU {} out of range 68-65535",
                    mtu
                )));
            }
        }

        if self.fixed_cidr_v6.is_some() && !self.ipv6_enabled() {
            return Err(Error::InvalidConfiguration(
                "fixed_cidr_v6 requires IPv6 to be enabled".to_string(),
            ));
        }

        Ok(())
    }
}

/// Bridge endpoint options
///
/// Recognized keys: `address_ipv4`, `address_ipv6` (preferred addresses).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfiguration {
    pub address_ipv4: Option<Ipv4Addr>,
    pub address_ipv6: Option<Ipv6Addr>,
}

#[derive(Debug, Clone)]
struct BridgeEndpoint {
    host_veth: String,
    sandbox_veth: String,
    address: Ipv4Net,
    address_ipv6: Option<Ipv6Net>,
}

#[derive(Debug)]
struct BridgeNetwork {
    id: String,
    bridge: BridgeInterface,
    address: Ipv4Net,
    pool_v4: Ipv4Net,
    endpoints: Mutex<HashMap<String, BridgeEndpoint>>,
}

impl BridgeNetwork {
    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, BridgeEndpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Driver provisioning networks as bridge devices
pub struct BridgeDriver {
    links: Arc<dyn LinkOps>,
    allocator: Arc<IpAllocator>,
    networks: Mutex<HashMap<String, Arc<BridgeNetwork>>>,
}

impl BridgeDriver {
    pub fn new(links: Arc<dyn LinkOps>, allocator: Arc<IpAllocator>) -> Self {
        Self {
            links,
            allocator,
            networks: Mutex::new(HashMap::new()),
        }
    }

    /// Allocator backing endpoint addresses
    pub fn allocator(&self) -> &Arc<IpAllocator> {
        &self.allocator
    }

    /// Bridge state of a network
    pub fn bridge(&self, network_id: &str) -> Option<BridgeInterface> {
        self.networks()
            .get(network_id)
            .map(|network| network.bridge.clone())
    }

    fn networks(&self) -> MutexGuard<'_, HashMap<String, Arc<BridgeNetwork>>> {
        self.networks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn network(&self, id: &str) -> Result<Arc<BridgeNetwork>> {
        self.networks()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))
    }

    fn release_pools(&self, bridge: &BridgeInterface) {
        for pool in &bridge.pools {
            self.allocator.release_pool(pool);
        }
    }

    /// Undo a failed setup: drop its pools and the device if setup created it
    fn abandon(&self, bridge: &BridgeInterface) {
        self.release_pools(bridge);
        if bridge.created {
            if let Err(e) = self.remove_link(bridge.name()) {
                warn!(bridge = %bridge.name(), error = %e, "failed to remove bridge after setup failure");
            }
        }
    }

    /// Delete a link; one that is already gone counts as removed
    fn remove_link(&self, name: &str) -> Result<()> {
        match self.links.delete_link(name) {
            Err(Error::LinkNotFound(_)) => {
                debug!(link = %name, "link already removed");
                Ok(())
            }
            other => other,
        }
    }

    fn release_addresses(&self, network: &BridgeNetwork, addresses: &[IpAddr]) {
        for &addr in addresses {
            let pool = match addr {
                IpAddr::V4(_) => IpNet::V4(network.pool_v4),
                IpAddr::V6(_) => match network.bridge.pool_v6 {
                    Some(pool) => IpNet::V6(pool),
                    None => continue,
                },
            };
            if let Err(e) = self.allocator.release_ip(&pool, addr) {
                warn!(network = %network.id, %addr, error = %e, "failed to release address");
            }
        }
    }

    /// Allocate the endpoint's IPv4 and (when enabled) IPv6 addresses
    fn allocate_addresses(
        &self,
        network: &BridgeNetwork,
        config: &EndpointConfiguration,
    ) -> Result<(Ipv4Net, Option<Ipv6Net>)> {
        let requested = self
            .allocator
            .request_ip(&IpNet::V4(network.pool_v4), config.address_ipv4.map(IpAddr::V4))?;
        let IpAddr::V4(ip4) = requested else {
            return Err(Error::AddressNotInPool {
                ip: requested,
                cidr: network.pool_v4.to_string(),
            });
        };
        let address = Ipv4Net::new(ip4, network.address.prefix_len())
            .map_err(|e| Error::Setup(e.to_string()))?;

        let Some(pool_v6) = network.bridge.pool_v6 else {
            return Ok((address, None));
        };

        let requested = self
            .allocator
            .request_ip(&IpNet::V6(pool_v6), config.address_ipv6.map(IpAddr::V6))
            .and_then(|ip| match ip {
                IpAddr::V6(ip) => Ok(ip),
                other => Err(Error::AddressNotInPool {
                    ip: other,
                    cidr: pool_v6.to_string(),
                }),
            });
        let ip6 = match requested {
            Ok(ip) => ip,
            Err(e) => {
                self.release_addresses(network, &[IpAddr::V4(ip4)]);
                return Err(e);
            }
        };
        let prefix = match network.bridge.address_ipv6 {
            Some(a) if !setup::is_link_local(&IpNet::V6(a)) => a.prefix_len(),
            _ => pool_v6.prefix_len(),
        };
        let address_ipv6 = Ipv6Net::new(ip6, prefix).map_err(|e| Error::Setup(e.to_string()))?;

        Ok((address, Some(address_ipv6)))
    }

    /// Create the veth pair and wire its host end into the bridge
    fn create_veth_pair(&self, network: &BridgeNetwork, host: &str, peer: &str) -> Result<()> {
        self.links.create_veth(host, peer)?;

        let wired = (|| -> Result<()> {
            self.links.set_master(host, network.bridge.name())?;
            if let Some(mtu) = network.bridge.config.mtu {
                self.links.set_mtu(host, mtu)?;
                self.links.set_mtu(peer, mtu)?;
            }
            self.links.set_up(host)
        })();

        if wired.is_err() {
            if let Err(e) = self.links.delete_link(host) {
                warn!(veth = %host, error = %e, "failed to remove veth pair");
            }
        }
        wired
    }
}

/// Host and sandbox side names of an endpoint's veth pair
fn veth_names(endpoint_id: &str) -> (String, String) {
    let short: String = endpoint_id.chars().take(7).collect();
    (format!("veth{}", short), format!("vpeer{}", short))
}

fn addresses_of(endpoint: &BridgeEndpoint) -> Vec<IpAddr> {
    let mut addrs = vec![IpAddr::V4(endpoint.address.addr())];
    if let Some(v6) = endpoint.address_ipv6 {
        addrs.push(IpAddr::V6(v6.addr()));
    }
    addrs
}

impl Driver for BridgeDriver {
    fn network_type(&self) -> &'static str {
        NETWORK_TYPE
    }

    fn create_network(&self, id: &str, options: &Options) -> Result<()> {
        let config: Configuration = options.decode()?;
        config.validate()?;

        {
            let networks = self.networks();
            if networks.contains_key(id) {
                return Err(Error::NetworkExists(id.to_string()));
            }
            if networks
                .values()
                .any(|n| n.bridge.name() == config.bridge_name)
            {
                return Err(Error::BridgeInUse(config.bridge_name));
            }
        }

        let mut bridge = BridgeInterface::new(config);
        let mut setup = BridgeSetup::new();
        if let Err(e) = setup.run(&mut bridge, self.links.as_ref(), &self.allocator) {
            self.abandon(&bridge);
            return Err(e);
        }

        let (Some(address), Some(pool_v4)) = (bridge.address_ipv4, bridge.pool_v4) else {
            self.abandon(&bridge);
            return Err(Error::Setup(format!(
                "bridge '{}' finished setup without an IPv4 pool",
                bridge.name()
            )));
        };
        let network = BridgeNetwork {
            id: id.to_string(),
            bridge,
            address,
            pool_v4,
            endpoints: Mutex::new(HashMap::new()),
        };

        info!(
            network = %id,
            bridge = %network.bridge.name(),
            address = %network.address,
            pool = %network.pool_v4,
            "bridge network created"
        );
        self.networks().insert(id.to_string(), Arc::new(network));
        Ok(())
    }

    fn delete_network(&self, id: &str) -> Result<()> {
        let network = {
            let mut networks = self.networks();
            let network = networks
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NetworkNotFound(id.to_string()))?;
            if !network.endpoints().is_empty() {
                return Err(Error::NetworkHasActiveEndpoints(id.to_string()));
            }
            networks.remove(id);
            network
        };

        if network.bridge.created {
            if let Err(e) = self.remove_link(network.bridge.name()) {
                warn!(network = %id, error = %e, "bridge removal failed, keeping network");
                self.networks().insert(id.to_string(), network);
                return Err(e);
            }
        }

        self.release_pools(&network.bridge);
        info!(network = %id, bridge = %network.bridge.name(), "bridge network deleted");
        Ok(())
    }

    fn create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        sandbox_key: &str,
        options: &Options,
    ) -> Result<SandboxInfo> {
        let config: EndpointConfiguration = options.decode()?;
        let network = self.network(network_id)?;
        if network.endpoints().contains_key(endpoint_id) {
            return Err(Error::EndpointExists(endpoint_id.to_string()));
        }

        let (address, address_ipv6) = self.allocate_addresses(&network, &config)?;
        let endpoint = {
            let (host_veth, sandbox_veth) = veth_names(endpoint_id);
            BridgeEndpoint {
                host_veth,
                sandbox_veth,
                address,
                address_ipv6,
            }
        };

        if let Err(e) = self.create_veth_pair(&network, &endpoint.host_veth, &endpoint.sandbox_veth) {
            self.release_addresses(&network, &addresses_of(&endpoint));
            return Err(e);
        }

        let info = SandboxInfo {
            interfaces: vec![Interface {
                src_name: endpoint.sandbox_veth.clone(),
                dst_name: SANDBOX_INTERFACE.to_string(),
                address: Some(endpoint.address),
                address_ipv6: endpoint.address_ipv6,
            }],
            gateway: Some(network.address.addr()),
            gateway_ipv6: network
                .bridge
                .pool_v6
                .and(network.bridge.address_ipv6)
                .map(|a| a.addr()),
        };

        debug!(
            network = %network_id,
            endpoint = %endpoint_id,
            sandbox = %sandbox_key,
            veth = %endpoint.host_veth,
            address = %endpoint.address,
            "bridge endpoint created"
        );
        network
            .endpoints()
            .insert(endpoint_id.to_string(), endpoint);
        Ok(info)
    }

    fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let network = self.network(network_id)?;
        let endpoint = network
            .endpoints()
            .remove(endpoint_id)
            .ok_or_else(|| Error::EndpointNotFound(endpoint_id.to_string()))?;

        if let Err(e) = self.remove_link(&endpoint.host_veth) {
            warn!(endpoint = %endpoint_id, error = %e, "veth removal failed, keeping endpoint");
            network
                .endpoints()
                .insert(endpoint_id.to_string(), endpoint);
            return Err(e);
        }

        self.release_addresses(&network, &addresses_of(&endpoint));
        debug!(network = %network_id, endpoint = %endpoint_id, "bridge endpoint deleted");
        Ok(())
    }
}
