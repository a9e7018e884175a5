//! Bridge device and address setup
//!
//! Setup runs strictly in order: device, primary addresses, allocation
//! pools. A failing step aborts the sequence and returns its error. The
//! bridge device is never removed here; that is left to the caller.

use crate::driver::bridge::Configuration;
use crate::error::{Error, Result};
use crate::ipam::IpAllocator;
use crate::link::{LinkKind, LinkOps};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

// Kept apart from the crate `Result` alias, which the macro expansion
// would otherwise pick up.
mod machine {
    use state_machines::state_machine;

    state_machine! {
        name: SetupMachine,
        dynamic: true,
        initial: Pending,
        states: [Pending, Device, Addressed, Ready, Failed],
        events {
            provision {
                transition: { from: Pending, to: Device }
            }
            address {
                transition: { from: Device, to: Addressed }
            }
            finish {
                transition: { from: Addressed, to: Ready }
            }
            fail {
                transition: { from: [Pending, Device, Addressed], to: Failed }
            }
        }
    }
}

use machine::*;

/// Ranges tried in order when no bridge IPv4 address is configured
const BRIDGE_CANDIDATES: &[([u8; 4], u8)] = &[
    ([172, 17, 42, 1], 16),
    ([10, 0, 42, 1], 16),
    ([10, 1, 42, 1], 16),
    ([10, 42, 42, 1], 16),
    ([172, 16, 42, 1], 24),
    ([172, 16, 43, 1], 24),
    ([172, 16, 44, 1], 24),
    ([10, 0, 42, 1], 24),
    ([10, 0, 43, 1], 24),
    ([192, 168, 42, 1], 24),
    ([192, 168, 43, 1], 24),
    ([192, 168, 44, 1], 24),
];

/// Bridge IPv6 address used when IPv6 is enabled without one
pub const DEFAULT_BRIDGE_IPV6: (Ipv6Addr, u8) = (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1), 64);

/// A bridge device being set up, with the addresses resolved so far
#[derive(Debug, Clone)]
pub struct BridgeInterface {
    pub config: Configuration,
    /// Primary IPv4 address (configured or elected)
    pub address_ipv4: Option<Ipv4Net>,
    /// Primary IPv6 address
    pub address_ipv6: Option<Ipv6Net>,
    /// Subnet endpoint IPv4 addresses are allocated from
    pub pool_v4: Option<Ipv4Net>,
    /// Subnet endpoint IPv6 addresses are allocated from
    pub pool_v6: Option<Ipv6Net>,
    /// Allocator pools registered by this bridge
    pub pools: Vec<IpNet>,
    /// Whether the device was created (rather than found) during setup
    pub created: bool,
}

impl BridgeInterface {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            address_ipv4: None,
            address_ipv6: None,
            pool_v4: None,
            pool_v6: None,
            pools: Vec::new(),
            created: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.bridge_name
    }
}

/// Ensure the bridge device exists and is up
///
/// An existing bridge of the same name is reused, so running this twice is
/// harmless. A device of another kind under that name is an error.
pub fn setup_device(bridge: &mut BridgeInterface, links: &dyn LinkOps) -> Result<()> {
    let name = bridge.name().to_string();

    match links.link_kind(&name)? {
        Some(LinkKind::Bridge) => debug!(bridge = %name, "bridge already exists"),
        Some(_) => return Err(Error::LinkNotBridge(name)),
        None => {
            links.create_bridge(&name)?;
            bridge.created = true;
            info!(bridge = %name, "created bridge");
        }
    }

    if let Some(mtu) = bridge.config.mtu {
        links.set_mtu(&name, mtu)?;
    }

    links.set_up(&name)
}

/// Assign the primary IPv4 address, electing one when none is configured
pub fn setup_bridge_ipv4(bridge: &mut BridgeInterface, links: &dyn LinkOps) -> Result<()> {
    let address = match bridge.config.address_ipv4 {
        Some(address) => address,
        None => elect_bridge_ipv4(bridge.name(), &links.host_addresses()?)?,
    };

    replace_address(links, bridge.name(), IpNet::V4(address))?;
    debug!(bridge = %bridge.name(), %address, "assigned bridge IPv4 address");
    bridge.address_ipv4 = Some(address);
    Ok(())
}

/// Assign the primary IPv6 address when IPv6 is enabled
pub fn setup_bridge_ipv6(bridge: &mut BridgeInterface, links: &dyn LinkOps) -> Result<()> {
    if !bridge.config.ipv6_enabled() {
        return Ok(());
    }

    let address = match bridge.config.address_ipv6 {
        Some(address) => address,
        None => {
            let (addr, prefix) = DEFAULT_BRIDGE_IPV6;
            Ipv6Net::new(addr, prefix).map_err(|e| Error::Setup(e.to_string()))?
        }
    };

    replace_address(links, bridge.name(), IpNet::V6(address))?;
    debug!(bridge = %bridge.name(), %address, "assigned bridge IPv6 address");
    bridge.address_ipv6 = Some(address);
    Ok(())
}

/// Register the IPv4 fixed CIDR as the endpoint allocation pool
///
/// Containment of the fixed CIDR in the bridge network is validated by the
/// allocator's subnet registration and reported as `InvalidFixedCidr`.
pub fn setup_fixed_cidr_v4(bridge: &mut BridgeInterface, allocator: &IpAllocator) -> Result<()> {
    let Some(fixed) = bridge.config.fixed_cidr else {
        return Ok(());
    };
    let address = bridge
        .address_ipv4
        .ok_or_else(|| Error::Setup(format!("bridge '{}' has no IPv4 address", bridge.name())))?;

    register_pool(
        bridge,
        allocator,
        IpNet::V4(address),
        Some(IpAddr::V4(address.addr())),
        IpNet::V4(fixed),
    )?;
    bridge.pool_v4 = Some(fixed);
    Ok(())
}

/// Register the IPv6 fixed CIDR as the endpoint allocation pool
///
/// A link-local bridge address does not scope global addresses, so the
/// fixed CIDR then stands as its own network.
pub fn setup_fixed_cidr_v6(bridge: &mut BridgeInterface, allocator: &IpAllocator) -> Result<()> {
    let Some(fixed) = bridge.config.fixed_cidr_v6 else {
        return Ok(());
    };
    let address = bridge
        .address_ipv6
        .ok_or_else(|| Error::Setup(format!("bridge '{}' has no IPv6 address", bridge.name())))?;

    if is_link_local(&IpNet::V6(address)) {
        register_pool(bridge, allocator, IpNet::V6(fixed), None, IpNet::V6(fixed))?;
    } else {
        register_pool(
            bridge,
            allocator,
            IpNet::V6(address),
            Some(IpAddr::V6(address.addr())),
            IpNet::V6(fixed),
        )?;
    }
    bridge.pool_v6 = Some(fixed);
    Ok(())
}

/// Register the IPv4 allocation pool: the fixed CIDR when configured,
/// otherwise the whole bridge network
pub fn setup_pool_v4(bridge: &mut BridgeInterface, allocator: &IpAllocator) -> Result<()> {
    if bridge.config.fixed_cidr.is_some() {
        return setup_fixed_cidr_v4(bridge, allocator);
    }

    let address = bridge
        .address_ipv4
        .ok_or_else(|| Error::Setup(format!("bridge '{}' has no IPv4 address", bridge.name())))?;
    let network = address.trunc();

    register_pool(
        bridge,
        allocator,
        IpNet::V4(address),
        Some(IpAddr::V4(address.addr())),
        IpNet::V4(network),
    )?;
    bridge.pool_v4 = Some(network);
    Ok(())
}

/// Register `pool` within `network`, reserving the bridge's own address
/// (`gateway`) when it falls inside the pool
fn register_pool(
    bridge: &mut BridgeInterface,
    allocator: &IpAllocator,
    network: IpNet,
    gateway: Option<IpAddr>,
    pool: IpNet,
) -> Result<()> {
    let invalid = |source: Error| Error::InvalidFixedCidr {
        subnet: pool,
        network: network.trunc(),
        source: Box::new(source),
    };

    allocator.register_subnet(network, pool).map_err(invalid)?;

    if let Some(gateway) = gateway.filter(|g| pool.contains(g)) {
        if let Err(e) = allocator.request_ip(&pool, Some(gateway)) {
            allocator.release_pool(&pool);
            return Err(invalid(e));
        }
    }

    info!(bridge = %bridge.name(), %pool, "registered allocation pool");
    bridge.pools.push(pool);
    Ok(())
}

/// Pick the first candidate range that overlaps no address on the host
pub fn elect_bridge_ipv4(bridge: &str, host_addresses: &[IpNet]) -> Result<Ipv4Net> {
    for &(octets, prefix) in BRIDGE_CANDIDATES {
        let candidate = Ipv4Net::new(Ipv4Addr::from(octets), prefix)
            .map_err(|e| Error::Setup(e.to_string()))?;
        let candidate_net = IpNet::V4(candidate);

        if !host_addresses.iter().any(|a| overlaps(&candidate_net, a)) {
            info!(bridge, address = %candidate, "elected bridge IPv4 address");
            return Ok(candidate);
        }
    }

    Err(Error::NoBridgeAddress(bridge.to_string()))
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    let (a, b) = (a.trunc(), b.trunc());
    a.contains(&b.network()) || b.contains(&a.network())
}

pub(super) fn is_link_local(addr: &IpNet) -> bool {
    match addr.addr() {
        IpAddr::V6(a) => (a.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}

/// Make `target` the device's address of its family
///
/// Other addresses of the same family are removed, except IPv6 link-local
/// ones which the kernel manages. Already present addresses are kept.
fn replace_address(links: &dyn LinkOps, name: &str, target: IpNet) -> Result<()> {
    let mut present = false;

    for existing in links.addresses(name)? {
        if existing == target {
            present = true;
            continue;
        }
        let same_family = existing.addr().is_ipv4() == target.addr().is_ipv4();
        if same_family && !is_link_local(&existing) {
            debug!(bridge = %name, address = %existing, "removing stale address");
            links.del_address(name, existing)?;
        }
    }

    if !present {
        links.add_address(name, target)?;
    }
    Ok(())
}

/// Ordered setup of one bridge
pub struct BridgeSetup {
    machine: DynamicSetupMachine<()>,
}

impl Default for BridgeSetup {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeSetup {
    pub fn new() -> Self {
        Self {
            machine: SetupMachine::new(()).into_dynamic(),
        }
    }

    /// Current setup state
    pub fn state(&self) -> &str {
        self.machine.current_state()
    }

    /// Run every setup step in order
    pub fn run(
        &mut self,
        bridge: &mut BridgeInterface,
        links: &dyn LinkOps,
        allocator: &IpAllocator,
    ) -> Result<()> {
        let result = self.steps(bridge, links, allocator);

        if let Err(ref e) = result {
            warn!(bridge = %bridge.name(), state = self.state(), error = %e, "bridge setup failed");
            if let Err(transition) = self.machine.handle(SetupMachineEvent::Fail) {
                debug!(error = ?transition, "setup already finished");
            }
        }
        result
    }

    fn steps(
        &mut self,
        bridge: &mut BridgeInterface,
        links: &dyn LinkOps,
        allocator: &IpAllocator,
    ) -> Result<()> {
        setup_device(bridge, links)?;
        self.advance(SetupMachineEvent::Provision)?;

        setup_bridge_ipv4(bridge, links)?;
        setup_bridge_ipv6(bridge, links)?;
        self.advance(SetupMachineEvent::Address)?;

        setup_pool_v4(bridge, allocator)?;
        setup_fixed_cidr_v6(bridge, allocator)?;
        self.advance(SetupMachineEvent::Finish)
    }

    fn advance(&mut self, event: SetupMachineEvent) -> Result<()> {
        self.machine
            .handle(event)
            .map_err(|e| Error::Setup(format!("{:?}", e)))
    }
}
