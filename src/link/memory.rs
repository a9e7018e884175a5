//! In-memory host for device primitives
//!
//! Simulates devices and addresses without touching the OS. Any primitive
//! can be made to fail with `inject_fault`, which lets tests drive the
//! rollback paths of drivers and of the controller.

use crate::error::{Error, Result};
use crate::link::{LinkKind, LinkOps};
use ipnet::IpNet;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Primitive operations that can fail on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOp {
    CreateBridge,
    CreateVeth,
    DeleteLink,
    SetUp,
    SetMtu,
    SetMaster,
    AddAddress,
    DelAddress,
}

impl fmt::Display for LinkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkOp::CreateBridge => "create_bridge",
            LinkOp::CreateVeth => "create_veth",
            LinkOp::DeleteLink => "delete_link",
            LinkOp::SetUp => "set_up",
            LinkOp::SetMtu => "set_mtu",
            LinkOp::SetMaster => "set_master",
            LinkOp::AddAddress => "add_address",
            LinkOp::DelAddress => "del_address",
        };
        f.write_str(name)
    }
}

/// Snapshot of a simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimLink {
    pub kind: LinkKind,
    pub up: bool,
    pub mtu: u32,
    pub master: Option<String>,
    pub peer: Option<String>,
    pub addresses: Vec<IpNet>,
}

impl SimLink {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            up: false,
            mtu: 1500,
            master: None,
            peer: None,
            addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    links: BTreeMap<String, SimLink>,
    faults: HashSet<LinkOp>,
}

/// Simulated host devices
#[derive(Debug, Default)]
pub struct MemoryLinks {
    state: Mutex<HostState>,
}

impl MemoryLinks {
    /// Create an empty host
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pre-existing device carrying `addresses`
    pub fn with_link(self, name: &str, kind: LinkKind, addresses: &[IpNet]) -> Self {
        {
            let mut state = self.lock();
            let mut link = SimLink::new(kind);
            link.up = true;
            link.addresses = addresses.to_vec();
            state.links.insert(name.to_string(), link);
        }
        self
    }

    /// Make every call of `op` fail until cleared
    pub fn inject_fault(&self, op: LinkOp) {
        self.lock().faults.insert(op);
    }

    /// Remove a fault injected with `inject_fault`
    pub fn clear_fault(&self, op: LinkOp) {
        self.lock().faults.remove(&op);
    }

    /// Snapshot of a device
    pub fn link(&self, name: &str) -> Option<SimLink> {
        self.lock().links.get(name).cloned()
    }

    /// Names of all devices
    pub fn link_names(&self) -> Vec<String> {
        self.lock().links.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_fault(state: &HostState, op: LinkOp, name: &str) -> Result<()> {
        if state.faults.contains(&op) {
            return Err(Error::Link {
                op: op.to_string(),
                name: name.to_string(),
                message: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn modify<F>(&self, op: LinkOp, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut SimLink) -> Result<()>,
    {
        let mut state = self.lock();
        Self::check_fault(&state, op, name)?;
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))?;
        f(link)
    }

    fn exists_error(op: LinkOp, name: &str) -> Error {
        Error::Link {
            op: op.to_string(),
            name: name.to_string(),
            message: "device already exists".to_string(),
        }
    }
}

impl LinkOps for MemoryLinks {
    fn link_kind(&self, name: &str) -> Result<Option<LinkKind>> {
        Ok(self.lock().links.get(name).map(|link| link.kind))
    }

    fn create_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, LinkOp::CreateBridge, name)?;
        if state.links.contains_key(name) {
            return Err(Self::exists_error(LinkOp::CreateBridge, name));
        }
        state
            .links
            .insert(name.to_string(), SimLink::new(LinkKind::Bridge));
        Ok(())
    }

    fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, LinkOp::CreateVeth, name)?;
        for n in [name, peer] {
            if state.links.contains_key(n) {
                return Err(Self::exists_error(LinkOp::CreateVeth, n));
            }
        }

        let mut host = SimLink::new(LinkKind::Veth);
        host.peer = Some(peer.to_string());
        let mut other = SimLink::new(LinkKind::Veth);
        other.peer = Some(name.to_string());
        state.links.insert(name.to_string(), host);
        state.links.insert(peer.to_string(), other);
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, LinkOp::DeleteLink, name)?;
        let link = state
            .links
            .remove(name)
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))?;

        if let Some(peer) = link.peer {
            state.links.remove(&peer);
        }
        // Members of a deleted bridge are released
        for other in state.links.values_mut() {
            if other.master.as_deref() == Some(name) {
                other.master = None;
            }
        }
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.modify(LinkOp::SetUp, name, |link| {
            link.up = true;
            Ok(())
        })
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        self.modify(LinkOp::SetMtu, name, |link| {
            link.mtu = mtu;
            Ok(())
        })
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_fault(&state, LinkOp::SetMaster, name)?;
        match state.links.get(master) {
            Some(link) if link.kind == LinkKind::Bridge => {}
            Some(_) => return Err(Error::LinkNotBridge(master.to_string())),
            None => return Err(Error::LinkNotFound(master.to_string())),
        }
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))?;
        link.master = Some(master.to_string());
        Ok(())
    }

    fn addresses(&self, name: &str) -> Result<Vec<IpNet>> {
        self.lock()
            .links
            .get(name)
            .map(|link| link.addresses.clone())
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))
    }

    fn add_address(&self, name: &str, addr: IpNet) -> Result<()> {
        self.modify(LinkOp::AddAddress, name, |link| {
            if link.addresses.contains(&addr) {
                return Err(Error::Link {
                    op: LinkOp::AddAddress.to_string(),
                    name: name.to_string(),
                    message: format!("address {} already assigned", addr),
                });
            }
            link.addresses.push(addr);
            Ok(())
        })
    }

    fn del_address(&self, name: &str, addr: IpNet) -> Result<()> {
        self.modify(LinkOp::DelAddress, name, |link| {
            let before = link.addresses.len();
            link.addresses.retain(|a| *a != addr);
            if link.addresses.len() == before {
                return Err(Error::Link {
                    op: LinkOp::DelAddress.to_string(),
                    name: name.to_string(),
                    message: format!("address {} not assigned", addr),
                });
            }
            Ok(())
        })
    }

    fn host_addresses(&self) -> Result<Vec<IpNet>> {
        Ok(self
            .lock()
            .links
            .values()
            .flat_map(|link| link.addresses.iter().copied())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_bridge_twice() {
        let links = MemoryLinks::new();
        links.create_bridge("br0").unwrap();

        assert_eq!(links.link_kind("br0").unwrap(), Some(LinkKind::Bridge));
        assert!(links.create_bridge("br0").is_err());
        assert_eq!(links.link_names(), vec!["br0".to_string()]);
    }

    #[test]
    fn test_veth_pair_deleted_together() {
        let links = MemoryLinks::new();
        links.create_bridge("br0").unwrap();
        links.create_veth("veth0", "vpeer0").unwrap();
        links.set_master("veth0", "br0").unwrap();

        assert_eq!(links.link("veth0").unwrap().master.as_deref(), Some("br0"));

        links.delete_link("vpeer0").unwrap();
        assert!(links.link("veth0").is_none());
        assert_eq!(links.link_names(), vec!["br0".to_string()]);
    }

    #[test]
    fn test_set_master_requires_bridge() {
        let links = MemoryLinks::new();
        links.create_veth("veth0", "vpeer0").unwrap();

        assert!(matches!(
            links.set_master("veth0", "vpeer0"),
            Err(Error::LinkNotBridge(_))
        ));
        assert!(matches!(
            links.set_master("veth0", "missing"),
            Err(Error::LinkNotFound(_))
        ));
    }

    #[test]
    fn test_addresses() {
        let links = MemoryLinks::new();
        links.create_bridge("br0").unwrap();
        let addr: IpNet = "10.0.0.1/24".parse().unwrap();

        links.add_address("br0", addr).unwrap();
        assert!(links.add_address("br0", addr).is_err());
        assert_eq!(links.addresses("br0").unwrap(), vec![addr]);
        assert_eq!(links.host_addresses().unwrap(), vec![addr]);

        links.del_address("br0", addr).unwrap();
        assert!(links.del_address("br0", addr).is_err());
        assert!(links.addresses("br0").unwrap().is_empty());
    }

    #[test]
    fn test_inject_fault() {
        let links = MemoryLinks::new();
        links.inject_fault(LinkOp::CreateBridge);

        let err = links.create_bridge("br0").unwrap_err();
        assert!(matches!(err, Error::Link { ref op, .. } if op == "create_bridge"));
        assert!(links.link("br0").is_none());

        links.clear_fault(LinkOp::CreateBridge);
        links.create_bridge("br0").unwrap();
    }

    #[test]
    fn test_preexisting_link() {
        let addr: IpNet = "172.17.0.1/16".parse().unwrap();
        let links = MemoryLinks::new().with_link("eth0", LinkKind::Other, &[addr]);

        let link = links.link("eth0").unwrap();
        assert!(link.up);
        assert_eq!(link.addresses, vec![addr]);
    }
}
