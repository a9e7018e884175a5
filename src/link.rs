//! Network device primitives
//!
//! Provides:
//! - The `LinkOps` capability used by drivers to create and address devices
//! - An iproute2 backend for real hosts
//! - An in-memory backend for tests and dry runs

pub mod iproute;
pub mod memory;

use crate::error::Result;
use ipnet::IpNet;
use std::fmt;

pub use iproute::IpRoute;
pub use memory::{LinkOp, MemoryLinks};

/// Kind of a network device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Veth,
    Other,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Bridge => write!(f, "bridge"),
            LinkKind::Veth => write!(f, "veth"),
            LinkKind::Other => write!(f, "other"),
        }
    }
}

/// Device and address operations of the host
///
/// Implementations must be safe to call concurrently for different devices.
/// Serializing operations on the same device is left to the caller.
pub trait LinkOps: Send + Sync {
    /// Kind of the device `name`, or `None` when it does not exist
    fn link_kind(&self, name: &str) -> Result<Option<LinkKind>>;

    /// Create a bridge device
    fn create_bridge(&self, name: &str) -> Result<()>;

    /// Create a veth pair
    fn create_veth(&self, name: &str, peer: &str) -> Result<()>;

    /// Delete a device (deleting one end of a veth pair removes both)
    fn delete_link(&self, name: &str) -> Result<()>;

    /// Bring a device administratively up
    fn set_up(&self, name: &str) -> Result<()>;

    /// Set the MTU of a device
    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()>;

    /// Enslave a device to a bridge
    fn set_master(&self, name: &str, master: &str) -> Result<()>;

    /// Addresses assigned to a device
    fn addresses(&self, name: &str) -> Result<Vec<IpNet>>;

    /// Assign an address to a device
    fn add_address(&self, name: &str, addr: IpNet) -> Result<()>;

    /// Remove an address from a device
    fn del_address(&self, name: &str, addr: IpNet) -> Result<()>;

    /// Every address assigned on the host
    fn host_addresses(&self) -> Result<Vec<IpNet>>;
}
