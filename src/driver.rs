//! Network drivers
//!
//! Provides:
//! - The `Driver` capability every network backend implements
//! - Generic driver options and the sandbox connectivity info drivers return
//! - The registry mapping a network type to its driver

pub mod bridge;
pub mod null;

use crate::error::{Error, Result};
use crate::ipam::IpAllocator;
use crate::link::LinkOps;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

pub use bridge::BridgeDriver;
pub use null::NullDriver;

/// Driver specific options
///
/// A schema-less value that each driver decodes into its own typed
/// configuration. `null` decodes to the driver's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(serde_json::Value);

impl Options {
    /// Options carrying no settings
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap a raw value
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Build options from any serializable value
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self)
            .map_err(Error::InvalidOptions)
    }

    /// Check whether no settings are present
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Decode into a driver configuration
    pub fn decode<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.0.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.0.clone()).map_err(Error::InvalidOptions)
    }

    /// Raw value
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for Options {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// An interface to place inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interface {
    /// Name of the device on the host side before it is moved
    pub src_name: String,
    /// Name the device takes inside the sandbox
    pub dst_name: String,
    /// IPv4 address with the network prefix
    pub address: Option<Ipv4Net>,
    /// IPv6 address with the network prefix
    pub address_ipv6: Option<Ipv6Net>,
}

/// Connectivity a driver hands to the sandbox of an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SandboxInfo {
    pub interfaces: Vec<Interface>,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_ipv6: Option<Ipv6Addr>,
}

/// Backend provisioning networks and endpoints of one network type
///
/// Hooks may block on OS calls. They are never invoked while a controller
/// or network lock is held.
pub trait Driver: Send + Sync {
    /// Network type served by this driver (e.g. "bridge")
    fn network_type(&self) -> &'static str;

    /// Provision backing state for a new network
    fn create_network(&self, id: &str, options: &Options) -> Result<()>;

    /// Tear down the backing state of a network
    fn delete_network(&self, id: &str) -> Result<()>;

    /// Provision an endpoint and describe how its sandbox connects
    fn create_endpoint(
        &self,
        network_id: &str,
        endpoint_id: &str,
        sandbox_key: &str,
        options: &Options,
    ) -> Result<SandboxInfo>;

    /// Tear down an endpoint
    fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()>;
}

/// Drivers keyed by network type
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its network type
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Result<()> {
        let name = driver.network_type();
        if self.drivers.contains_key(name) {
            return Err(Error::DriverAlreadyRegistered(name.to_string()));
        }
        self.drivers.insert(name.to_string(), driver);
        Ok(())
    }

    /// Look up the driver for a network type
    pub fn get(&self, network_type: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(network_type)
            .cloned()
            .ok_or_else(|| Error::UnknownDriver(network_type.to_string()))
    }

    /// Registered network types
    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}

/// Network types built into the crate
pub const BUILTIN_DRIVERS: &[&str] = &[bridge::NETWORK_TYPE, null::NETWORK_TYPE];

/// Build the registry of built-in drivers on top of `links`
pub fn enumerate_drivers(links: Arc<dyn LinkOps>) -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    let drivers: [Arc<dyn Driver>; 2] = [
        Arc::new(BridgeDriver::new(links, Arc::new(IpAllocator::new()))),
        Arc::new(NullDriver),
    ];
    for driver in drivers {
        registry
            .drivers
            .insert(driver.network_type().to_string(), driver);
    }
    registry
}
