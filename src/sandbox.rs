//! Sandbox side of an endpoint
//!
//! The sandbox (the container's network namespace) lives outside this
//! crate. Drivers describe what it needs in a `SandboxInfo`, which is
//! applied through the `Sandbox` trait.

use crate::driver::{Interface, SandboxInfo};
use crate::error::Result;
use serde::Serialize;
use std::net::IpAddr;

/// A container's isolated network namespace
pub trait Sandbox {
    /// Key identifying the sandbox (for namespaces, a filesystem path)
    fn key(&self) -> &str;

    /// Move an interface into the sandbox and configure it
    fn add_interface(&mut self, iface: &Interface) -> Result<()>;

    /// Set the default gateway
    fn set_gateway(&mut self, gateway: IpAddr) -> Result<()>;
}

impl SandboxInfo {
    /// Add every interface to `sandbox`, then set its gateways
    pub fn apply(&self, sandbox: &mut dyn Sandbox) -> Result<()> {
        for iface in &self.interfaces {
            sandbox.add_interface(iface)?;
        }
        if let Some(gateway) = self.gateway {
            sandbox.set_gateway(IpAddr::V4(gateway))?;
        }
        if let Some(gateway) = self.gateway_ipv6 {
            sandbox.set_gateway(IpAddr::V6(gateway))?;
        }
        Ok(())
    }
}

/// Sandbox that records what was applied to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemorySandbox {
    pub key: String,
    pub interfaces: Vec<Interface>,
    pub gateways: Vec<IpAddr>,
}

impl MemorySandbox {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }
}

impl Sandbox for MemorySandbox {
    fn key(&self) -> &str {
        &self.key
    }

    fn add_interface(&mut self, iface: &Interface) -> Result<()> {
        self.interfaces.push(iface.clone());
        Ok(())
    }

    fn set_gateway(&mut self, gateway: IpAddr) -> Result<()> {
        self.gateways.push(gateway);
        Ok(())
    }
}
