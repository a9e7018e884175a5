//! Configuration file parsing for Tether
//!
//! Parses `tether.toml` manifests declaring networks and the endpoints to
//! attach to them.

use crate::driver::{BUILTIN_DRIVERS, Options};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Load and validate a manifest from a file
pub fn load(path: &Path) -> Result<TetherConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse(&content)
}

/// Parse and validate manifest text
pub fn parse(content: &str) -> Result<TetherConfig> {
    let config: TetherConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    /// Network definitions, created in order
    #[serde(default)]
    pub networks: Vec<NetworkDef>,
}

impl TetherConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for network in &self.networks {
            if network.name.is_empty() {
                return Err(Error::ConfigValidation("Network name cannot be empty".into()));
            }
            if !names.insert(&network.name) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate network name: {}",
                    network.name
                )));
            }
            if !BUILTIN_DRIVERS.contains(&network.driver.as_str()) {
                return Err(Error::UnknownDriver(network.driver.clone()));
            }
            network.validate_endpoints()?;
        }
        Ok(())
    }

    /// Number of endpoints across all networks
    pub fn endpoint_count(&self) -> usize {
        self.networks.iter().map(|n| n.endpoints.len()).sum()
    }
}

/// A network to create
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDef {
    pub name: String,

    /// Driver type (network type)
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Driver options, passed through to the driver
    #[serde(default)]
    pub options: toml::Table,

    #[serde(default)]
    pub endpoints: Vec<EndpointDef>,
}

fn default_driver() -> String {
    crate::driver::bridge::NETWORK_TYPE.to_string()
}

impl NetworkDef {
    fn validate_endpoints(&self) -> Result<()> {
        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Endpoint name cannot be empty in network '{}'",
                    self.name
                )));
            }
            if !names.insert(&endpoint.name) {
                return Err(Error::ConfigValidation(format!(
                    "Duplicate endpoint name '{}' in network '{}'",
                    endpoint.name, self.name
                )));
            }
            if endpoint.sandbox.is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "Endpoint '{}' has no sandbox key",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }

    /// Driver options as a generic value
    pub fn driver_options(&self) -> Result<Options> {
        Options::from_serialize(&self.options)
    }
}

/// An endpoint to attach to its network
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDef {
    pub name: String,

    /// Sandbox key (e.g. a network namespace path)
    pub sandbox: String,

    #[serde(default)]
    pub options: toml::Table,
}

impl EndpointDef {
    pub fn driver_options(&self) -> Result<Options> {
        Options::from_serialize(&self.options)
    }
}
