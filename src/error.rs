//! Unified error types for Tether

use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Tether operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Invalid driver options: {0}")]
    InvalidOptions(#[source] serde_json::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid bridge configuration: {0}")]
    InvalidConfiguration(String),

    // Controller errors
    #[error("unknown driver \"{0}\"")]
    UnknownDriver(String),

    #[error("driver \"{0}\" is already registered")]
    DriverAlreadyRegistered(String),

    #[error("unknown network {name} id {id}")]
    UnknownNetwork { name: String, id: String },

    #[error("unknown endpoint {name} id {id}")]
    UnknownEndpoint { name: String, id: String },

    #[error("network {0} has active endpoints")]
    NetworkHasActiveEndpoints(String),

    #[error("network controller is no longer available")]
    ControllerGone,

    // Driver errors
    #[error("network {0} not found")]
    NetworkNotFound(String),

    #[error("network {0} already exists")]
    NetworkExists(String),

    #[error("endpoint {0} not found")]
    EndpointNotFound(String),

    #[error("endpoint {0} already exists")]
    EndpointExists(String),

    #[error("bridge '{0}' is already in use by another network")]
    BridgeInUse(String),

    // Allocator errors
    #[error("no available addresses in {0}")]
    PoolExhausted(String),

    #[error("address {ip} is not in pool {cidr}")]
    AddressNotInPool { ip: IpAddr, cidr: String },

    #[error("address {ip} is already allocated in {cidr}")]
    AddressInUse { ip: IpAddr, cidr: String },

    #[error("pool {0} is already registered")]
    PoolExists(String),

    #[error("subnet {subnet} is not contained in network {network}")]
    SubnetNotContained { subnet: IpNet, network: IpNet },

    #[error("invalid fixed CIDR {subnet} for bridge network {network}: {source}")]
    InvalidFixedCidr {
        subnet: IpNet,
        network: IpNet,
        #[source]
        source: Box<Error>,
    },

    // Link errors
    #[error("no free address range available for bridge '{0}'")]
    NoBridgeAddress(String),

    #[error("Interface '{0}' exists but is not a bridge")]
    LinkNotBridge(String),

    #[error("Interface '{0}' not found")]
    LinkNotFound(String),

    #[error("{op} failed on '{name}': {message}")]
    Link {
        op: String,
        name: String,
        message: String,
    },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Bridge setup failed: {0}")]
    Setup(String),
}

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, Error>;
