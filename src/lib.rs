//! Tether - container network management core
//!
//! A controller managing named networks and the endpoints attached to them,
//! with pluggable drivers. The bridge driver backs each network with a
//! bridge device and hands out endpoint addresses from an IP allocator.

pub mod controller;
pub mod driver;
pub mod error;
pub mod ids;
pub mod ipam;
pub mod link;
pub mod manifest;
pub mod sandbox;

pub use controller::{Controller, Endpoint, Network};
pub use driver::{Driver, DriverRegistry, Interface, Options, SandboxInfo};
pub use error::{Error, Result};
