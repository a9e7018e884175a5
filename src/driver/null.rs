//! Null driver
//!
//! Networks of this type carry no connectivity. Every hook succeeds and
//! endpoints receive an empty `SandboxInfo`.

use crate::driver::{Driver, Options, SandboxInfo};
use crate::error::Result;
use tracing::debug;

/// Network type served by the null driver
pub const NETWORK_TYPE: &str = "null";

#[derive(Debug, Default, Clone, Copy)]
pub struct NullDriver;

impl Driver for NullDriver {
    fn network_type(&self) -> &'static str {
        NETWORK_TYPE
    }

    fn create_network(&self, id: &str, _options: &Options) -> Result<()> {
        debug!(network = %id, "null network created");
        Ok(())
    }

    fn delete_network(&self, id: &str) -> Result<()> {
        debug!(network = %id, "null network deleted");
        Ok(())
    }

    fn create_endpoint(
        &self,
        _network_id: &str,
        _endpoint_id: &str,
        _sandbox_key: &str,
        _options: &Options,
    ) -> Result<SandboxInfo> {
        Ok(SandboxInfo::default())
    }

    fn delete_endpoint(&self, _network_id: &str, _endpoint_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_endpoint_has_no_interfaces() {
        let driver = NullDriver;
        driver.create_network("n1", &Options::empty()).unwrap();

        let info = driver
            .create_endpoint("n1", "e1", "/var/run/netns/e1", &Options::empty())
            .unwrap();
        assert!(info.interfaces.is_empty());
        assert!(info.gateway.is_none());

        driver.delete_endpoint("n1", "e1").unwrap();
        driver.delete_network("n1").unwrap();
    }
}
