//! Endpoints attaching sandboxes to networks

use crate::controller::Rollback;
use crate::controller::network::{Network, NetworkInner};
use crate::driver::SandboxInfo;
use crate::error::{Error, Result};
use crate::ids;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::info;

struct EndpointInner {
    id: String,
    name: String,
    sandbox_key: String,
    sandbox_info: SandboxInfo,
    network_id: String,
    network: Weak<NetworkInner>,
}

/// Attachment point of a sandbox onto a network
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(super) fn new(
        network: &Network,
        id: String,
        name: &str,
        sandbox_key: &str,
        sandbox_info: SandboxInfo,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                id,
                name: name.to_string(),
                sandbox_key: sandbox_key.to_string(),
                sandbox_info,
                network_id: network.id().to_string(),
                network: Arc::downgrade(&network.inner),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn sandbox_key(&self) -> &str {
        &self.inner.sandbox_key
    }

    /// Connectivity returned by the driver when the endpoint was created
    pub fn sandbox_info(&self) -> &SandboxInfo {
        &self.inner.sandbox_info
    }

    pub fn network_id(&self) -> &str {
        &self.inner.network_id
    }

    fn unknown(&self) -> Error {
        Error::UnknownEndpoint {
            name: self.inner.name.clone(),
            id: self.inner.id.clone(),
        }
    }

    /// Delete the endpoint
    ///
    /// If the driver teardown fails the endpoint is attached again, unchanged.
    pub fn delete(&self) -> Result<()> {
        let network = self.inner.network.upgrade().ok_or_else(|| self.unknown())?;
        let controller = network.controller()?;
        let driver = controller.driver(&network.network_type)?;

        let rollback = {
            let mut endpoints = network.lock_endpoints();
            let Some(registered) = endpoints.remove(self.id()) else {
                return Err(self.unknown());
            };
            Rollback::new(&network.endpoints, self.id(), registered)
        };

        driver.delete_endpoint(&network.id, self.id())?;
        rollback.disarm();

        info!(
            network = %ids::short_id(&network.id),
            endpoint = %ids::short_id(self.id()),
            name = %self.name(),
            "endpoint deleted"
        );
        Ok(())
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Endpoint {}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("sandbox_key", &self.inner.sandbox_key)
            .field("network_id", &self.inner.network_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::controller::testing::{NETWORK_TYPE, ScriptedDriver, controller};
    use crate::driver::Options;
    use crate::error::Error;

    #[test]
    fn test_delete_endpoint() {
        let (driver, ctrl) = controller();
        let network = ctrl
            .new_network(NETWORK_TYPE, "network1", &Options::empty())
            .unwrap();
        let (endpoint, _) = network
            .create_endpoint("ep1", "sandbox1", &Options::empty())
            .unwrap();

        endpoint.delete().unwrap();
        assert!(network.endpoint(endpoint.id()).is_none());
        assert_eq!(driver.live_endpoints(), 0);

        network.delete().unwrap();
    }

    #[test]
    fn test_delete_endpoint_twice() {
        let (_driver, ctrl) = controller();
        let network = ctrl
            .new_network(NETWORK_TYPE, "network1", &Options::empty())
            .unwrap();
        let (endpoint, _) = network
            .create_endpoint("ep1", "sandbox1", &Options::empty())
            .unwrap();

        endpoint.delete().unwrap();
        let err = endpoint.delete().unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownEndpoint { ref name, ref id } if name == "ep1" && id == endpoint.id()
        ));
    }

    #[test]
    fn test_delete_endpoint_failure_restores() {
        let (driver, ctrl) = controller();
        let network = ctrl
            .new_network(NETWORK_TYPE, "network1", &Options::empty())
            .unwrap();
        let (endpoint, info) = network
            .create_endpoint("ep1", "sandbox1", &Options::empty())
            .unwrap();
        ScriptedDriver::fail(&driver.fail_delete_endpoint, true);

        assert!(endpoint.delete().is_err());

        let restored = network.endpoint(endpoint.id()).unwrap();
        assert_eq!(restored, endpoint);
        assert_eq!(restored.name(), "ep1");
        assert_eq!(restored.sandbox_key(), "sandbox1");
        assert_eq!(restored.sandbox_info(), &info);
        assert_eq!(network.endpoints().len(), 1);
        assert!(matches!(
            network.delete(),
            Err(Error::NetworkHasActiveEndpoints(_))
        ));

        ScriptedDriver::fail(&driver.fail_delete_endpoint, false);
        endpoint.delete().unwrap();
        network.delete().unwrap();
    }

    #[test]
    fn test_endpoints_independent() {
        let (_driver, ctrl) = controller();
        let network = ctrl
            .new_network(NETWORK_TYPE, "network1", &Options::empty())
            .unwrap();
        let (first, _) = network
            .create_endpoint("ep1", "sandbox1", &Options::empty())
            .unwrap();
        let (second, _) = network
            .create_endpoint("ep2", "sandbox2", &Options::empty())
            .unwrap();

        first.delete().unwrap();
        assert_eq!(network.endpoints(), vec![second.clone()]);
    }
}
