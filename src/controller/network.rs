//! Networks managed by a controller

use crate::controller::{ControllerInner, Endpoint, Rollback};
use crate::driver::{Options, SandboxInfo};
use crate::error::{Error, Result};
use crate::ids;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

pub(crate) struct NetworkInner {
    controller: Weak<ControllerInner>,
    pub(super) id: String,
    pub(super) name: String,
    pub(super) network_type: String,
    pub(super) endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl NetworkInner {
    pub(super) fn controller(&self) -> Result<Arc<ControllerInner>> {
        self.controller.upgrade().ok_or(Error::ControllerGone)
    }

    pub(super) fn lock_endpoints(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn unknown(&self) -> Error {
        Error::UnknownNetwork {
            name: self.name.clone(),
            id: self.id.clone(),
        }
    }
}

/// A named connectivity domain backed by one driver
///
/// Handles are cheap to clone and all refer to the same network.
#[derive(Clone)]
pub struct Network {
    pub(super) inner: Arc<NetworkInner>,
}

impl Network {
    pub(super) fn new(
        controller: &Arc<ControllerInner>,
        id: String,
        name: &str,
        network_type: &str,
    ) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                controller: Arc::downgrade(controller),
                id,
                name: name.to_string(),
                network_type: network_type.to_string(),
                endpoints: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Type of the driver backing this network
    pub fn network_type(&self) -> &str {
        &self.inner.network_type
    }

    /// Create an endpoint attached to `sandbox_key`
    ///
    /// The driver provisions the endpoint before it is registered. If the
    /// network was deleted meanwhile, the driver endpoint is torn down again
    /// and `UnknownNetwork` is returned.
    pub fn create_endpoint(
        &self,
        name: &str,
        sandbox_key: &str,
        options: &Options,
    ) -> Result<(Endpoint, SandboxInfo)> {
        let controller = self.inner.controller()?;
        let driver = controller.driver(self.network_type())?;
        let id = ids::generate_id();

        let info = driver.create_endpoint(self.id(), &id, sandbox_key, options)?;
        let endpoint = Endpoint::new(self, id, name, sandbox_key, info.clone());

        let registered = {
            let networks = controller.networks();
            let live = networks
                .get(self.id())
                .is_some_and(|n| Arc::ptr_eq(&n.inner, &self.inner));
            if live {
                self.inner
                    .lock_endpoints()
                    .insert(endpoint.id().to_string(), endpoint.clone());
            }
            live
        };

        if !registered {
            debug!(
                network = %ids::short_id(self.id()),
                endpoint = %ids::short_id(endpoint.id()),
                "network deleted while endpoint was created"
            );
            if let Err(e) = driver.delete_endpoint(self.id(), endpoint.id()) {
                warn!(endpoint = %ids::short_id(endpoint.id()), error = %e, "endpoint teardown failed");
            }
            return Err(self.inner.unknown());
        }

        info!(
            network = %ids::short_id(self.id()),
            endpoint = %ids::short_id(endpoint.id()),
            name = %name,
            "endpoint created"
        );
        Ok((endpoint, info))
    }

    /// Delete the network
    ///
    /// Fails with `NetworkHasActiveEndpoints` while endpoints remain. If the
    /// driver teardown fails the network is registered again, unchanged.
    pub fn delete(&self) -> Result<()> {
        let controller = self.inner.controller()?;
        let driver = controller.driver(self.network_type())?;

        let rollback = {
            let mut networks = controller.networks();
            let Some(registered) = networks.get(self.id()).cloned() else {
                return Err(self.inner.unknown());
            };
            if !registered.inner.lock_endpoints().is_empty() {
                return Err(Error::NetworkHasActiveEndpoints(self.id().to_string()));
            }
            networks.remove(self.id());
            Rollback::new(&controller.networks, self.id(), registered)
        };

        driver.delete_network(self.id())?;
        rollback.disarm();

        info!(network = %ids::short_id(self.id()), name = %self.name(), "network deleted");
        Ok(())
    }

    /// Endpoints currently attached
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.lock_endpoints().values().cloned().collect()
    }

    /// Look up an attached endpoint by id
    pub fn endpoint(&self, id: &str) -> Option<Endpoint> {
        self.inner.lock_endpoints().get(id).cloned()
    }
}

impl PartialEq for Network {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Network {}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("network_type", &self.inner.network_type)
            .finish()
    }
}
