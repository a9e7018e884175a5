//! Network controller
//!
//! The controller owns the registry of active networks and the drivers
//! backing them; it is the entry point for client code. Registry locks are
//! held only for map operations, never across a driver call. Deletions
//! remove the entry first and put it back if the driver teardown fails.

pub mod endpoint;
pub mod network;

pub use endpoint::Endpoint;
pub use network::Network;

use crate::driver::{Driver, DriverRegistry, Options, enumerate_drivers};
use crate::error::Result;
use crate::ids;
use crate::link::LinkOps;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

pub(crate) struct ControllerInner {
    networks: Mutex<HashMap<String, Network>>,
    drivers: DriverRegistry,
}

impl ControllerInner {
    pub(crate) fn networks(&self) -> MutexGuard<'_, HashMap<String, Network>> {
        self.networks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn driver(&self, network_type: &str) -> Result<Arc<dyn Driver>> {
        self.drivers.get(network_type)
    }
}

/// Entry point managing networks
///
/// Cloning yields another handle to the same controller. Independent
/// controllers share no state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Create a controller with the built-in drivers on top of `links`
    pub fn new(links: Arc<dyn LinkOps>) -> Self {
        Self::with_drivers(enumerate_drivers(links))
    }

    /// Create a controller with a custom driver set
    pub fn with_drivers(drivers: DriverRegistry) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                networks: Mutex::new(HashMap::new()),
                drivers,
            }),
        }
    }

    /// Create a network of `network_type`
    ///
    /// The network is registered only once its driver has provisioned it.
    /// Driver options are opaque here and decoded by the driver.
    pub fn new_network(&self, network_type: &str, name: &str, options: &Options) -> Result<Network> {
        let network = Network::new(&self.inner, ids::generate_id(), name, network_type);
        let driver = self.inner.driver(network_type)?;

        driver.create_network(network.id(), options)?;

        self.inner
            .networks()
            .insert(network.id().to_string(), network.clone());
        info!(
            network = %ids::short_id(network.id()),
            name = %name,
            driver = %network_type,
            "network created"
        );
        Ok(network)
    }

    /// Look up an active network by id
    pub fn network(&self, id: &str) -> Option<Network> {
        self.inner.networks().get(id).cloned()
    }

    /// Look up an active network by name (the first one if several match)
    pub fn network_by_name(&self, name: &str) -> Option<Network> {
        self.inner
            .networks()
            .values()
            .find(|n| n.name() == name)
            .cloned()
    }

    /// All active networks
    pub fn networks(&self) -> Vec<Network> {
        self.inner.networks().values().cloned().collect()
    }

    /// Registered network types
    pub fn drivers(&self) -> Vec<String> {
        self.inner
            .drivers
            .names()
            .into_iter()
            .map(String::from)
            .collect()
    }
}

/// Puts a speculatively removed registry entry back unless disarmed
///
/// Armed when an entry is taken out of a registry ahead of a driver
/// teardown; dropping it without `disarm` re-inserts the entry as it was.
pub(crate) struct Rollback<'a, V> {
    registry: &'a Mutex<HashMap<String, V>>,
    key: String,
    entry: Option<V>,
}

impl<'a, V> Rollback<'a, V> {
    pub(crate) fn new(registry: &'a Mutex<HashMap<String, V>>, key: &str, entry: V) -> Self {
        Self {
            registry,
            key: key.to_string(),
            entry: Some(entry),
        }
    }

    /// Keep the entry removed
    pub(crate) fn disarm(mut self) {
        self.entry = None;
    }
}

impl<V> Drop for Rollback<'_, V> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            warn!(id = %ids::short_id(&self.key), "teardown failed, restoring registry entry");
            self.registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(self.key.clone(), entry);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{NETWORK_TYPE, controller};
    use super::*;
    use crate::error::Error;
    use crate::link::MemoryLinks;
    use serde_json::json;

    #[test]
    fn test_new_network() {
        let (driver, ctrl) = controller();
        let network = ctrl
            .new_network(NETWORK_TYPE, "network1", &Options::empty())
            .unwrap();

        assert_eq!(network.name(), "network1");
        assert_eq!(network.network_type(), NETWORK_TYPE);
        assert_eq!(network.id().len(), 64);
        assert_eq!(ctrl.network(network.id()), Some(network.clone()));
        assert_eq!(*driver.networks.lock().unwrap(), vec![network.id().to_string()]);
    }

    #[test]
    fn test_new_network_unknown_driver() {
        let (_driver, ctrl) = controller();
        let err = ctrl
            .new_network("overlay", "network1", &Options::empty())
            .unwrap_err();

        assert!(matches!(err, Error::UnknownDriver(ref name) if name == "overlay"));
        assert!(ctrl.networks().is_empty());
    }

    #[test]
    fn test_new_network_driver_failure() {
        let (driver, ctrl) = controller();
        testing::ScriptedDriver::fail(&driver.fail_create_network, true);

        assert!(ctrl
            .new_network(NETWORK_TYPE, "network1", &Options::empty())
            .is_err());
        assert!(ctrl.networks().is_empty());
    }

    #[test]
    fn test_network_ids_unique() {
        let (_driver, ctrl) = controller();
        let a = ctrl.new_network(NETWORK_TYPE, "same", &Options::empty()).unwrap();
        let b = ctrl.new_network(NETWORK_TYPE, "same", &Options::empty()).unwrap();

        // Names need not be unique, ids are
        assert_ne!(a.id(), b.id());
        assert_eq!(ctrl.networks().len(), 2);
        assert!(ctrl.network_by_name("same").is_some());
        assert!(ctrl.network_by_name("other").is_none());
    }

    #[test]
    fn test_registry_keyed_by_own_id() {
        let (_driver, ctrl) = controller();
        for i in 0..4 {
            ctrl.new_network(NETWORK_TYPE, &format!("n{}", i), &Options::empty())
                .unwrap();
        }

        for (id, network) in ctrl.inner.networks().iter() {
            assert_eq!(id, network.id());
        }
    }

    #[test]
    fn test_controllers_are_independent() {
        let (_d1, first) = controller();
        let (_d2, second) = controller();

        let network = first
            .new_network(NETWORK_TYPE, "network1", &Options::empty())
            .unwrap();
        assert!(second.network(network.id()).is_none());
    }

    #[test]
    fn test_builtin_drivers() {
        let ctrl = Controller::new(Arc::new(MemoryLinks::new()));
        assert_eq!(ctrl.drivers(), vec!["bridge".to_string(), "null".to_string()]);
    }

    #[test]
    fn test_bridge_network_fixed_cidr() {
        let links = Arc::new(MemoryLinks::new());
        let ctrl = Controller::new(links.clone());

        let options = Options::new(json!({
            "address_ipv4": "192.168.1.1/16",
            "fixed_cidr": "192.168.2.0/24"
        }));
        let network = ctrl.new_network("bridge", "network1", &options).unwrap();

        let (endpoint, info) = network
            .create_endpoint("Endpoint1", "/var/run/netns/c1", &Options::empty())
            .unwrap();
        let address = info.interfaces[0].address.unwrap();
        assert_eq!(address.addr().to_string(), "192.168.2.1");
        assert_eq!(info.gateway.unwrap().to_string(), "192.168.1.1");

        endpoint.delete().unwrap();
        network.delete().unwrap();
        assert!(links.link_names().is_empty());
    }

    #[test]
    fn test_bridge_network_bad_fixed_cidr() {
        let ctrl = Controller::new(Arc::new(MemoryLinks::new()));

        let options = Options::new(json!({
            "address_ipv4": "192.168.1.1/24",
            "fixed_cidr": "192.168.2.0/24"
        }));
        let err = ctrl
            .new_network("bridge", "network1", &options)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidFixedCidr { .. }));
        assert!(ctrl.networks().is_empty());
    }

    #[test]
    fn test_rollback_restores_entry() {
        let registry: Mutex<HashMap<String, u32>> = Mutex::new(HashMap::new());

        let removed = Rollback::new(&registry, "a", 1);
        drop(removed);
        assert_eq!(registry.lock().unwrap().get("a"), Some(&1));

        registry.lock().unwrap().remove("a");
        Rollback::new(&registry, "a", 1).disarm();
        assert!(registry.lock().unwrap().is_empty());
    }
}
