//! Construction of the per-resource pieces from the process configuration.
//!
//! A [`ResourceFactory`] is built once at startup and handed to the manager. It holds the host
//! every device is discovered on and the process [`Config`], so two managers in one process (as
//! in tests) never share construction state.
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::device_provider::{self, DeviceProvider};
use crate::devices::HostDevice;
use crate::host::Host;
use crate::resource_config::ResourceConfig;
use crate::resources::{allocator, ResourcePool, ResourceServer};

/// Builds device providers, resource pools and resource servers.
#[derive(Clone)]
pub struct ResourceFactory {
    host: Arc<dyn Host>,
    config: Config,
}

impl ResourceFactory {
    /// Returns a factory building everything on top of `host`.
    pub fn new(host: Arc<dyn Host>, config: &Config) -> Self {
        ResourceFactory {
            host,
            config: config.clone(),
        }
    }

    /// The host devices are discovered on.
    pub fn host(&self) -> Arc<dyn Host> {
        self.host.clone()
    }

    /// The process configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The prefix of a resource: its own `resourcePrefix` when set, the process wide prefix
    /// otherwise.
    pub fn resource_prefix<'a>(&'a self, rc: &'a ResourceConfig) -> &'a str {
        match rc.resource_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => &self.config.resource_prefix,
        }
    }

    /// One device provider per supported device type.
    pub fn device_providers(&self) -> Vec<Box<dyn DeviceProvider>> {
        device_provider::providers(self.host.clone())
    }

    /// Builds the pool of a resource out of its selected devices.
    pub fn resource_pool(&self, rc: &ResourceConfig, devices: Vec<HostDevice>) -> ResourcePool {
        let allocator = allocator::for_policy(&rc.allocate_policy);
        let prefix = self.resource_prefix(rc).to_owned();
        debug!(resource = %rc.resource_name, %prefix, devices = devices.len(), "Building resource pool");
        ResourcePool::new(self.host.clone(), rc.clone(), &prefix, devices, allocator)
    }

    /// Builds the server advertising `pool`.
    pub fn resource_server(&self, pool: Arc<ResourcePool>) -> ResourceServer {
        ResourceServer::new(pool, &self.config)
    }
}
