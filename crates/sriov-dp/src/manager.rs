//! The `ResourceManager` turns the resource configuration into running device plugin servers.
//!
//! Startup goes through fixed phases: the configuration is read and validated as a whole, the
//! host is enumerated once and every device provider keeps its candidates, then each resource
//! runs its selector objects over the candidates of its device type. A device selected by an
//! earlier resource of the file is never handed to a later one. Finally one
//! [`ResourceServer`] per non-empty pool is started.
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cdi;
use crate::config::Config;
use crate::device_provider::{DeviceProvider, ProviderError};
use crate::devices::HostDevice;
use crate::factory::ResourceFactory;
use crate::host::Host;
use crate::resource_config::{ConfigError, DeviceType, ResourceConfig, ResourceConfigList};
use crate::resources::util;
use crate::resources::ResourceServer;

/// Orchestrates discovery and the lifecycle of every resource server.
pub struct ResourceManager {
    factory: ResourceFactory,
    providers: Vec<Box<dyn DeviceProvider>>,
    configs: Vec<ResourceConfig>,
    servers: Vec<Arc<ResourceServer>>,
    watchers: Vec<JoinHandle<()>>,
}

impl ResourceManager {
    /// Returns a manager discovering devices on `host`.
    pub fn new(host: Arc<dyn Host>, config: Config) -> Self {
        let factory = ResourceFactory::new(host, &config);
        let providers = factory.device_providers();
        ResourceManager {
            factory,
            providers,
            configs: Vec::new(),
            servers: Vec::new(),
            watchers: Vec::new(),
        }
    }

    fn config(&self) -> &Config {
        self.factory.config()
    }

    /// The configured resources, once read.
    pub fn resource_configs(&self) -> &[ResourceConfig] {
        &self.configs
    }

    /// The servers built by [`ResourceManager::init_servers`].
    pub fn servers(&self) -> &[Arc<ResourceServer>] {
        &self.servers
    }

    /// Runs every startup phase and starts the servers. Configuration errors are fatal, a server
    /// failing to start is not.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.read_config().await?;
        self.valid_configs()?;
        self.discover_host_devices()?;
        if self.config().use_cdi {
            cdi::cleanup(&self.config().cdi_spec_dir)
                .await
                .context("unable to remove stale CDI specs")?;
        }
        self.init_servers();
        self.start_all_servers().await;
        Ok(())
    }

    /// Reads the resource configuration file.
    pub async fn read_config(&mut self) -> anyhow::Result<()> {
        let path = &self.config().config_file;
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("unable to read config file {:?}", path))?;
        let list = ResourceConfigList::from_json(&data)
            .with_context(|| format!("unable to parse config file {:?}", path))?;
        if list.resource_list.is_empty() {
            return Err(ConfigError::Empty.into());
        }
        info!(resources = list.resource_list.len(), "Read resource configuration");
        for rc in &list.resource_list {
            debug!(resource = %rc.resource_name, device_type = %rc.device_type.as_str(), "Configured resource");
        }
        self.configs = list.resource_list;
        Ok(())
    }

    /// Checks every configured resource before any of them is served.
    pub fn valid_configs(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for rc in &self.configs {
            if !util::is_valid_resource_name(&rc.resource_name) {
                return Err(ConfigError::InvalidName(rc.resource_name.clone()));
            }
            let full_name = format!("{}/{}", self.factory.resource_prefix(rc), rc.resource_name);
            if !util::is_extended_resource_name(&full_name) {
                return Err(ConfigError::InvalidName(full_name));
            }
            if !names.insert(full_name.clone()) {
                return Err(ConfigError::Duplicate(full_name));
            }
            match self.provider(rc.device_type) {
                Some(provider) => provider.valid_config(rc)?,
                None => {
                    return Err(ProviderError::invalid(rc, "no provider for the device type").into())
                }
            }
        }
        Ok(())
    }

    /// Enumerates the host PCI functions and hands them to every provider.
    pub fn discover_host_devices(&mut self) -> anyhow::Result<()> {
        let devices = self
            .factory
            .host()
            .pci_devices()
            .context("unable to enumerate PCI devices")?;
        debug!(devices = devices.len(), "Enumerated PCI devices");
        for provider in self.providers.iter_mut() {
            let class_code = provider.class_code();
            provider.add_target_devices(&devices, class_code);
            info!(
                device_type = %provider.device_type().as_str(),
                candidates = provider.discovered_devices().len(),
                "Discovered devices"
            );
        }
        Ok(())
    }

    /// Builds the pool and server of every resource selecting at least one device.
    pub fn init_servers(&mut self) {
        let mut allocated = HashSet::new();
        let mut servers = Vec::new();
        for rc in &self.configs {
            let provider = match self.provider(rc.device_type) {
                Some(provider) => provider,
                None => {
                    error!(resource = %rc.resource_name, "No provider for the device type, skipping");
                    continue;
                }
            };
            let mut devices = Vec::new();
            for index in 0..rc.selectors.len() {
                let candidates = provider.get_devices(rc, index);
                match provider.get_filtered_devices(candidates, rc, index) {
                    Ok(filtered) => devices.extend(filtered),
                    Err(e) => {
                        error!(resource = %rc.resource_name, error = %e, "Unable to filter devices");
                    }
                }
            }
            let devices = exclude_allocated_devices(devices, &mut allocated, &rc.resource_name);
            if devices.is_empty() {
                info!(resource = %rc.resource_name, "No devices in resource pool, skipping");
                continue;
            }
            let pool = Arc::new(self.factory.resource_pool(rc, devices));
            info!(resource = %pool.full_name(), devices = pool.device_pool().len(), "Built resource pool");
            servers.push(Arc::new(self.factory.resource_server(pool)));
        }
        self.servers = servers;
    }

    /// Starts every server. A server failing to start is logged and skipped. In the legacy
    /// registration mode a socket watcher is spawned for every started server.
    pub async fn start_all_servers(&mut self) {
        for server in &self.servers {
            let resource = server.pool().full_name();
            if let Err(e) = server.start().await {
                error!(%resource, error = %e, "Unable to start resource server, skipping");
                continue;
            }
            if !server.plugin_watch_mode() {
                self.watchers.push(tokio::spawn(server.clone().watch()));
            }
        }
    }

    /// Stops every server and waits for the socket watchers to exit.
    pub async fn stop_all_servers(&mut self) {
        for server in &self.servers {
            server.stop().await;
        }
        for watcher in self.watchers.drain(..) {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Socket watcher failed");
            }
        }
        info!("All resource servers stopped");
    }

    fn provider(&self, device_type: DeviceType) -> Option<&dyn DeviceProvider> {
        self.providers
            .iter()
            .find(|p| p.device_type() == device_type)
            .map(|p| p.as_ref())
    }
}

/// Drops the devices already taken by an earlier resource and records the remaining ones.
fn exclude_allocated_devices(
    devices: Vec<HostDevice>,
    allocated: &mut HashSet<String>,
    resource: &str,
) -> Vec<HostDevice> {
    let devices = devices
        .into_iter()
        .filter(|d| {
            let taken = allocated.contains(d.id());
            if taken {
                warn!(device = %d.id(), %resource, "Device already belongs to another resource, excluding it");
            }
            !taken
        })
        .collect::<Vec<_>>();
    allocated.extend(devices.iter().map(|d| d.id().to_owned()));
    devices
}
