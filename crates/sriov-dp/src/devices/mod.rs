//! Typed host devices: the units a resource pool is made of.
//!
//! Every device is a [`DeviceBase`] carrying what all kinds share, plus a [`DeviceKind`] facet
//! with the kind specific attributes. Devices are built once per discovery pass, only their health
//! changes afterwards.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::device_plugin_api::v1beta1::{Device, DeviceSpec, Mount, NumaNode, TopologyInfo};
use crate::host::{Host, HostError, PciDevice, VdpaDevice};
use crate::info_provider::{default_providers, AdditionalInfo, DeviceInfoProvider, ExtraInfoProvider};
use crate::resource_config::ResourceConfig;

mod accelerator;
mod aux_net;
mod net;

pub use aux_net::AuxNetAttributes;
pub use net::NetAttributes;

/// Errors making a device unusable. The device is dropped from discovery.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The bound driver could not be resolved
    #[error("unable to get driver of device {id}: {source}")]
    Driver {
        /// ID of the device
        id: String,
        /// The host error
        source: HostError,
    },
    /// An auxiliary device name that does not follow `<driver>.<type>.<n>`
    #[error("malformed auxiliary device name {0}")]
    AuxName(String),
}

/// Health reported to the kubelet for a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    /// The device can be allocated
    Healthy,
    /// The device should not be allocated
    Unhealthy,
}

impl Health {
    /// The value used in the device plugin API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What every kind of device shares.
#[derive(Debug)]
pub struct DeviceBase {
    id: String,
    pci_addr: String,
    vendor: String,
    device_code: String,
    driver: String,
    numa_node: Option<i64>,
    healthy: AtomicBool,
    providers: Vec<Box<dyn DeviceInfoProvider>>,
}

impl DeviceBase {
    /// Resolves the common attributes of the device `id` backed by the PCI function `pci`.
    ///
    /// When `providers` is empty the providers are chosen after the bound driver. The
    /// `additionalInfo` configured for the device is always appended as an extra provider.
    pub fn new(
        host: &dyn Host,
        id: &str,
        pci: &PciDevice,
        rc: &ResourceConfig,
        providers: Vec<Box<dyn DeviceInfoProvider>>,
    ) -> Result<Self, DeviceError> {
        let driver = resolve_driver(host, id)?;
        Ok(DeviceBase::with_driver(host, id, pci, rc, driver, providers))
    }

    /// Like [`DeviceBase::new`] for a caller that already looked up the bound driver.
    pub fn with_driver(
        host: &dyn Host,
        id: &str,
        pci: &PciDevice,
        rc: &ResourceConfig,
        driver: String,
        mut providers: Vec<Box<dyn DeviceInfoProvider>>,
    ) -> Self {
        if providers.is_empty() {
            providers = default_providers(host, &driver, &pci.address);
        }
        if let Some(info) = rc.additional_info_for(id) {
            providers.push(Box::new(ExtraInfoProvider::new(info.clone())));
        }

        let numa_node = if rc.exclude_topology {
            None
        } else {
            // -1 means the platform does not know, which is not node 0
            host.numa_node(&pci.address).filter(|node| *node >= 0)
        };

        DeviceBase {
            id: id.to_owned(),
            pci_addr: pci.address.clone(),
            vendor: pci.vendor.clone(),
            device_code: pci.device.clone(),
            driver,
            numa_node,
            healthy: AtomicBool::new(true),
            providers,
        }
    }
}

/// The driver bound to `id`. A device without one cannot be handed out.
pub(crate) fn resolve_driver(host: &dyn Host, id: &str) -> Result<String, DeviceError> {
    host.driver_name(id).map_err(|source| DeviceError::Driver {
        id: id.to_owned(),
        source,
    })
}

/// The kind specific facet of a device.
#[derive(Debug)]
pub enum DeviceKind {
    /// A network PCI function
    Net(NetAttributes),
    /// An accelerator PCI function
    Accelerator,
    /// An auxiliary network device
    AuxNet(AuxNetAttributes),
}

/// A device that can be handed to a container.
#[derive(Debug)]
pub struct HostDevice {
    base: DeviceBase,
    kind: DeviceKind,
}

impl HostDevice {
    /// Stable ID: the PCI address, or the auxiliary device name.
    pub fn id(&self) -> &str {
        &self.base.id
    }

    /// PCI address of the function backing the device. For auxiliary devices this is the parent.
    pub fn pci_addr(&self) -> &str {
        &self.base.pci_addr
    }

    /// PCI vendor ID.
    pub fn vendor(&self) -> &str {
        &self.base.vendor
    }

    /// PCI device ID.
    pub fn device_code(&self) -> &str {
        &self.base.device_code
    }

    /// The driver bound when the device was discovered.
    pub fn driver(&self) -> &str {
        &self.base.driver
    }

    /// NUMA node reported to the kubelet, `None` when unknown or excluded.
    pub fn numa_node(&self) -> Option<i64> {
        self.base.numa_node
    }

    /// The kind specific facet.
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Network attributes, for net and auxiliary net devices.
    pub fn net(&self) -> Option<&NetAttributes> {
        match &self.kind {
            DeviceKind::Net(net) => Some(net),
            DeviceKind::Accelerator => None,
            DeviceKind::AuxNet(aux) => Some(&aux.net),
        }
    }

    /// The auxiliary device type, e.g. `sf`.
    pub fn aux_type(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::AuxNet(aux) => Some(&aux.aux_type),
            _ => None,
        }
    }

    /// True when the device created an RDMA device.
    pub fn is_rdma(&self) -> bool {
        self.net().map(|net| net.rdma.is_rdma()).unwrap_or(false)
    }

    /// The vDPA device on top of the function.
    pub fn vdpa_device(&self) -> Option<&VdpaDevice> {
        match &self.kind {
            DeviceKind::Net(net) => net.vdpa.as_ref(),
            _ => None,
        }
    }

    /// Current health.
    pub fn health(&self) -> Health {
        if self.base.healthy.load(Ordering::Acquire) {
            Health::Healthy
        } else {
            Health::Unhealthy
        }
    }

    /// Records the health of the device and returns true when it changed.
    pub fn set_health(&self, health: Health) -> bool {
        let healthy = health == Health::Healthy;
        let changed = self.base.healthy.swap(healthy, Ordering::AcqRel) != healthy;
        if changed {
            debug!(device = %self.id(), %health, "Device health changed");
        }
        changed
    }

    /// Re-evaluates the health of the device: the driver must still be bound and the PF link of a
    /// network device must not be down. Returns true when the health changed.
    pub fn probe(&self, host: &dyn Host) -> bool {
        let mut healthy = host.driver_name(self.id()).is_ok();
        if healthy {
            if let Some(pf_name) = self.net().and_then(|net| net.pf_name.as_deref()) {
                healthy = host.oper_state(pf_name).as_deref() != Some("down");
            }
        }
        self.set_health(if healthy {
            Health::Healthy
        } else {
            Health::Unhealthy
        })
    }

    /// The record advertised to the kubelet.
    pub fn api_device(&self) -> Device {
        Device {
            id: self.id().to_owned(),
            health: self.health().as_str().to_owned(),
            topology: self.numa_node().map(|id| TopologyInfo {
                nodes: vec![NumaNode { id }],
            }),
        }
    }

    /// Device nodes of all providers.
    pub fn device_specs(&self) -> Vec<DeviceSpec> {
        self.base
            .providers
            .iter()
            .flat_map(|p| p.device_specs())
            .collect()
    }

    /// Environment info of all providers, keyed by provider name.
    pub fn env_val(&self) -> BTreeMap<String, AdditionalInfo> {
        self.base
            .providers
            .iter()
            .map(|p| (p.name().to_owned(), p.env_val()))
            .filter(|(_, env)| !env.is_empty())
            .collect()
    }

    /// Mounts of all providers.
    pub fn mounts(&self) -> Vec<Mount> {
        self.base
            .providers
            .iter()
            .flat_map(|p| p.mounts())
            .collect()
    }
}
