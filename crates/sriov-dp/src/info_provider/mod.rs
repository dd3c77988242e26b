//! Per-driver strategies describing what a container needs to use a device: device nodes, mounts
//! and environment info.
//!
//! Providers are resolved once when a device is discovered and are read-only afterwards.
use std::collections::BTreeMap;
use std::fmt;

use crate::device_plugin_api::v1beta1::{DeviceSpec, Mount};
use crate::host::Host;

mod extra;
mod generic;
mod rdma;
mod uio;
mod vdpa;
mod vfio;
mod vhost_net;

pub use extra::ExtraInfoProvider;
pub use generic::GenericInfoProvider;
pub use rdma::{RdmaInfoProvider, RdmaSpec};
pub use uio::UioInfoProvider;
pub use vdpa::{VdpaError, VdpaInfoProvider};
pub use vfio::VfioInfoProvider;
pub use vhost_net::VhostNetInfoProvider;

/// Key/value environment info contributed by one provider for one device.
pub type AdditionalInfo = BTreeMap<String, String>;

pub(crate) const READ_WRITE: &str = "rw";
pub(crate) const MKNOD_READ_WRITE: &str = "mrw";

const VFIO_DRIVER: &str = "vfio-pci";
const UIO_DRIVERS: [&str; 3] = ["igb_uio", "uio_pci_generic", "uio"];

/// Describes how a container gets access to a device.
pub trait DeviceInfoProvider: Send + Sync + fmt::Debug {
    /// Tag of the provider, the outer key of the device's environment info.
    fn name(&self) -> &'static str;

    /// Device nodes to create in the container.
    fn device_specs(&self) -> Vec<DeviceSpec>;

    /// Environment info describing the device to the workload.
    fn env_val(&self) -> AdditionalInfo;

    /// Host paths to mount in the container.
    fn mounts(&self) -> Vec<Mount> {
        Vec::new()
    }
}

/// Selects the providers of a PCI device from the driver it is bound to.
pub fn default_providers(
    host: &dyn Host,
    driver: &str,
    pci_addr: &str,
) -> Vec<Box<dyn DeviceInfoProvider>> {
    match driver {
        VFIO_DRIVER => vec![Box::new(VfioInfoProvider::new(host, pci_addr))],
        d if UIO_DRIVERS.contains(&d) => vec![Box::new(UioInfoProvider::new(host, pci_addr))],
        _ => vec![Box::new(GenericInfoProvider::new(pci_addr))],
    }
}

/// A device node exposed at the same path in the container.
pub(crate) fn device_spec(path: &str, permissions: &str) -> DeviceSpec {
    DeviceSpec {
        container_path: path.to_owned(),
        host_path: path.to_owned(),
        permissions: permissions.to_owned(),
    }
}
