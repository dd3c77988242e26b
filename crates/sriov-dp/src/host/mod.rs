//! Queries over host state: PCI enumeration, drivers, netdevs, SR-IOV topology, RDMA and vDPA.
//!
//! Everything else in the crate talks to the host through the [`Host`] trait so discovery can be
//! exercised against a fake host in tests. [`SysfsHost`] is the implementation used at runtime.
mod sysfs;

#[cfg(test)]
pub(crate) mod fake;

pub use sysfs::SysfsHost;

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by host queries that cannot degrade to "unknown".
#[derive(Error, Debug)]
pub enum HostError {
    /// The device exists but no driver is bound to it
    #[error("no driver bound to device {0}")]
    NoDriver(String),
    /// The device is not known to the host
    #[error("device {0} not found")]
    NotFound(String),
    /// Reading host state failed
    #[error("unable to read {path:?}: {source}")]
    Io {
        /// The path that could not be read
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },
}

/// A PCI function as enumerated from the bus. Immutable snapshot of one enumeration pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PciDevice {
    /// PCI address in `dddd:bb:dd.f` form
    pub address: String,
    /// Vendor ID, four lowercase hex digits without `0x`
    pub vendor: String,
    /// Device ID, four lowercase hex digits without `0x`
    pub device: String,
    /// Base class code as two hex digits, e.g. `02` for network controllers
    pub class_id: String,
}

/// A vDPA device bound on top of a PCI function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VdpaDevice {
    /// Name on the vdpa bus, e.g. `vdpa0`
    pub name: String,
    /// Address of the PCI function backing the device
    pub parent: String,
    /// `vhost` or `virtio`, following the bound vdpa bus driver
    pub vdpa_type: String,
    /// Character device of a vhost vDPA device, e.g. `/dev/vhost-vdpa-0`
    pub path: Option<String>,
}

/// Primitive host queries used during discovery and health probing.
///
/// Device IDs are either PCI addresses or auxiliary device names, implementations resolve both.
/// Lookups that may legitimately fail degrade to `None` or an empty list.
pub trait Host: Send + Sync {
    /// Enumerates every PCI function on the host.
    fn pci_devices(&self) -> Result<Vec<PciDevice>, HostError>;

    /// Name of the driver bound to the device.
    fn driver_name(&self, device_id: &str) -> Result<String, HostError>;

    /// Raw NUMA node of a PCI function, `-1` when the platform does not know it.
    fn numa_node(&self, pci_addr: &str) -> Option<i64>;

    /// Netdevs created by the device.
    fn net_names(&self, device_id: &str) -> Vec<String>;

    /// True when the function is an SR-IOV physical function.
    fn is_sriov_pf(&self, pci_addr: &str) -> bool;

    /// True when the physical function has VFs enabled.
    fn sriov_configured(&self, pci_addr: &str) -> bool;

    /// True when one of the device's netdevs carries the host default route.
    fn has_default_route(&self, pci_addr: &str) -> bool;

    /// PCI address of the physical function a VF belongs to.
    fn pf_pci_addr(&self, pci_addr: &str) -> Option<String>;

    /// Index of a VF below its physical function.
    fn vf_index(&self, pci_addr: &str) -> Option<i32>;

    /// Encapsulation of a link, e.g. `ether` or `infiniband`.
    fn link_type(&self, ifname: &str) -> Option<String>;

    /// Link speed in Mb/s.
    fn link_speed(&self, ifname: &str) -> Option<u32>;

    /// Operational state of a link, e.g. `up` or `down`.
    fn oper_state(&self, ifname: &str) -> Option<String>;

    /// IOMMU group number of a PCI function.
    fn iommu_group(&self, pci_addr: &str) -> Option<String>;

    /// Name of the UIO device of a PCI function, e.g. `uio0`.
    fn uio_device(&self, pci_addr: &str) -> Option<String>;

    /// RDMA devices, e.g. `mlx5_0`, created by the device.
    fn rdma_devices(&self, device_id: &str) -> Vec<String>;

    /// Character devices under `/dev/infiniband` giving access to an RDMA device.
    fn rdma_char_devices(&self, rdma_device: &str) -> Vec<String>;

    /// vDPA device created on top of a PCI function.
    fn vdpa_device(&self, pci_addr: &str) -> Option<VdpaDevice>;

    /// Auxiliary devices, e.g. `mlx5_core.sf.4`, carved out of a PCI function.
    fn aux_devices(&self, pci_addr: &str) -> Vec<String>;

    /// Sub-function number of an auxiliary SF device.
    fn sf_index(&self, aux_device: &str) -> Option<i32>;

    /// Default InfiniBand partition key of the device.
    fn pkey(&self, device_id: &str) -> Option<String>;

    /// Name of the loaded DDP profile.
    fn ddp_profile(&self, pci_addr: &str) -> Option<String>;

    /// True when `/dev/vhost-net` and `/dev/net/tun` exist.
    fn vhost_net_available(&self) -> bool;
}
