use super::{DeviceBase, DeviceError, DeviceKind, HostDevice};
use crate::host::{Host, PciDevice};
use crate::resource_config::ResourceConfig;

impl HostDevice {
    /// Builds an accelerator device. Accelerators only carry the common PCI attributes.
    pub fn new_accelerator(
        host: &dyn Host,
        pci: &PciDevice,
        rc: &ResourceConfig,
    ) -> Result<Self, DeviceError> {
        Ok(HostDevice {
            base: DeviceBase::new(host, &pci.address, pci, rc, Vec::new())?,
            kind: DeviceKind::Accelerator,
        })
    }
}
