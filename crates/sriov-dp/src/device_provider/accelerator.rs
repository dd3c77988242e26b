use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{class_matches, selector_set, DeviceProvider, ProviderError, ACCELERATOR_CLASS};
use crate::devices::HostDevice;
use crate::host::{Host, PciDevice};
use crate::resource_config::{DeviceType, ResourceConfig, SelectorSet};
use crate::selectors;

/// Provider of accelerator functions, e.g. FEC or QAT VFs.
pub struct AccelDeviceProvider {
    host: Arc<dyn Host>,
    devices: Vec<PciDevice>,
}

impl AccelDeviceProvider {
    /// Returns a provider with no candidates.
    pub fn new(host: Arc<dyn Host>) -> Self {
        AccelDeviceProvider {
            host,
            devices: Vec::new(),
        }
    }
}

impl DeviceProvider for AccelDeviceProvider {
    fn device_type(&self) -> DeviceType {
        DeviceType::Accelerator
    }

    fn class_code(&self) -> u8 {
        ACCELERATOR_CLASS
    }

    fn add_target_devices(&mut self, devices: &[PciDevice], class_code: u8) {
        for device in devices.iter().filter(|d| class_matches(d, class_code)) {
            if self.host.is_sriov_pf(&device.address) && self.host.sriov_configured(&device.address) {
                debug!(device = %device.address, "Skipping PF with VFs configured");
                continue;
            }
            self.devices.push(device.clone());
        }
    }

    fn discovered_devices(&self) -> &[PciDevice] {
        &self.devices
    }

    fn get_devices(&self, rc: &ResourceConfig, selector_index: usize) -> Vec<HostDevice> {
        if let Err(e) = selector_set(rc, selector_index) {
            error!(error = %e, "Unable to get devices");
            return Vec::new();
        }
        self.devices
            .iter()
            .filter_map(
                |pci| match HostDevice::new_accelerator(self.host.as_ref(), pci, rc) {
                    Ok(device) => Some(device),
                    Err(e) => {
                        warn!(device = %pci.address, error = %e, "Unable to create accelerator device");
                        None
                    }
                },
            )
            .collect()
    }

    fn get_filtered_devices(
        &self,
        devices: Vec<HostDevice>,
        rc: &ResourceConfig,
        selector_index: usize,
    ) -> Result<Vec<HostDevice>, ProviderError> {
        let set = selector_set(rc, selector_index)?;
        Ok(selectors::apply(&selectors::chain(set), devices))
    }

    fn valid_config(&self, rc: &ResourceConfig) -> Result<(), ProviderError> {
        if rc
            .selectors
            .iter()
            .all(|set| matches!(set, SelectorSet::Accelerator(_)))
        {
            Ok(())
        } else {
            Err(ProviderError::invalid(
                rc,
                "selectors are not accelerator selectors",
            ))
        }
    }
}
