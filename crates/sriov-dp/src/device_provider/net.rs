use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{class_matches, selector_set, DeviceProvider, ProviderError, NET_CLASS};
use crate::devices::HostDevice;
use crate::host::{Host, PciDevice};
use crate::resource_config::{
    DeviceType, ResourceConfig, SelectorSet, VDPA_VHOST_TYPE, VDPA_VIRTIO_TYPE,
};
use crate::selectors;

/// Provider of SR-IOV network functions.
pub struct NetDeviceProvider {
    host: Arc<dyn Host>,
    devices: Vec<PciDevice>,
}

impl NetDeviceProvider {
    /// Returns a provider with no candidates.
    pub fn new(host: Arc<dyn Host>) -> Self {
        NetDeviceProvider {
            host,
            devices: Vec::new(),
        }
    }
}

impl DeviceProvider for NetDeviceProvider {
    fn device_type(&self) -> DeviceType {
        DeviceType::NetDevice
    }

    fn class_code(&self) -> u8 {
        NET_CLASS
    }

    fn add_target_devices(&mut self, devices: &[PciDevice], class_code: u8) {
        for device in devices.iter().filter(|d| class_matches(d, class_code)) {
            if self.host.is_sriov_pf(&device.address) && self.host.sriov_configured(&device.address) {
                debug!(device = %device.address, "Skipping PF with VFs configured");
                continue;
            }
            if self.host.has_default_route(&device.address) {
                info!(device = %device.address, "Skipping device carrying the default route");
                continue;
            }
            self.devices.push(device.clone());
        }
    }

    fn discovered_devices(&self) -> &[PciDevice] {
        &self.devices
    }

    fn get_devices(&self, rc: &ResourceConfig, selector_index: usize) -> Vec<HostDevice> {
        let selectors = match selector_set(rc, selector_index) {
            Ok(SelectorSet::Net(s)) => s,
            Ok(_) => {
                error!(resource = %rc.resource_name, "Selectors are not netDevice selectors");
                return Vec::new();
            }
            Err(e) => {
                error!(error = %e, "Unable to get devices");
                return Vec::new();
            }
        };
        self.devices
            .iter()
            .filter_map(
                |pci| match HostDevice::new_net(self.host.as_ref(), pci, rc, selectors) {
                    Ok(device) => Some(device),
                    Err(e) => {
                        warn!(device = %pci.address, error = %e, "Unable to create net device");
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
        let filtered = selectors::apply(&selectors::chain(set), devices);
        if let SelectorSet::Net(net) = set {
            if net.need_vhost_net && !self.host.vhost_net_available() {
                error!(resource = %rc.resource_name, "vhost-net is required but not available on the host");
                return Ok(Vec::new());
            }
        }
        Ok(filtered)
    }

    fn valid_config(&self, rc: &ResourceConfig) -> Result<(), ProviderError> {
        for set in &rc.selectors {
            let net = match set {
                SelectorSet::Net(net) => net,
                _ => return Err(ProviderError::invalid(rc, "selectors are not netDevice selectors")),
            };
            if net.generic.is_rdma && !net.vdpa_type.is_empty() {
                return Err(ProviderError::invalid(
                    rc,
                    "isRdma and vdpaType cannot be used together",
                ));
            }
            match net.vdpa_type.as_str() {
                "" | VDPA_VIRTIO_TYPE | VDPA_VHOST_TYPE => {}
                other => {
                    return Err(ProviderError::invalid(
                        rc,
                        format!("unsupported vdpaType {:?}", other),
                    ))
                }
            }
        }
        Ok(())
    }
}
