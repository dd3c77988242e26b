use std::sync::Arc;

use tracing::{error, warn};

use super::{class_matches, selector_set, DeviceProvider, ProviderError, NET_CLASS};
use crate::devices::HostDevice;
use crate::host::{Host, PciDevice};
use crate::resource_config::{DeviceType, ResourceConfig, SelectorSet};
use crate::selectors;

const SUPPORTED_AUX_TYPES: [&str; 1] = ["sf"];

/// Provider of auxiliary network devices. Candidates are the parent PCI functions, every
/// auxiliary device found below a candidate becomes a device of its own.
pub struct AuxNetDeviceProvider {
    host: Arc<dyn Host>,
    devices: Vec<PciDevice>,
}

impl AuxNetDeviceProvider {
    /// Returns a provider with no candidates.
    pub fn new(host: Arc<dyn Host>) -> Self {
        AuxNetDeviceProvider {
            host,
            devices: Vec::new(),
        }
    }
}

impl DeviceProvider for AuxNetDeviceProvider {
    fn device_type(&self) -> DeviceType {
        DeviceType::AuxNetDevice
    }

    fn class_code(&self) -> u8 {
        NET_CLASS
    }

    fn add_target_devices(&mut self, devices: &[PciDevice], class_code: u8) {
        self.devices.extend(
            devices
                .iter()
                .filter(|d| class_matches(d, class_code))
                .cloned(),
        );
    }

    fn discovered_devices(&self) -> &[PciDevice] {
        &self.devices
    }

    fn get_devices(&self, rc: &ResourceConfig, selector_index: usize) -> Vec<HostDevice> {
        let selectors = match selector_set(rc, selector_index) {
            Ok(SelectorSet::AuxNet(s)) => s,
            Ok(_) => {
                error!(resource = %rc.resource_name, "Selectors are not auxNetDevice selectors");
                return Vec::new();
            }
            Err(e) => {
                error!(error = %e, "Unable to get devices");
                return Vec::new();
            }
        };
        let mut devices = Vec::new();
        for parent in &self.devices {
            for aux_name in self.host.aux_devices(&parent.address) {
                match HostDevice::new_aux_net(self.host.as_ref(), parent, &aux_name, rc, selectors) {
                    Ok(device) => devices.push(device),
                    Err(e) => {
                        warn!(device = %aux_name, error = %e, "Unable to create auxiliary device")
                    }
                }
            }
        }
        devices
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
        for set in &rc.selectors {
            let aux = match set {
                SelectorSet::AuxNet(aux) => aux,
                _ => {
                    return Err(ProviderError::invalid(
                        rc,
                        "selectors are not auxNetDevice selectors",
                    ))
                }
            };
            if aux.aux_types.is_empty() {
                return Err(ProviderError::invalid(rc, "auxTypes must be set"));
            }
            if let Some(unsupported) = aux
                .aux_types
                .iter()
                .find(|t| !SUPPORTED_AUX_TYPES.contains(&t.as_str()))
            {
                return Err(ProviderError::invalid(
                    rc,
                    format!("unsupported auxType {:?}", unsupported),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::{FakeDevice, FakeHost};

    fn provider() -> AuxNetDeviceProvider {
        let host: Arc<dyn Host> = Arc::new(
            FakeHost::new()
                .with_device(FakeDevice {
                    driver: Some("mlx5_core".to_owned()),
                    net_names: vec!["p0".to_owned()],
                    aux: vec![
                        "mlx5_core.sf.2".to_owned(),
                        "mlx5_core.sf.3".to_owned(),
                        "mlx5_core.sf.4".to_owned(),
                    ],
                    ..FakeDevice::pci("0000:03:00.0", "15b3", "a2d6", "02")
                })
                .with_device(FakeDevice::sf("mlx5_core.sf.2", 2))
                .with_device(FakeDevice::sf("mlx5_core.sf.3", 3))
                .with_device(FakeDevice::sf("mlx5_core.sf.4", 4))
                .with_device(FakeDevice::pci("0000:af:00.0", "8086", "0d5c", "12")),
        );
        let mut provider = AuxNetDeviceProvider::new(host.clone());
        provider.add_target_devices(&host.pci_devices().unwrap(), NET_CLASS);
        provider
    }

    #[test]
    fn test_aux_fan_out() {
        let provider = provider();
        assert_eq!(provider.discovered_devices().len(), 1);
        let rc = ResourceConfig::from_test_json(
            r#"{"resourceName": "sf", "deviceType": "auxNetDevice", "selectors": {"auxTypes": ["sf"]}}"#,
        );
        let devices = provider.get_devices(&rc, 0);
        let ids = devices.iter().map(|d| d.id()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["mlx5_core.sf.2", "mlx5_core.sf.3", "mlx5_core.sf.4"]);
        assert!(devices.iter().all(|d| d.pci_addr() == "0000:03:00.0"));
    }

    #[test]
    fn test_aux_filtering() {
        let provider = provider();
        let rc = ResourceConfig::from_test_json(
            r#"{"resourceName": "sf", "deviceType": "auxNetDevice",
                "selectors": {"auxTypes": ["sf"], "pfNames": ["p0#3-9"], "pciAddresses": ["0000:03:00.0"]}}"#,
        );
        let devices = provider
            .get_filtered_devices(provider.get_devices(&rc, 0), &rc, 0)
            .unwrap();
        let ids = devices.iter().map(|d| d.id()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["mlx5_core.sf.3", "mlx5_core.sf.4"]);
    }

    #[test]
    fn test_valid_config_requires_sf() {
        let provider = provider();
        let config = |selectors: &str| {
            ResourceConfig::from_test_json(&format!(
                r#"{{"resourceName": "sf", "deviceType": "auxNetDevice", "selectors": {}}}"#,
                selectors
            ))
        };
        assert!(provider.valid_config(&config(r#"{"auxTypes": ["sf"]}"#)).is_ok());
        assert!(provider.valid_config(&config("{}")).is_err());
        assert!(provider
            .valid_config(&config(r#"{"auxTypes": ["sf", "eth"]}"#))
            .is_err());
    }
}
