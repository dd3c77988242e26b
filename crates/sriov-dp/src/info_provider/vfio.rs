use tracing::warn;

use super::{device_spec, AdditionalInfo, DeviceInfoProvider, READ_WRITE};
use crate::device_plugin_api::v1beta1::DeviceSpec;
use crate::host::Host;

const VFIO_CONTAINER: &str = "/dev/vfio/vfio";

/// Exposes the IOMMU group of a vfio-pci bound function along with the VFIO container node.
#[derive(Clone, Debug)]
pub struct VfioInfoProvider {
    pci_addr: String,
    group_node: Option<String>,
}

impl VfioInfoProvider {
    /// Resolves the IOMMU group device node of the function.
    pub fn new(host: &dyn Host, pci_addr: &str) -> Self {
        VfioInfoProvider {
            pci_addr: pci_addr.to_owned(),
            group_node: host
                .iommu_group(pci_addr)
                .map(|group| format!("/dev/vfio/{}", group)),
        }
    }
}

impl DeviceInfoProvider for VfioInfoProvider {
    fn name(&self) -> &'static str {
        "vfio"
    }

    fn device_specs(&self) -> Vec<DeviceSpec> {
        match &self.group_node {
            Some(group) => vec![
                device_spec(VFIO_CONTAINER, READ_WRITE),
                device_spec(group, READ_WRITE),
            ],
            None => {
                warn!(device = %self.pci_addr, "No IOMMU group found for vfio-pci device");
                Vec::new()
            }
        }
    }

    fn env_val(&self) -> AdditionalInfo {
        let mut env = AdditionalInfo::new();
        env.insert("mount".to_owned(), VFIO_CONTAINER.to_owned());
        if let Some(group) = &self.group_node {
            env.insert("dev-mount".to_owned(), group.clone());
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::{FakeDevice, FakeHost};

    #[test]
    fn test_vfio_group_and_container() {
        let host = FakeHost::new().with_device(FakeDevice {
            driver: Some("vfio-pci".to_owned()),
            iommu_group: Some("67".to_owned()),
            ..FakeDevice::vf("0000:3b:02.1", "0000:3b:00.0", 1)
        });
        let provider = VfioInfoProvider::new(&host, "0000:3b:02.1");
        let specs = provider.device_specs();
        assert_eq!(specs.len(), 2);
        assert!(specs
            .iter()
            .any(|s| s.host_path == "/dev/vfio/vfio" && s.permissions == "rw"));
        assert!(specs
            .iter()
            .any(|s| s.host_path == "/dev/vfio/67" && s.container_path == "/dev/vfio/67"));
        let env = provider.env_val();
        assert_eq!(env["dev-mount"], "/dev/vfio/67");
        assert_eq!(env["mount"], "/dev/vfio/vfio");
    }

    #[test]
    fn test_vfio_without_group() {
        let host = FakeHost::new().with_device(FakeDevice::vf("0000:3b:02.1", "0000:3b:00.0", 1));
        let provider = VfioInfoProvider::new(&host, "0000:3b:02.1");
        assert!(provider.device_specs().is_empty());
        assert!(!provider.env_val().contains_key("dev-mount"));
    }
}
