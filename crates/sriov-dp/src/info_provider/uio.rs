use tracing::warn;

use super::{device_spec, AdditionalInfo, DeviceInfoProvider, READ_WRITE};
use crate::device_plugin_api::v1beta1::DeviceSpec;
use crate::host::Host;

/// Exposes the `/dev/uioN` node of a UIO bound function.
#[derive(Clone, Debug)]
pub struct UioInfoProvider {
    pci_addr: String,
    uio_node: Option<String>,
}

impl UioInfoProvider {
    /// Resolves the UIO device node of the function.
    pub fn new(host: &dyn Host, pci_addr: &str) -> Self {
        UioInfoProvider {
            pci_addr: pci_addr.to_owned(),
            uio_node: host
                .uio_device(pci_addr)
                .map(|uio| format!("/dev/{}", uio)),
        }
    }
}

impl DeviceInfoProvider for UioInfoProvider {
    fn name(&self) -> &'static str {
        "uio"
    }

    fn device_specs(&self) -> Vec<DeviceSpec> {
        match &self.uio_node {
            Some(node) => vec![device_spec(node, READ_WRITE)],
            None => {
                warn!(device = %self.pci_addr, "No uio device found");
                Vec::new()
            }
        }
    }

    fn env_val(&self) -> AdditionalInfo {
        let mut env = AdditionalInfo::new();
        if let Some(node) = &self.uio_node {
            env.insert("dev-mount".to_owned(), node.clone());
        }
        env
    }
}
