use tracing::warn;

use super::{DeviceBase, DeviceError, DeviceKind, HostDevice, NetAttributes};
use crate::host::{Host, PciDevice};
use crate::info_provider::{DeviceInfoProvider, GenericInfoProvider, RdmaInfoProvider};
use crate::resource_config::{AuxNetDeviceSelectors, ResourceConfig};

/// Attributes of an auxiliary network device.
#[derive(Clone, Debug)]
pub struct AuxNetAttributes {
    /// The type component of the device name, e.g. `sf` for `mlx5_core.sf.4`
    pub aux_type: String,
    /// Network attributes. The parent PCI function plays the role of the PF
    pub net: NetAttributes,
}

/// Extracts the type from an auxiliary device name of the form `<driver>.<type>.<n>`.
pub(crate) fn parse_aux_type(name: &str) -> Option<&str> {
    let parts = name.split('.').collect::<Vec<_>>();
    match parts[..] {
        [driver, aux_type, index] if !driver.is_empty() && !aux_type.is_empty() && !index.is_empty() => {
            Some(aux_type)
        }
        _ => None,
    }
}

impl HostDevice {
    /// Builds the auxiliary device `aux_name` carved out of `parent`.
    pub fn new_aux_net(
        host: &dyn Host,
        parent: &PciDevice,
        aux_name: &str,
        rc: &ResourceConfig,
        selectors: &AuxNetDeviceSelectors,
    ) -> Result<Self, DeviceError> {
        let aux_type = parse_aux_type(aux_name)
            .ok_or_else(|| DeviceError::AuxName(aux_name.to_owned()))?
            .to_owned();

        let mut net = NetAttributes::resolve(host, aux_name, parent.address.clone());
        net.vf_index = host.sf_index(aux_name);

        let mut providers: Vec<Box<dyn DeviceInfoProvider>> =
            vec![Box::new(GenericInfoProvider::new(aux_name))];
        if selectors.generic.is_rdma {
            if net.rdma.is_rdma() {
                providers.push(Box::new(RdmaInfoProvider::new(net.rdma.clone())));
            } else {
                warn!(device = %aux_name, "RDMA resources not found. Are RDMA modules loaded?");
            }
        }

        Ok(HostDevice {
            base: DeviceBase::new(host, aux_name, parent, rc, providers)?,
            kind: DeviceKind::AuxNet(AuxNetAttributes { aux_type, net }),
        })
    }
}
