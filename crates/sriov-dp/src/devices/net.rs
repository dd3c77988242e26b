use tracing::{error, warn};

use super::{resolve_driver, DeviceBase, DeviceError, DeviceKind, HostDevice};
use crate::host::{Host, PciDevice, VdpaDevice};
use crate::info_provider::{
    default_providers, DeviceInfoProvider, RdmaInfoProvider, RdmaSpec, VdpaInfoProvider,
    VhostNetInfoProvider,
};
use crate::resource_config::{NetDeviceSelectors, ResourceConfig};

/// Attributes of a network device, shared by PCI and auxiliary net devices.
#[derive(Clone, Debug, Default)]
pub struct NetAttributes {
    /// Netdev of the physical function
    pub pf_name: Option<String>,
    /// PCI address of the physical function. A PF is its own root
    pub pf_addr: String,
    /// Netdev of the device itself, absent when bound to a userspace driver
    pub net_name: Option<String>,
    /// Link type of the device, or of its PF when the device has no netdev
    pub link_type: Option<String>,
    /// Link speed in Mb/s
    pub link_speed: Option<u32>,
    /// VF index below the PF, the SF number for auxiliary devices
    pub vf_index: Option<i32>,
    /// RDMA device and character devices
    pub rdma: RdmaSpec,
    /// vDPA device on top of the function
    pub vdpa: Option<VdpaDevice>,
    /// DDP profile loaded on the PF, only resolved when a selector asks for it
    pub ddp_profile: Option<String>,
    /// Default InfiniBand partition key
    pub pkey: Option<String>,
}

impl NetAttributes {
    /// Resolves the link level attributes of `device_id`, whose PF is at `pf_addr`.
    pub(super) fn resolve(host: &dyn Host, device_id: &str, pf_addr: String) -> Self {
        let net_name = host.net_names(device_id).into_iter().next();
        let pf_name = host.net_names(&pf_addr).into_iter().next();
        let link_type = net_name
            .as_deref()
            .and_then(|n| host.link_type(n))
            .or_else(|| pf_name.as_deref().and_then(|n| host.link_type(n)));
        let link_speed = net_name
            .as_deref()
            .and_then(|n| host.link_speed(n))
            .or_else(|| pf_name.as_deref().and_then(|n| host.link_speed(n)));

        NetAttributes {
            link_type,
            link_speed,
            rdma: RdmaSpec::new(host, device_id),
            pkey: host.pkey(device_id),
            pf_name,
            pf_addr,
            net_name,
            ..Default::default()
        }
    }
}

impl HostDevice {
    /// Builds a network device from a PCI function, adding the RDMA, vhost-net and vDPA providers
    /// the selectors ask for.
    pub fn new_net(
        host: &dyn Host,
        pci: &PciDevice,
        rc: &ResourceConfig,
        selectors: &NetDeviceSelectors,
    ) -> Result<Self, DeviceError> {
        let addr = pci.address.as_str();
        let pf_addr = host.pf_pci_addr(addr).unwrap_or_else(|| addr.to_owned());
        let mut net = NetAttributes::resolve(host, addr, pf_addr);
        net.vf_index = host.vf_index(addr);
        net.vdpa = host.vdpa_device(addr);
        if !selectors.ddp_profiles.is_empty() {
            net.ddp_profile = host.ddp_profile(&net.pf_addr);
        }

        let driver = resolve_driver(host, addr)?;
        let mut providers: Vec<Box<dyn DeviceInfoProvider>> = default_providers(host, &driver, addr);

        if selectors.generic.is_rdma {
            if net.rdma.is_rdma() {
                providers.push(Box::new(RdmaInfoProvider::new(net.rdma.clone())));
            } else {
                warn!(device = %addr, "RDMA resources not found. Are RDMA modules loaded?");
            }
        }
        if selectors.need_vhost_net {
            if host.vhost_net_available() {
                providers.push(Box::new(VhostNetInfoProvider::new()));
            } else {
                error!(device = %addr, "vhost-net requested but /dev/vhost-net or /dev/net/tun is missing");
            }
        }
        if !selectors.vdpa_type.is_empty() {
            providers.push(Box::new(VdpaInfoProvider::new(
                &selectors.vdpa_type,
                net.vdpa.clone(),
            )));
        }

        Ok(HostDevice {
            base: DeviceBase::with_driver(host, addr, pci, rc, driver, providers),
            kind: DeviceKind::Net(net),
        })
    }
}
