//! An in-memory [`Host`] for tests.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{Host, HostError, PciDevice, VdpaDevice};

/// Everything the fake host knows about one PCI function or auxiliary device.
#[derive(Clone, Debug, Default)]
pub(crate) struct FakeDevice {
    pub id: String,
    /// Absent for auxiliary devices, which are not enumerated on the PCI bus
    pub pci: Option<PciDevice>,
    pub driver: Option<String>,
    pub numa_node: Option<i64>,
    pub net_names: Vec<String>,
    pub total_vfs: u32,
    pub num_vfs: u32,
    pub default_route: bool,
    pub pf: Option<String>,
    pub vf_index: Option<i32>,
    pub iommu_group: Option<String>,
    pub uio: Option<String>,
    pub rdma: Vec<String>,
    pub vdpa: Option<VdpaDevice>,
    pub aux: Vec<String>,
    pub sf_index: Option<i32>,
    pub pkey: Option<String>,
    pub ddp_profile: Option<String>,
}

impl FakeDevice {
    /// A PCI function with the given IDs and no driver.
    pub fn pci(address: &str, vendor: &str, device: &str, class_id: &str) -> Self {
        FakeDevice {
            id: address.to_owned(),
            pci: Some(PciDevice {
                address: address.to_owned(),
                vendor: vendor.to_owned(),
                device: device.to_owned(),
                class_id: class_id.to_owned(),
            }),
            ..Default::default()
        }
    }

    /// An Intel VF bound to iavf on NUMA node 0.
    pub fn vf(address: &str, pf: &str, index: i32) -> Self {
        FakeDevice {
            driver: Some("iavf".to_owned()),
            numa_node: Some(0),
            pf: Some(pf.to_owned()),
            vf_index: Some(index),
            ..FakeDevice::pci(address, "8086", "154c", "02")
        }
    }

    /// An auxiliary SF device bound to mlx5_core.
    pub fn sf(name: &str, index: i32) -> Self {
        FakeDevice {
            id: name.to_owned(),
            driver: Some("mlx5_core".to_owned()),
            sf_index: Some(index),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
struct FakeLink {
    link_type: Option<String>,
    speed: Option<u32>,
    oper_state: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    devices: BTreeMap<String, FakeDevice>,
    links: HashMap<String, FakeLink>,
    rdma_chars: HashMap<String, Vec<String>>,
    vhost_net: bool,
}

/// A [`Host`] answering from a table of fake devices. Health relevant state can be changed after
/// construction to drive probes.
#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    state: RwLock<FakeState>,
    driver_lookups: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        FakeHost::default()
    }

    pub fn with_device(mut self, device: FakeDevice) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .devices
            .insert(device.id.clone(), device);
        self
    }

    pub fn with_link(mut self, ifname: &str, link_type: &str, oper_state: &str) -> Self {
        self.state.get_mut().unwrap().links.insert(
            ifname.to_owned(),
            FakeLink {
                link_type: Some(link_type.to_owned()),
                speed: Some(25000),
                oper_state: Some(oper_state.to_owned()),
            },
        );
        self
    }

    pub fn with_rdma_chars(mut self, rdma_device: &str, chars: &[&str]) -> Self {
        self.state.get_mut().unwrap().rdma_chars.insert(
            rdma_device.to_owned(),
            chars.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn with_vhost_net(mut self) -> Self {
        self.state.get_mut().unwrap().vhost_net = true;
        self
    }

    pub fn set_oper_state(&self, ifname: &str, oper_state: &str) {
        let mut state = self.state.write().unwrap();
        state.links.entry(ifname.to_owned()).or_default().oper_state = Some(oper_state.to_owned());
    }

    pub fn set_driver(&self, device_id: &str, driver: Option<&str>) {
        let mut state = self.state.write().unwrap();
        if let Some(device) = state.devices.get_mut(device_id) {
            device.driver = driver.map(str::to_owned);
        }
    }

    /// How many times `driver_name` was called.
    pub fn driver_lookups(&self) -> usize {
        self.driver_lookups.load(Ordering::SeqCst)
    }

    fn device<T>(&self, device_id: &str, f: impl FnOnce(&FakeDevice) -> T) -> Option<T> {
        self.state.read().unwrap().devices.get(device_id).map(f)
    }

    fn link<T>(&self, ifname: &str, f: impl FnOnce(&FakeLink) -> Option<T>) -> Option<T> {
        self.state.read().unwrap().links.get(ifname).and_then(f)
    }
}

impl Host for FakeHost {
    fn pci_devices(&self) -> Result<Vec<PciDevice>, HostError> {
        Ok(self
            .state
            .read()
            .unwrap()
            .devices
            .values()
            .filter_map(|d| d.pci.clone())
            .collect())
    }

    fn driver_name(&self, device_id: &str) -> Result<String, HostError> {
        self.driver_lookups.fetch_add(1, Ordering::SeqCst);
        self.device(device_id, |d| d.driver.clone())
            .ok_or_else(|| HostError::NotFound(device_id.to_owned()))?
            .ok_or_else(|| HostError::NoDriver(device_id.to_owned()))
    }

    fn numa_node(&self, pci_addr: &str) -> Option<i64> {
        self.device(pci_addr, |d| d.numa_node).flatten()
    }

    fn net_names(&self, device_id: &str) -> Vec<String> {
        self.device(device_id, |d| d.net_names.clone())
            .unwrap_or_default()
    }

    fn is_sriov_pf(&self, pci_addr: &str) -> bool {
        self.device(pci_addr, |d| d.total_vfs > 0).unwrap_or(false)
    }

    fn sriov_configured(&self, pci_addr: &str) -> bool {
        self.device(pci_addr, |d| d.num_vfs > 0).unwrap_or(false)
    }

    fn has_default_route(&self, pci_addr: &str) -> bool {
        self.device(pci_addr, |d| d.default_route).unwrap_or(false)
    }

    fn pf_pci_addr(&self, pci_addr: &str) -> Option<String> {
        self.device(pci_addr, |d| d.pf.clone()).flatten()
    }

    fn vf_index(&self, pci_addr: &str) -> Option<i32> {
        self.device(pci_addr, |d| d.vf_index).flatten()
    }

    fn link_type(&self, ifname: &str) -> Option<String> {
        self.link(ifname, |l| l.link_type.clone())
    }

    fn link_speed(&self, ifname: &str) -> Option<u32> {
        self.link(ifname, |l| l.speed)
    }

    fn oper_state(&self, ifname: &str) -> Option<String> {
        self.link(ifname, |l| l.oper_state.clone())
    }

    fn iommu_group(&self, pci_addr: &str) -> Option<String> {
        self.device(pci_addr, |d| d.iommu_group.clone()).flatten()
    }

    fn uio_device(&self, pci_addr: &str) -> Option<String> {
        self.device(pci_addr, |d| d.uio.clone()).flatten()
    }

    fn rdma_devices(&self, device_id: &str) -> Vec<String> {
        self.device(device_id, |d| d.rdma.clone())
            .unwrap_or_default()
    }

    fn rdma_char_devices(&self, rdma_device: &str) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .rdma_chars
            .get(rdma_device)
            .cloned()
            .unwrap_or_default()
    }

    fn vdpa_device(&self, pci_addr: &str) -> Option<VdpaDevice> {
        self.device(pci_addr, |d| d.vdpa.clone()).flatten()
    }

    fn aux_devices(&self, pci_addr: &str) -> Vec<String> {
        self.device(pci_addr, |d| d.aux.clone()).unwrap_or_default()
    }

    fn sf_index(&self, aux_device: &str) -> Option<i32> {
        self.device(aux_device, |d| d.sf_index).flatten()
    }

    fn pkey(&self, device_id: &str) -> Option<String> {
        self.device(device_id, |d| d.pkey.clone()).flatten()
    }

    fn ddp_profile(&self, pci_addr: &str) -> Option<String> {
        self.device(pci_addr, |d| d.ddp_profile.clone()).flatten()
    }

    fn vhost_net_available(&self) -> bool {
        self.state.read().unwrap().vhost_net
    }
}
