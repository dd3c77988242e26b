//! The devices of one resource.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::allocator::Allocator;
use crate::device_plugin_api::v1beta1::{Device, DeviceSpec, Mount};
use crate::devices::HostDevice;
use crate::host::Host;
use crate::info_provider::AdditionalInfo;
use crate::resource_config::{DeviceType, ResourceConfig};

const ENV_PREFIX: &str = "PCIDEVICE";

/// Errors answering queries about pool members.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The device is not a member of the pool
    #[error("device {0} not found in resource pool")]
    UnknownDevice(String),
    /// The device info could not be encoded
    #[error("unable to encode device info: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The fixed set of devices of one resource, keyed by device ID. Only the health of the members
/// changes after construction.
pub struct ResourcePool {
    config: ResourceConfig,
    prefix: String,
    host: Arc<dyn Host>,
    devices: BTreeMap<String, HostDevice>,
    allocator: Option<Box<dyn Allocator>>,
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("resource", &self.full_name())
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl ResourcePool {
    /// Builds a pool named `prefix/<resourceName>`. A device listed twice is only kept once.
    pub fn new(
        host: Arc<dyn Host>,
        config: ResourceConfig,
        prefix: &str,
        devices: Vec<HostDevice>,
        allocator: Option<Box<dyn Allocator>>,
    ) -> Self {
        let mut pool = BTreeMap::new();
        for device in devices {
            if pool.contains_key(device.id()) {
                warn!(device = %device.id(), resource = %config.resource_name, "Ignoring duplicate device");
                continue;
            }
            pool.insert(device.id().to_owned(), device);
        }
        ResourcePool {
            config,
            prefix: prefix.to_owned(),
            host,
            devices: pool,
            allocator,
        }
    }

    /// Name of the resource, without prefix.
    pub fn resource_name(&self) -> &str {
        &self.config.resource_name
    }

    /// Prefix of the resource.
    pub fn resource_prefix(&self) -> &str {
        &self.prefix
    }

    /// `<prefix>/<resourceName>`, the name advertised to the kubelet.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.prefix, self.config.resource_name)
    }

    /// Kind of the devices of the pool.
    pub fn device_type(&self) -> DeviceType {
        self.config.device_type
    }

    /// The configuration the pool was built from.
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// The preferred allocation policy, if any.
    pub fn allocator(&self) -> Option<&dyn Allocator> {
        self.allocator.as_deref()
    }

    /// Members of the pool, keyed by device ID.
    pub fn device_pool(&self) -> &BTreeMap<String, HostDevice> {
        &self.devices
    }

    /// Devices as advertised to the kubelet, with their current health.
    pub fn get_devices(&self) -> Vec<Device> {
        self.devices.values().map(HostDevice::api_device).collect()
    }

    /// Device nodes of the given devices. A host path requested by several devices is only
    /// returned once. Unknown IDs are skipped.
    pub fn device_specs(&self, ids: &[String]) -> Vec<DeviceSpec> {
        let mut seen = HashSet::new();
        self.members(ids)
            .flat_map(HostDevice::device_specs)
            .filter(|spec| seen.insert(spec.host_path.clone()))
            .collect()
    }

    /// Mounts of the given devices. Unknown IDs are skipped.
    pub fn mounts(&self, ids: &[String]) -> Vec<Mount> {
        self.members(ids).flat_map(HostDevice::mounts).collect()
    }

    /// Environment for a container holding the given devices:
    /// `PCIDEVICE_<PREFIX>_<NAME>` lists the device IDs and `PCIDEVICE_<PREFIX>_<NAME>_INFO` holds
    /// the provider info of every device as JSON.
    pub fn envs(&self, ids: &[String]) -> Result<HashMap<String, String>, PoolError> {
        let mut info: BTreeMap<&str, BTreeMap<String, AdditionalInfo>> = BTreeMap::new();
        for id in ids {
            let device = self
                .devices
                .get(id)
                .ok_or_else(|| PoolError::UnknownDevice(id.clone()))?;
            info.insert(id, device.env_val());
        }

        let key = self.env_key();
        let mut envs = HashMap::new();
        envs.insert(format!("{}_INFO", key), serde_json::to_string(&info)?);
        envs.insert(key, ids.join(","));
        Ok(envs)
    }

    fn env_key(&self) -> String {
        format!("{}_{}_{}", ENV_PREFIX, self.prefix, self.config.resource_name)
            .replace('.', "_")
            .to_uppercase()
    }

    /// Re-evaluates the health of every member. Returns true when any of them changed.
    pub fn probe(&self) -> bool {
        let mut changed = false;
        for device in self.devices.values() {
            changed |= device.probe(self.host.as_ref());
        }
        if changed {
            debug!(resource = %self.full_name(), "Device health changed");
        }
        changed
    }

    fn members<'a>(&'a self, ids: &'a [String]) -> impl Iterator<Item = &'a HostDevice> + 'a {
        ids.iter().filter_map(move |id| self.devices.get(id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::fake::{FakeDevice, FakeHost};
    use crate::resource_config::SelectorSet;

    /// Two vfio VFs sharing an IOMMU group plus an iavf VF, all on PF `ens1f0`.
    pub(crate) fn host() -> FakeHost {
        FakeHost::new()
            .with_device(FakeDevice {
                driver: Some("ice".to_owned()),
                net_names: vec!["ens1f0".to_owned()],
                ..FakeDevice::pci("0000:3b:00.0", "8086", "1592", "02")
            })
            .with_device(FakeDevice {
                driver: Some("vfio-pci".to_owned()),
                iommu_group: Some("70".to_owned()),
                ..FakeDevice::vf("0000:3b:02.0", "0000:3b:00.0", 0)
            })
            .with_device(FakeDevice {
                driver: Some("vfio-pci".to_owned()),
                iommu_group: Some("70".to_owned()),
                ..FakeDevice::vf("0000:3b:02.1", "0000:3b:00.0", 1)
            })
            .with_device(FakeDevice::vf("0000:3b:02.2", "0000:3b:00.0", 2))
            .with_link("ens1f0", "ether", "up")
    }

    /// A pool of the VFs of `host`.
    pub(crate) fn pool(host: Arc<FakeHost>, json: &str) -> ResourcePool {
        let rc = ResourceConfig::from_test_json(json);
        let selectors = match rc.selector(0) {
            Some(SelectorSet::Net(s)) => s.clone(),
            other => panic!("unexpected selectors {:?}", other),
        };
        let devices = host
            .pci_devices()
            .unwrap()
            .iter()
            .filter(|pci| pci.address != "0000:3b:00.0")
            .map(|pci| HostDevice::new_net(host.as_ref(), pci, &rc, &selectors).unwrap())
            .collect();
        let allocator = crate::resources::allocator::for_policy(&rc.allocate_policy);
        ResourcePool::new(host, rc, "intel.com", devices, allocator)
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_names() {
        let pool = pool(
            Arc::new(host()),
            r#"{"resourceName": "intel_sriov_dpdk", "selectors": {}}"#,
        );
        assert_eq!(pool.full_name(), "intel.com/intel_sriov_dpdk");
        assert_eq!(pool.device_type(), DeviceType::NetDevice);
        assert_eq!(pool.device_pool().len(), 3);
        assert!(pool.allocator().is_none());
    }

    #[test]
    fn test_device_specs_are_deduplicated() {
        let pool = pool(Arc::new(host()), r#"{"resourceName": "dpdk", "selectors": {}}"#);
        let specs = pool.device_specs(&ids(&["0000:3b:02.0", "0000:3b:02.1", "0000:3b:02.2"]));
        let paths = specs.iter().map(|s| s.host_path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["/dev/vfio/vfio", "/dev/vfio/70"]);
        let unique = paths.iter().collect::<HashSet<_>>();
        assert_eq!(unique.len(), paths.len());
    }

    #[test]
    fn test_envs() {
        let pool = pool(
            Arc::new(host()),
            r#"{"resourceName": "intel_sriov_dpdk", "selectors": {}}"#,
        );
        let envs = pool
            .envs(&ids(&["0000:3b:02.0", "0000:3b:02.2"]))
            .unwrap();
        assert_eq!(
            envs["PCIDEVICE_INTEL_COM_INTEL_SRIOV_DPDK"],
            "0000:3b:02.0,0000:3b:02.2"
        );
        let info: serde_json::Value =
            serde_json::from_str(&envs["PCIDEVICE_INTEL_COM_INTEL_SRIOV_DPDK_INFO"]).unwrap();
        assert_eq!(info["0000:3b:02.0"]["vfio"]["dev-mount"], "/dev/vfio/70");
        assert_eq!(info["0000:3b:02.2"]["generic"]["deviceID"], "0000:3b:02.2");

        assert!(matches!(
            pool.envs(&ids(&["0000:3b:02.0", "0000:ff:00.0"])),
            Err(PoolError::UnknownDevice(id)) if id == "0000:ff:00.0"
        ));
    }

    #[test]
    fn test_duplicate_devices_are_dropped() {
        let host = Arc::new(host());
        let first = pool(host.clone(), r#"{"resourceName": "a", "selectors": {}}"#);
        let rc = first.config().clone();
        let selectors = match rc.selector(0) {
            Some(SelectorSet::Net(s)) => s.clone(),
            other => panic!("unexpected selectors {:?}", other),
        };
        let pci = host
            .pci_devices()
            .unwrap()
            .into_iter()
            .find(|d| d.address == "0000:3b:02.2")
            .unwrap();
        let devices = vec![
            HostDevice::new_net(host.as_ref(), &pci, &rc, &selectors).unwrap(),
            HostDevice::new_net(host.as_ref(), &pci, &rc, &selectors).unwrap(),
        ];
        let pool = ResourcePool::new(host, rc, "intel.com", devices, None);
        assert_eq!(pool.get_devices().len(), 1);
    }

    #[test]
    fn test_probe_follows_pf_link() {
        let host = Arc::new(host());
        let pool = pool(host.clone(), r#"{"resourceName": "a", "selectors": {}}"#);
        assert!(!pool.probe());
        host.set_oper_state("ens1f0", "down");
        assert!(pool.probe());
        assert!(pool.get_devices().iter().all(|d| d.health == "Unhealthy"));
        assert!(!pool.probe());
        host.set_oper_state("ens1f0", "up");
        assert!(pool.probe());
        assert!(pool.get_devices().iter().all(|d| d.health == "Healthy"));
    }
}
