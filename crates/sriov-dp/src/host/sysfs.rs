use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, trace};

use super::{Host, HostError, PciDevice, VdpaDevice};
use crate::resource_config::{VDPA_VHOST_TYPE, VDPA_VIRTIO_TYPE};

const PCI_DEVICES: &str = "bus/pci/devices";
const AUX_DEVICES: &str = "bus/auxiliary/devices";
const VDPA_DEVICES: &str = "bus/vdpa/devices";
const NET_CLASS: &str = "class/net";
const INFINIBAND_CLASS: &str = "class/infiniband";
const RDMA_CHAR_CLASSES: [&str; 2] = ["class/infiniband_verbs", "class/infiniband_mad"];
const VHOST_VDPA_PREFIX: &str = "vhost-vdpa-";
const VIRTFN_PREFIX: &str = "virtfn";
/// Destination and mask of a default route in `/proc/net/route`
const DEFAULT_ROUTE: &str = "00000000";
const ARPHRD_ETHER: &str = "1";
const ARPHRD_INFINIBAND: &str = "32";

/// A [`Host`] reading sysfs, `/dev` and the kernel routing table.
///
/// The roots are configurable so a fake tree can be used in tests.
#[derive(Clone, Debug)]
pub struct SysfsHost {
    sys_root: PathBuf,
    dev_root: PathBuf,
    route_table: PathBuf,
}

impl Default for SysfsHost {
    fn default() -> Self {
        SysfsHost::new("/sys", "/dev", "/proc/net/route")
    }
}

impl SysfsHost {
    /// Returns a host reading the given sysfs root, device root and IPv4 routing table.
    pub fn new(
        sys_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        route_table: impl Into<PathBuf>,
    ) -> Self {
        SysfsHost {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            route_table: route_table.into(),
        }
    }

    fn pci_path(&self, pci_addr: &str) -> PathBuf {
        self.sys_root.join(PCI_DEVICES).join(pci_addr)
    }

    /// Resolves PCI addresses and auxiliary device names alike.
    fn device_path(&self, device_id: &str) -> PathBuf {
        let pci = self.pci_path(device_id);
        if pci.exists() {
            pci
        } else {
            self.sys_root.join(AUX_DEVICES).join(device_id)
        }
    }

    fn net_path(&self, ifname: &str) -> PathBuf {
        self.sys_root.join(NET_CLASS).join(ifname)
    }

    fn dev_node(&self, name: &str) -> String {
        self.dev_root.join(name).to_string_lossy().into_owned()
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_owned())
}

fn link_target_name(path: &Path) -> Option<String> {
    fs::read_link(path)
        .ok()?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Sorted entry names of a directory, empty when it cannot be read.
fn dir_entries(path: &Path) -> Vec<String> {
    let mut entries: Vec<String> = fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    entries.sort();
    entries
}

fn strip_hex(value: &str) -> String {
    value.trim_start_matches("0x").to_lowercase()
}

impl Host for SysfsHost {
    fn pci_devices(&self) -> Result<Vec<PciDevice>, HostError> {
        let dir = self.sys_root.join(PCI_DEVICES);
        let entries = fs::read_dir(&dir).map_err(|source| HostError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| HostError::Io {
                path: dir.clone(),
                source,
            })?;
            let address = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let ids = (
                read_trimmed(&path.join("vendor")),
                read_trimmed(&path.join("device")),
                read_trimmed(&path.join("class")),
            );
            let (vendor, device, class) = match ids {
                (Some(vendor), Some(device), Some(class)) => (vendor, device, class),
                _ => {
                    debug!(device = %address, "Skipping PCI device with unreadable IDs");
                    continue;
                }
            };
            devices.push(PciDevice {
                address,
                vendor: strip_hex(&vendor),
                device: strip_hex(&device),
                class_id: strip_hex(&class).chars().take(2).collect(),
            });
        }
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    fn driver_name(&self, device_id: &str) -> Result<String, HostError> {
        let path = self.device_path(device_id);
        if !path.exists() {
            return Err(HostError::NotFound(device_id.to_owned()));
        }
        link_target_name(&path.join("driver"))
            .ok_or_else(|| HostError::NoDriver(device_id.to_owned()))
    }

    fn numa_node(&self, pci_addr: &str) -> Option<i64> {
        read_trimmed(&self.pci_path(pci_addr).join("numa_node"))?
            .parse()
            .ok()
    }

    fn net_names(&self, device_id: &str) -> Vec<String> {
        dir_entries(&self.device_path(device_id).join("net"))
    }

    fn is_sriov_pf(&self, pci_addr: &str) -> bool {
        read_trimmed(&self.pci_path(pci_addr).join("sriov_totalvfs"))
            .and_then(|n| n.parse::<u32>().ok())
            .map_or(false, |n| n > 0)
    }

    fn sriov_configured(&self, pci_addr: &str) -> bool {
        read_trimmed(&self.pci_path(pci_addr).join("sriov_numvfs"))
            .and_then(|n| n.parse::<u32>().ok())
            .map_or(false, |n| n > 0)
    }

    fn has_default_route(&self, pci_addr: &str) -> bool {
        let names = self.net_names(pci_addr);
        if names.is_empty() {
            return false;
        }
        let table = match fs::read_to_string(&self.route_table) {
            Ok(table) => table,
            Err(e) => {
                debug!(error = %e, path = ?self.route_table, "Unable to read routing table");
                return false;
            }
        };
        // Iface Destination Gateway Flags RefCnt Use Metric Mask ...
        table.lines().skip(1).any(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            fields.len() > 7
                && fields[1] == DEFAULT_ROUTE
                && fields[7] == DEFAULT_ROUTE
                && names.iter().any(|n| n == fields[0])
        })
    }

    fn pf_pci_addr(&self, pci_addr: &str) -> Option<String> {
        link_target_name(&self.pci_path(pci_addr).join("physfn"))
    }

    fn vf_index(&self, pci_addr: &str) -> Option<i32> {
        let pf_path = self.pci_path(&self.pf_pci_addr(pci_addr)?);
        dir_entries(&pf_path).iter().find_map(|entry| {
            let index = entry.strip_prefix(VIRTFN_PREFIX)?.parse::<i32>().ok()?;
            (link_target_name(&pf_path.join(entry))? == pci_addr).then(|| index)
        })
    }

    fn link_type(&self, ifname: &str) -> Option<String> {
        let kind = read_trimmed(&self.net_path(ifname).join("type"))?;
        let name = match kind.as_str() {
            ARPHRD_ETHER => Some("ether"),
            ARPHRD_INFINIBAND => Some("infiniband"),
            _ => None,
        };
        Some(name.map(str::to_owned).unwrap_or(kind))
    }

    fn link_speed(&self, ifname: &str) -> Option<u32> {
        read_trimmed(&self.net_path(ifname).join("speed"))?
            .parse()
            .ok()
    }

    fn oper_state(&self, ifname: &str) -> Option<String> {
        read_trimmed(&self.net_path(ifname).join("operstate"))
    }

    fn iommu_group(&self, pci_addr: &str) -> Option<String> {
        link_target_name(&self.pci_path(pci_addr).join("iommu_group"))
    }

    fn uio_device(&self, pci_addr: &str) -> Option<String> {
        dir_entries(&self.pci_path(pci_addr).join("uio"))
            .into_iter()
            .next()
    }

    fn rdma_devices(&self, device_id: &str) -> Vec<String> {
        dir_entries(&self.device_path(device_id).join("infiniband"))
    }

    fn rdma_char_devices(&self, rdma_device: &str) -> Vec<String> {
        let mut devices = Vec::new();
        let rdma_cm = self.dev_root.join("infiniband/rdma_cm");
        if rdma_cm.exists() {
            devices.push(rdma_cm.to_string_lossy().into_owned());
        }
        for class in RDMA_CHAR_CLASSES.iter() {
            let class_dir = self.sys_root.join(class);
            for entry in dir_entries(&class_dir) {
                if read_trimmed(&class_dir.join(&entry).join("ibdev")).as_deref() == Some(rdma_device)
                {
                    devices.push(self.dev_node(&format!("infiniband/{}", entry)));
                }
            }
        }
        devices
    }

    fn vdpa_device(&self, pci_addr: &str) -> Option<VdpaDevice> {
        let bus = self.sys_root.join(VDPA_DEVICES);
        dir_entries(&bus).into_iter().find_map(|name| {
            let path = bus.join(&name);
            let real = fs::canonicalize(&path).ok()?;
            if !real.components().any(|c| c.as_os_str() == pci_addr) {
                return None;
            }
            let vdpa_type = match link_target_name(&path.join("driver"))?.as_str() {
                "vhost_vdpa" => VDPA_VHOST_TYPE,
                "virtio_vdpa" => VDPA_VIRTIO_TYPE,
                other => {
                    debug!(device = %name, driver = %other, "Unknown vdpa bus driver");
                    return None;
                }
            };
            let char_device = dir_entries(&path)
                .into_iter()
                .find(|e| e.starts_with(VHOST_VDPA_PREFIX))
                .map(|e| self.dev_node(&e));
            Some(VdpaDevice {
                name,
                parent: pci_addr.to_owned(),
                vdpa_type: vdpa_type.to_owned(),
                path: char_device,
            })
        })
    }

    fn aux_devices(&self, pci_addr: &str) -> Vec<String> {
        let aux_bus = self.sys_root.join(AUX_DEVICES);
        dir_entries(&self.pci_path(pci_addr))
            .into_iter()
            .filter(|e| e.split('.').count() == 3 && aux_bus.join(e).exists())
            .collect()
    }

    fn sf_index(&self, aux_device: &str) -> Option<i32> {
        read_trimmed(&self.sys_root.join(AUX_DEVICES).join(aux_device).join("sfnum"))?
            .parse()
            .ok()
    }

    fn pkey(&self, device_id: &str) -> Option<String> {
        let rdma = self.rdma_devices(device_id).into_iter().next()?;
        read_trimmed(
            &self
                .sys_root
                .join(INFINIBAND_CLASS)
                .join(rdma)
                .join("ports/1/pkeys/0"),
        )
    }

    fn ddp_profile(&self, pci_addr: &str) -> Option<String> {
        let handle = format!("pci/{}", pci_addr);
        let output = match Command::new("devlink")
            .args(&["-j", "dev", "info", handle.as_str()])
            .output()
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                trace!(device = %pci_addr, status = %output.status, "devlink dev info failed");
                return None;
            }
            Err(e) => {
                trace!(device = %pci_addr, error = %e, "Unable to run devlink");
                return None;
            }
        };
        let info: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        info.get("info")?
            .get(&handle)?
            .get("versions")?
            .get("running")?
            .get("fw.app.name")?
            .as_str()
            .map(str::to_owned)
    }

    fn vhost_net_available(&self) -> bool {
        self.dev_root.join("vhost-net").exists() && self.dev_root.join("net/tun").exists()
    }
}
