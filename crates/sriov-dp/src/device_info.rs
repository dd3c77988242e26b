//! Device-info files telling CNI plugins which device was handed to a pod.
//!
//! One file per allocated device is written to
//! `<device_info_dir>/<prefix>-<name>-<device id>-device.json`, following version 1.1.0 of the
//! network attachment device-info format.
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::devices::{DeviceKind, HostDevice};
use crate::resources::ResourcePool;

const DEVICE_INFO_VERSION: &str = "1.1.0";

/// The content of a device-info file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// `pci`, `vdpa` or `auxiliary`
    #[serde(rename = "type")]
    pub kind: String,
    /// Format version
    pub version: String,
    /// PCI details, for plain PCI functions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci: Option<PciInfo>,
    /// vDPA details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdpa: Option<VdpaInfo>,
    /// Auxiliary device details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary: Option<AuxInfo>,
}

/// PCI details of a device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PciInfo {
    /// Address of the function
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pci_address: String,
    /// Address of its physical function
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pf_pci_address: String,
    /// RDMA device created by the function
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rdma_device: String,
}

/// vDPA details of a device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VdpaInfo {
    /// Name of the vDPA device
    pub parent_device: String,
    /// `vhost` or `virtio`
    pub driver: String,
    /// Character device of a vhost vDPA device
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Address of the backing function
    pub pci_address: String,
    /// Address of its physical function
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pf_pci_address: String,
}

/// Auxiliary device details.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuxInfo {
    /// RDMA device created by the auxiliary device
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rdma_device: String,
}

impl DeviceInfo {
    /// Describes a network device. Accelerators have no device info.
    pub fn for_device(device: &HostDevice) -> Option<Self> {
        let (kind, pci, vdpa, auxiliary) = match device.kind() {
            DeviceKind::Accelerator => return None,
            DeviceKind::Net(net) => match &net.vdpa {
                Some(v) => (
                    "vdpa",
                    None,
                    Some(VdpaInfo {
                        parent_device: v.name.clone(),
                        driver: v.vdpa_type.clone(),
                        path: v.path.clone().unwrap_or_default(),
                        pci_address: device.pci_addr().to_owned(),
                        pf_pci_address: net.pf_addr.clone(),
                    }),
                    None,
                ),
                None => (
                    "pci",
                    Some(PciInfo {
                        pci_address: device.pci_addr().to_owned(),
                        pf_pci_address: net.pf_addr.clone(),
                        rdma_device: net.rdma.rdma_device().unwrap_or_default().to_owned(),
                    }),
                    None,
                    None,
                ),
            },
            DeviceKind::AuxNet(aux) => (
                "auxiliary",
                None,
                None,
                Some(AuxInfo {
                    rdma_device: aux.net.rdma.rdma_device().unwrap_or_default().to_owned(),
                }),
            ),
        };
        Some(DeviceInfo {
            kind: kind.to_owned(),
            version: DEVICE_INFO_VERSION.to_owned(),
            pci,
            vdpa,
            auxiliary,
        })
    }
}

/// Path of the device-info file of `device_id` in resource `full_name`.
pub fn file_path(dir: &Path, full_name: &str, device_id: &str) -> PathBuf {
    dir.join(format!(
        "{}-{}-device.json",
        full_name.replace('/', "-"),
        device_id
    ))
}

/// Writes the device-info files of the given pool members.
pub async fn save(dir: &Path, pool: &ResourcePool, ids: &[String]) -> anyhow::Result<()> {
    let full_name = pool.full_name();
    let mut created_dir = false;
    for id in ids {
        let info = match pool.device_pool().get(id).and_then(DeviceInfo::for_device) {
            Some(info) => info,
            None => continue,
        };
        if !created_dir {
            tokio::fs::create_dir_all(dir).await?;
            created_dir = true;
        }
        let path = file_path(dir, &full_name, id);
        tokio::fs::write(&path, serde_json::to_vec(&info)?).await?;
        debug!(device = %id, path = ?path, "Wrote device info");
    }
    Ok(())
}

/// Removes the device-info files of every pool member.
pub async fn clean(dir: &Path, pool: &ResourcePool) {
    let full_name = pool.full_name();
    for id in pool.device_pool().keys() {
        let path = file_path(dir, &full_name, id);
        match tokio::fs::remove_file(&path).await {
            Ok(_) => (),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => warn!(path = ?path, error = %e, "Unable to remove device info"),
        }
    }
}
