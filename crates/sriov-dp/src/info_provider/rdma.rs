use tracing::error;

use super::{device_spec, AdditionalInfo, DeviceInfoProvider, READ_WRITE};
use crate::device_plugin_api::v1beta1::DeviceSpec;
use crate::host::Host;

/// The RDMA side of a device: the RDMA device it created and the character devices giving
/// access to it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RdmaSpec {
    rdma_device: Option<String>,
    char_devices: Vec<String>,
}

impl RdmaSpec {
    /// Looks up the RDMA device created by a PCI function or auxiliary device.
    pub fn new(host: &dyn Host, device_id: &str) -> Self {
        match host.rdma_devices(device_id).into_iter().next() {
            Some(rdma_device) => RdmaSpec {
                char_devices: host.rdma_char_devices(&rdma_device),
                rdma_device: Some(rdma_device),
            },
            None => RdmaSpec::default(),
        }
    }

    /// True when the device created an RDMA device.
    pub fn is_rdma(&self) -> bool {
        self.rdma_device.is_some()
    }

    /// Name of the RDMA device, e.g. `mlx5_3`.
    pub fn rdma_device(&self) -> Option<&str> {
        self.rdma_device.as_deref()
    }

    /// Character devices under `/dev/infiniband` backing the RDMA device.
    pub fn char_devices(&self) -> &[String] {
        &self.char_devices
    }

    /// One read-write spec per character device.
    pub fn device_specs(&self) -> Vec<DeviceSpec> {
        self.char_devices
            .iter()
            .map(|path| device_spec(path, READ_WRITE))
            .collect()
    }
}

/// Exposes the RDMA character devices of an RDMA capable device.
#[derive(Clone, Debug)]
pub struct RdmaInfoProvider {
    spec: RdmaSpec,
}

impl RdmaInfoProvider {
    /// Returns a provider over an already resolved RDMA spec.
    pub fn new(spec: RdmaSpec) -> Self {
        RdmaInfoProvider { spec }
    }
}

impl DeviceInfoProvider for RdmaInfoProvider {
    fn name(&self) -> &'static str {
        "rdma"
    }

    /// Empty unless the device is RDMA capable. Access is never granted to the character devices
    /// of some other device.
    fn device_specs(&self) -> Vec<DeviceSpec> {
        if !self.spec.is_rdma() {
            error!("RDMA requested for a device without RDMA resources");
            return Vec::new();
        }
        self.spec.device_specs()
    }

    fn env_val(&self) -> AdditionalInfo {
        let mut env = AdditionalInfo::new();
        for path in self.spec.char_devices() {
            let key = match char_device_kind(path) {
                Some(kind) => kind,
                None => continue,
            };
            env.insert(key.to_owned(), path.clone());
        }
        env
    }
}

fn char_device_kind(path: &str) -> Option<&'static str> {
    let name = path.rsplit('/').next()?;
    if name == "rdma_cm" {
        Some("rdma_cm")
    } else if name.starts_with("uverbs") {
        Some("uverbs")
    } else if name.starts_with("umad") {
        Some("umad")
    } else if name.starts_with("issm") {
        Some("issm")
    } else {
        None
    }
}
