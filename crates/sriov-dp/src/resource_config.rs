//! The JSON resource pool configuration.
//!
//! ```json
//! {
//!   "resourceList": [{
//!     "resourceName": "intel_sriov_netdevice",
//!     "selectors": {"vendors": ["8086"], "drivers": ["iavf"], "pfNames": ["ens2f0#0-3"]}
//!   }]
//! }
//! ```
//!
//! `selectors` may be a single object or an array of objects. Each object is evaluated on its own
//! and the results are merged into the same pool.
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::info_provider::AdditionalInfo;

/// Allocation policy name enabling the packed allocator
pub const PACKED_ALLOCATE_POLICY: &str = "packed";

/// vDPA device driven by the virtio vDPA bus driver
pub const VDPA_VIRTIO_TYPE: &str = "virtio";
/// vDPA device driven by the vhost vDPA bus driver
pub const VDPA_VHOST_TYPE: &str = "vhost";

/// Errors raised while reading the resource configuration. All of them are fatal to the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document is not valid JSON or does not follow the expected layout
    #[error("malformed resource configuration: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A resource asked for a device type that no provider handles
    #[error("resource {resource} has unsupported deviceType {device_type:?}")]
    UnknownDeviceType {
        /// Name of the offending resource
        resource: String,
        /// The device type found in the file
        device_type: String,
    },
    /// A resource did not carry any selectors
    #[error("resource {0} has no selectors")]
    MissingSelectors(String),
    /// The selectors do not match the schema of the resource's device type
    #[error("resource {resource} has invalid selectors: {source}")]
    InvalidSelectors {
        /// Name of the offending resource
        resource: String,
        /// The underlying deserialization error
        source: serde_json::Error,
    },
    /// The file does not configure any resource
    #[error("no resources configured")]
    Empty,
    /// A resource name holds characters other than alphanumerics and underscores, or does not
    /// make a valid extended resource name once prefixed
    #[error("invalid resource name {0:?}")]
    InvalidName(String),
    /// Two resources share the same prefix and name
    #[error("resource {0} is configured more than once")]
    Duplicate(String),
    /// The device type specific checks failed
    #[error(transparent)]
    Provider(#[from] crate::device_provider::ProviderError),
}

/// The kinds of device a resource pool can be made of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// SR-IOV network virtual functions (and PFs without VFs)
    NetDevice,
    /// Processing accelerators such as crypto/compression VFs
    Accelerator,
    /// Auxiliary network devices, i.e. sub-functions, carved out of a PCI device
    AuxNetDevice,
}

impl DeviceType {
    /// Every supported device type, one provider is built for each.
    pub const ALL: [DeviceType; 3] = [
        DeviceType::NetDevice,
        DeviceType::Accelerator,
        DeviceType::AuxNetDevice,
    ];

    /// The name used for this device type in the configuration file.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::NetDevice => "netDevice",
            DeviceType::Accelerator => "accelerator",
            DeviceType::AuxNetDevice => "auxNetDevice",
        }
    }

    fn parse(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("") | Some("netDevice") | Some("netdevice") => Some(DeviceType::NetDevice),
            Some("accelerator") => Some(DeviceType::Accelerator),
            Some("auxNetDevice") => Some(DeviceType::AuxNetDevice),
            Some(_) => None,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Criteria shared by every device type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSelectors {
    /// PCI vendor IDs, e.g. `8086`
    pub vendors: Vec<String>,
    /// PCI device IDs, e.g. `154c`
    pub devices: Vec<String>,
    /// Bound driver names
    pub drivers: Vec<String>,
    /// PCI addresses. For auxiliary devices this is the parent address
    pub pci_addresses: Vec<String>,
}

/// Criteria shared by the network device types.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenericNetDeviceSelectors {
    /// Common PCI criteria
    #[serde(flatten)]
    pub device: DeviceSelectors,
    /// PF netdev names, optionally followed by `#<ranges>` of VF indexes
    pub pf_names: Vec<String>,
    /// PF PCI addresses, optionally followed by `#<ranges>` of VF indexes
    pub root_devices: Vec<String>,
    /// Link types such as `ether` or `infiniband`
    pub link_types: Vec<String>,
    /// Only keep RDMA capable devices and expose their RDMA character devices
    pub is_rdma: bool,
}

/// Selectors of a `netDevice` resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetDeviceSelectors {
    /// Criteria shared with auxiliary devices
    #[serde(flatten)]
    pub generic: GenericNetDeviceSelectors,
    /// DDP profile names
    pub ddp_profiles: Vec<String>,
    /// Also mount `/dev/vhost-net` and `/dev/net/tun`
    pub need_vhost_net: bool,
    /// `virtio` or `vhost`. Empty disables vDPA filtering
    pub vdpa_type: String,
    /// InfiniBand partition keys
    pub p_keys: Vec<String>,
}

/// Selectors of an `accelerator` resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccelDeviceSelectors {
    /// Common PCI criteria
    #[serde(flatten)]
    pub device: DeviceSelectors,
}

/// Selectors of an `auxNetDevice` resource.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuxNetDeviceSelectors {
    /// Criteria shared with net devices
    #[serde(flatten)]
    pub generic: GenericNetDeviceSelectors,
    /// Auxiliary device types. Only `sf` is supported
    pub aux_types: Vec<String>,
}

/// One selector object of a resource, typed after the resource's device type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectorSet {
    /// Selectors of a `netDevice` resource
    Net(NetDeviceSelectors),
    /// Selectors of an `accelerator` resource
    Accelerator(AccelDeviceSelectors),
    /// Selectors of an `auxNetDevice` resource
    AuxNet(AuxNetDeviceSelectors),
}

impl SelectorSet {
    /// The PCI criteria every selector set carries.
    pub fn device(&self) -> &DeviceSelectors {
        match self {
            SelectorSet::Net(s) => &s.generic.device,
            SelectorSet::Accelerator(s) => &s.device,
            SelectorSet::AuxNet(s) => &s.generic.device,
        }
    }

    /// The network criteria, absent for accelerators.
    pub fn generic_net(&self) -> Option<&GenericNetDeviceSelectors> {
        match self {
            SelectorSet::Net(s) => Some(&s.generic),
            SelectorSet::Accelerator(_) => None,
            SelectorSet::AuxNet(s) => Some(&s.generic),
        }
    }
}

/// A single entry of `resourceList`. One entry yields at most one resource pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Name of the resource, without prefix
    pub resource_name: String,
    /// Prefix overriding the process wide `--resource-prefix`
    pub resource_prefix: Option<String>,
    /// Kind of device this resource is made of
    pub device_type: DeviceType,
    /// Do not report NUMA topology for the devices of this pool
    pub exclude_topology: bool,
    /// Name of the preferred allocation policy, empty when none
    pub allocate_policy: String,
    /// Extra environment info per device ID, `*` applying to every device
    pub additional_info: HashMap<String, AdditionalInfo>,
    /// Alternative selector objects, evaluated one at a time
    pub selectors: Vec<SelectorSet>,
}

impl ResourceConfig {
    /// The selector object at `index`, if the resource declares that many.
    pub fn selector(&self, index: usize) -> Option<&SelectorSet> {
        self.selectors.get(index)
    }

    /// The extra info configured for a device, falling back to the `*` entry.
    pub fn additional_info_for(&self, device_id: &str) -> Option<&AdditionalInfo> {
        self.additional_info
            .get(device_id)
            .or_else(|| self.additional_info.get("*"))
    }

    fn from_raw(raw: RawResourceConfig) -> Result<Self, ConfigError> {
        let device_type = DeviceType::parse(raw.device_type.as_deref()).ok_or_else(|| {
            ConfigError::UnknownDeviceType {
                resource: raw.resource_name.clone(),
                device_type: raw.device_type.clone().unwrap_or_default(),
            }
        })?;

        let values = match raw.selectors {
            None | Some(serde_json::Value::Null) => {
                return Err(ConfigError::MissingSelectors(raw.resource_name))
            }
            Some(serde_json::Value::Array(values)) => values,
            Some(value) => vec![value],
        };

        let selectors = values
            .into_iter()
            .map(|value| parse_selector_set(device_type, value))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConfigError::InvalidSelectors {
                resource: raw.resource_name.clone(),
                source,
            })?;

        Ok(ResourceConfig {
            resource_name: raw.resource_name,
            resource_prefix: raw.resource_prefix.filter(|p| !p.is_empty()),
            device_type,
            exclude_topology: raw.exclude_topology,
            allocate_policy: raw.allocate_policy,
            additional_info: raw.additional_info,
            selectors,
        })
    }
}

#[cfg(test)]
impl ResourceConfig {
    /// Parses a single `resourceList` entry.
    pub(crate) fn from_test_json(json: &str) -> Self {
        let doc = format!(r#"{{"resourceList": [{}]}}"#, json);
        ResourceConfigList::from_json(doc.as_bytes())
            .expect("valid resource config")
            .resource_list
            .remove(0)
    }
}

fn parse_selector_set(
    device_type: DeviceType,
    value: serde_json::Value,
) -> Result<SelectorSet, serde_json::Error> {
    Ok(match device_type {
        DeviceType::NetDevice => SelectorSet::Net(serde_json::from_value(value)?),
        DeviceType::Accelerator => SelectorSet::Accelerator(serde_json::from_value(value)?),
        DeviceType::AuxNetDevice => SelectorSet::AuxNet(serde_json::from_value(value)?),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResourceConfig {
    resource_name: String,
    #[serde(default)]
    resource_prefix: Option<String>,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    exclude_topology: bool,
    #[serde(default)]
    allocate_policy: String,
    #[serde(default)]
    additional_info: HashMap<String, AdditionalInfo>,
    #[serde(default)]
    selectors: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResourceConfigList {
    #[serde(default)]
    resource_list: Vec<RawResourceConfig>,
}

/// The parsed content of the configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceConfigList {
    /// Every configured resource, in file order
    pub resource_list: Vec<ResourceConfig>,
}

impl ResourceConfigList {
    /// Parses a configuration document.
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let raw: RawResourceConfigList = serde_json::from_slice(data)?;
        let resource_list = raw
            .resource_list
            .into_iter()
            .map(ResourceConfig::from_raw)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResourceConfigList { resource_list })
    }
}
