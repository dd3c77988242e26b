//! Discovery per device type.
//!
//! A [`DeviceProvider`] first retains the candidate PCI functions of its class out of the host
//! enumeration ([`DeviceProvider::add_target_devices`]), then builds typed devices from them for
//! one selector object of a resource ([`DeviceProvider::get_devices`]) and finally runs them
//! through that selector object ([`DeviceProvider::get_filtered_devices`]).
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::devices::HostDevice;
use crate::host::{Host, PciDevice};
use crate::resource_config::{DeviceType, ResourceConfig, SelectorSet};

mod accelerator;
mod aux_net;
mod net;

pub use accelerator::AccelDeviceProvider;
pub use aux_net::AuxNetDeviceProvider;
pub use net::NetDeviceProvider;

/// PCI base class of network controllers
pub const NET_CLASS: u8 = 0x02;
/// PCI base class of processing accelerators
pub const ACCELERATOR_CLASS: u8 = 0x12;

/// Errors raised by device providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The resource does not declare a selector object at that index
    #[error("resource {resource} has no selectors at index {index}")]
    NoSelectors {
        /// Name of the resource
        resource: String,
        /// The requested index
        index: usize,
    },
    /// The resource configuration is not usable with this device type
    #[error("invalid configuration for resource {resource}: {reason}")]
    InvalidConfig {
        /// Name of the resource
        resource: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ProviderError {
    pub(crate) fn invalid(rc: &ResourceConfig, reason: impl Into<String>) -> Self {
        ProviderError::InvalidConfig {
            resource: rc.resource_name.clone(),
            reason: reason.into(),
        }
    }
}

/// Discovery and filtering of one device type.
pub trait DeviceProvider: Send + Sync {
    /// The device type handled by the provider.
    fn device_type(&self) -> DeviceType;

    /// The PCI class code candidates are taken from.
    fn class_code(&self) -> u8;

    /// Retains the candidates of class `class_code` out of the host enumeration. Functions in use
    /// by the host are left out.
    fn add_target_devices(&mut self, devices: &[PciDevice], class_code: u8);

    /// The retained candidates.
    fn discovered_devices(&self) -> &[PciDevice];

    /// Builds the typed devices of the candidates for the selector object at `selector_index`.
    /// Candidates that cannot be built are logged and skipped.
    fn get_devices(&self, rc: &ResourceConfig, selector_index: usize) -> Vec<HostDevice>;

    /// Keeps the devices matched by the selector object at `selector_index`.
    fn get_filtered_devices(
        &self,
        devices: Vec<HostDevice>,
        rc: &ResourceConfig,
        selector_index: usize,
    ) -> Result<Vec<HostDevice>, ProviderError>;

    /// Checks the parts of a resource configuration specific to the device type.
    fn valid_config(&self, rc: &ResourceConfig) -> Result<(), ProviderError>;
}

/// Builds one provider per supported device type.
pub fn providers(host: Arc<dyn Host>) -> Vec<Box<dyn DeviceProvider>> {
    DeviceType::ALL
        .iter()
        .map(|device_type| -> Box<dyn DeviceProvider> {
            match device_type {
                DeviceType::NetDevice => Box::new(NetDeviceProvider::new(host.clone())),
                DeviceType::Accelerator => Box::new(AccelDeviceProvider::new(host.clone())),
                DeviceType::AuxNetDevice => Box::new(AuxNetDeviceProvider::new(host.clone())),
            }
        })
        .collect()
}

/// True when the device's base class is `class_code`. Malformed class IDs are logged and never
/// match.
pub(crate) fn class_matches(device: &PciDevice, class_code: u8) -> bool {
    match u8::from_str_radix(device.class_id.trim_start_matches("0x"), 16) {
        Ok(class) => class == class_code,
        Err(e) => {
            warn!(device = %device.address, class = %device.class_id, error = %e, "Unable to parse device class, skipping");
            false
        }
    }
}

pub(crate) fn selector_set<'a>(
    rc: &'a ResourceConfig,
    index: usize,
) -> Result<&'a SelectorSet, ProviderError> {
    rc.selector(index).ok_or_else(|| ProviderError::NoSelectors {
        resource: rc.resource_name.clone(),
        index,
    })
}
