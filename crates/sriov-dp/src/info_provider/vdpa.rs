use thiserror::Error;
use tracing::error;

use super::{device_spec, AdditionalInfo, DeviceInfoProvider, MKNOD_READ_WRITE};
use crate::device_plugin_api::v1beta1::DeviceSpec;
use crate::host::VdpaDevice;
use crate::resource_config::VDPA_VHOST_TYPE;

/// Reasons a vDPA device cannot be handed to a container.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VdpaError {
    /// The function has no vDPA device on top of it
    #[error("no vDPA device found")]
    Missing,
    /// The vDPA device is bound to another bus driver than configured
    #[error("vDPA device {name} is of type {actual}, expected {configured}")]
    TypeMismatch {
        /// Name of the vDPA device
        name: String,
        /// The type asked for by the resource
        configured: String,
        /// The type of the device on the host
        actual: String,
    },
    /// A vhost vDPA device without a character device
    #[error("vhost vDPA device {0} has no character device")]
    NoCharDevice(String),
}

/// Exposes the vhost-vdpa character device of a vDPA device. virtio vDPA devices are consumed
/// through a kernel netdev and expose nothing.
#[derive(Clone, Debug)]
pub struct VdpaInfoProvider {
    configured_type: String,
    device: Option<VdpaDevice>,
}

impl VdpaInfoProvider {
    /// Returns a provider checking `device` against the type configured for the resource.
    pub fn new(configured_type: &str, device: Option<VdpaDevice>) -> Self {
        VdpaInfoProvider {
            configured_type: configured_type.to_owned(),
            device,
        }
    }

    /// Path of the character device to expose, `None` for a virtio vDPA device.
    pub fn vhost_path(&self) -> Result<Option<&str>, VdpaError> {
        let device = self.device.as_ref().ok_or(VdpaError::Missing)?;
        if device.vdpa_type != self.configured_type {
            return Err(VdpaError::TypeMismatch {
                name: device.name.clone(),
                configured: self.configured_type.clone(),
                actual: device.vdpa_type.clone(),
            });
        }
        if device.vdpa_type != VDPA_VHOST_TYPE {
            return Ok(None);
        }
        device
            .path
            .as_deref()
            .map(Some)
            .ok_or_else(|| VdpaError::NoCharDevice(device.name.clone()))
    }
}

impl DeviceInfoProvider for VdpaInfoProvider {
    fn name(&self) -> &'static str {
        "vdpa"
    }

    fn device_specs(&self) -> Vec<DeviceSpec> {
        match self.vhost_path() {
            Ok(Some(path)) => vec![device_spec(path, MKNOD_READ_WRITE)],
            Ok(None) => Vec::new(),
            Err(e) => {
                error!(error = %e, "Unable to expose vDPA device");
                Vec::new()
            }
        }
    }

    fn env_val(&self) -> AdditionalInfo {
        let mut env = AdditionalInfo::new();
        if let Ok(Some(path)) = self.vhost_path() {
            env.insert("mount".to_owned(), path.to_owned());
        }
        env
    }
}
