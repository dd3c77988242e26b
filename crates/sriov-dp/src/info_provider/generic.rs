use super::{AdditionalInfo, DeviceInfoProvider};
use crate::device_plugin_api::v1beta1::DeviceSpec;

/// Used for devices that need no device node, such as kernel netdevs. Also describes auxiliary
/// devices, whose ID is the auxiliary device name.
#[derive(Clone, Debug)]
pub struct GenericInfoProvider {
    device_id: String,
}

impl GenericInfoProvider {
    /// Returns a provider for the given PCI address or auxiliary device name.
    pub fn new(device_id: &str) -> Self {
        GenericInfoProvider {
            device_id: device_id.to_owned(),
        }
    }
}

impl DeviceInfoProvider for GenericInfoProvider {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn device_specs(&self) -> Vec<DeviceSpec> {
        Vec::new()
    }

    fn env_val(&self) -> AdditionalInfo {
        let mut env = AdditionalInfo::new();
        env.insert("deviceID".to_owned(), self.device_id.clone());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_env() {
        let provider = GenericInfoProvider::new("mlx5_core.sf.4");
        assert!(provider.device_specs().is_empty());
        assert!(provider.mounts().is_empty());
        assert_eq!(provider.env_val()["deviceID"], "mlx5_core.sf.4");
    }
}
