use super::{AdditionalInfo, DeviceInfoProvider};
use crate::device_plugin_api::v1beta1::DeviceSpec;

/// Passes the `additionalInfo` configured for a device through to its environment.
#[derive(Clone, Debug)]
pub struct ExtraInfoProvider {
    info: AdditionalInfo,
}

impl ExtraInfoProvider {
    /// Returns a provider echoing `info`.
    pub fn new(info: AdditionalInfo) -> Self {
        ExtraInfoProvider { info }
    }
}

impl DeviceInfoProvider for ExtraInfoProvider {
    fn name(&self) -> &'static str {
        "extra"
    }

    fn device_specs(&self) -> Vec<DeviceSpec> {
        Vec::new()
    }

    fn env_val(&self) -> AdditionalInfo {
        self.info.clone()
    }
}
