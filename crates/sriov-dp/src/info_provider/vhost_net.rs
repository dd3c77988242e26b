use super::{device_spec, AdditionalInfo, DeviceInfoProvider, MKNOD_READ_WRITE};
use crate::device_plugin_api::v1beta1::DeviceSpec;

const VHOST_NET: &str = "/dev/vhost-net";
const TUN: &str = "/dev/net/tun";

/// Adds the vhost-net and tun devices for userspace datapaths backed by a kernel vhost.
#[derive(Clone, Copy, Debug, Default)]
pub struct VhostNetInfoProvider;

impl VhostNetInfoProvider {
    /// Returns the provider. Whether the nodes exist on the host is checked during filtering.
    pub fn new() -> Self {
        VhostNetInfoProvider
    }
}

impl DeviceInfoProvider for VhostNetInfoProvider {
    fn name(&self) -> &'static str {
        "vhost"
    }

    fn device_specs(&self) -> Vec<DeviceSpec> {
        vec![
            device_spec(VHOST_NET, MKNOD_READ_WRITE),
            device_spec(TUN, MKNOD_READ_WRITE),
        ]
    }

    fn env_val(&self) -> AdditionalInfo {
        let mut env = AdditionalInfo::new();
        env.insert("net-mount".to_owned(), VHOST_NET.to_owned());
        env.insert("tun-mount".to_owned(), TUN.to_owned());
        env
    }
}
