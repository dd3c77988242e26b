//! Configuration for the device plugin process
//!
//! The best way to configure the plugin is by using [`Config::default_config`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].
//! The resource pools themselves are described by the JSON file at
//! [`Config::config_file`], see [`crate::resource_config`].

use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

const DEFAULT_CONFIG_FILE: &str = "/etc/pcidp/config.json";
const DEFAULT_RESOURCE_PREFIX: &str = "intel.com";
const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins/";
const DEFAULT_PLUGIN_REGISTRY_DIR: &str = "/var/lib/kubelet/plugins_registry/";
const DEFAULT_CDI_SPEC_DIR: &str = "/var/run/cdi";
const DEFAULT_DEVICE_INFO_DIR: &str = "/var/run/k8s.cni.cncf.io/devinfo/dp";
const DEFAULT_HEALTH_CHECK_SECS: u64 = 20;
const DEFAULT_SOCKET_WATCH_SECS: u64 = 5;

/// The configuration needed for the device plugin to run properly.
///
/// This can be configured manually in your code or if you are exposing a CLI, use the
/// [`Config::new_from_flags`] (this requires the "cli" feature to be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// JSON file describing the resource pools
    pub config_file: PathBuf,
    /// Prefix used for every resource that does not override it
    pub resource_prefix: String,
    /// Hand devices to containers through CDI annotations instead of device specs
    pub use_cdi: bool,
    /// Directory holding `kubelet.sock` and, in the legacy registration mode, our sockets
    pub device_plugin_dir: PathBuf,
    /// Directory watched by the kubelet plugin watcher. Its presence selects plugin watcher mode
    pub plugin_registry_dir: PathBuf,
    /// Directory CDI specs are written to
    pub cdi_spec_dir: PathBuf,
    /// Directory device-info files for CNI plugins are written to
    pub device_info_dir: PathBuf,
    /// Time between two health probes of a resource pool
    pub health_check_interval: Duration,
    /// Time between two checks for the server socket in legacy registration mode
    pub socket_watch_interval: Duration,
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config() -> Self {
        Config {
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            resource_prefix: DEFAULT_RESOURCE_PREFIX.to_owned(),
            use_cdi: false,
            device_plugin_dir: PathBuf::from(DEFAULT_DEVICE_PLUGIN_DIR),
            plugin_registry_dir: PathBuf::from(DEFAULT_PLUGIN_REGISTRY_DIR),
            cdi_spec_dir: PathBuf::from(DEFAULT_CDI_SPEC_DIR),
            device_info_dir: PathBuf::from(DEFAULT_DEVICE_INFO_DIR),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_SECS),
            socket_watch_interval: Duration::from_secs(DEFAULT_SOCKET_WATCH_SECS),
        }
    }

    /// Returns true when the kubelet plugin watcher is expected to discover our sockets.
    pub fn plugin_watch_mode(&self) -> bool {
        self.plugin_registry_dir.is_dir()
    }

    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Config::from(opts)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(any(feature = "cli", feature = "docs"))]
impl From<Opts> for Config {
    fn from(opts: Opts) -> Self {
        Config {
            config_file: opts.config_file,
            resource_prefix: opts.resource_prefix,
            use_cdi: opts.use_cdi,
            device_plugin_dir: opts.device_plugin_dir,
            plugin_registry_dir: opts.plugin_registry_dir,
            cdi_spec_dir: opts.cdi_spec_dir,
            device_info_dir: opts.device_info_dir,
            health_check_interval: Duration::from_secs(opts.health_check_interval),
            socket_watch_interval: Duration::from_secs(opts.socket_watch_interval),
        }
    }
}

/// CLI options that can be configured for the device plugin
///
/// These can be parsed from args using `Opts::into_app()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "sriovdp",
    about = "A Kubernetes device plugin for SR-IOV network and accelerator devices"
)]
pub struct Opts {
    #[structopt(
        long = "config-file",
        env = "SRIOVDP_CONFIG_FILE",
        default_value = DEFAULT_CONFIG_FILE,
        help = "JSON device pool config file location"
    )]
    config_file: PathBuf,

    #[structopt(
        long = "resource-prefix",
        env = "SRIOVDP_RESOURCE_PREFIX",
        default_value = DEFAULT_RESOURCE_PREFIX,
        help = "Resource name prefix used for resources that do not set their own"
    )]
    resource_prefix: String,

    #[structopt(
        long = "use-cdi",
        help = "Use Container Device Interface to expose devices in containers"
    )]
    use_cdi: bool,

    #[structopt(
        long = "device-plugin-dir",
        env = "SRIOVDP_DEVICE_PLUGIN_DIR",
        default_value = DEFAULT_DEVICE_PLUGIN_DIR,
        help = "The kubelet device plugin directory containing kubelet.sock"
    )]
    device_plugin_dir: PathBuf,

    #[structopt(
        long = "plugin-registry-dir",
        env = "SRIOVDP_PLUGIN_REGISTRY_DIR",
        default_value = DEFAULT_PLUGIN_REGISTRY_DIR,
        help = "The kubelet plugin watcher directory. Plugin watcher registration is used when it exists"
    )]
    plugin_registry_dir: PathBuf,

    #[structopt(
        long = "cdi-spec-dir",
        env = "SRIOVDP_CDI_SPEC_DIR",
        default_value = DEFAULT_CDI_SPEC_DIR,
        help = "Directory CDI specs are written to when --use-cdi is set"
    )]
    cdi_spec_dir: PathBuf,

    #[structopt(
        long = "device-info-dir",
        env = "SRIOVDP_DEVICE_INFO_DIR",
        default_value = DEFAULT_DEVICE_INFO_DIR,
        help = "Directory device-info files for CNI plugins are written to"
    )]
    device_info_dir: PathBuf,

    #[structopt(
        long = "health-check-interval",
        env = "SRIOVDP_HEALTH_CHECK_INTERVAL",
        default_value = "20",
        help = "Seconds between two device health probes"
    )]
    health_check_interval: u64,

    #[structopt(
        long = "socket-watch-interval",
        env = "SRIOVDP_SOCKET_WATCH_INTERVAL",
        default_value = "5",
        help = "Seconds between two checks for a removed server socket"
    )]
    socket_watch_interval: u64,
}
