//! A Kubernetes [device
//! plugin](https://kubernetes.io/docs/concepts/extend-kubernetes/compute-storage-net/device-plugins/)
//! advertising SR-IOV network functions, auxiliary sub-functions and accelerators.
//!
//! Devices are discovered through a [`host::Host`], grouped into resource pools by the selectors
//! of the resource configuration, and each pool is served to the kubelet by its own
//! [`resources::ResourceServer`]. The [`manager::ResourceManager`] drives the whole startup.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use sriov_dp::{host::SysfsHost, manager::ResourceManager, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut manager = ResourceManager::new(Arc::new(SysfsHost::default()), Config::default());
//!     manager.run().await?;
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop_all_servers().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod cdi;
pub mod config;
pub mod device_info;
pub mod device_provider;
pub mod devices;
pub mod factory;
pub mod grpc_sock;
pub mod host;
pub mod info_provider;
pub mod manager;
pub mod resource_config;
pub mod resources;
pub mod selectors;

#[doc(inline)]
pub use config::Config;

/// The Kubernetes device plugin API, served to the kubelet.
pub mod device_plugin_api {
    /// Version `v1beta1` of the API
    #[allow(missing_docs)]
    pub mod v1beta1 {
        /// Version announced when registering
        pub const API_VERSION: &str = "v1beta1";
        tonic::include_proto!("v1beta1");
    }
}

/// The kubelet plugin watcher registration API.
pub mod plugin_registration_api {
    /// Version `v1` of the API
    #[allow(missing_docs)]
    pub mod v1 {
        tonic::include_proto!("pluginregistration");
    }
}
