//! Container Device Interface specs.
//!
//! With `--use-cdi` every pool writes a spec of kind `<prefix>/<name>` holding one CDI device per
//! member, and `Allocate` answers with a CDI annotation naming the allocated devices instead of
//! device nodes.
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resources::ResourcePool;

/// CDI specification version written
pub const CDI_VERSION: &str = "0.5.0";
/// Prefix of every spec file and annotation owned by the device plugin
pub const SPEC_PREFIX: &str = "sriov-dp";
const ANNOTATION_PREFIX: &str = "cdi.k8s.io/";

/// Errors writing a CDI spec.
#[derive(Error, Debug)]
pub enum CdiError {
    /// The spec could not be encoded
    #[error("unable to encode CDI spec: {0}")]
    Encode(#[from] serde_json::Error),
    /// The spec could not be written
    #[error("unable to write CDI spec {path:?}: {source}")]
    Write {
        /// The spec file
        path: PathBuf,
        /// The underlying error
        source: io::Error,
    },
}

/// A CDI spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// Version of the CDI specification
    pub cdi_version: String,
    /// `<vendor>/<class>` the devices are qualified with
    pub kind: String,
    /// The devices
    pub devices: Vec<Device>,
}

/// A device of a CDI spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Name unique within the kind, the device ID
    pub name: String,
    /// Edits applied to a container getting the device
    pub container_edits: ContainerEdits,
}

/// Edits of a container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    /// Device nodes to create
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
}

/// A device node to create in a container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    /// Path in the container
    pub path: String,
    /// Path on the host
    pub host_path: String,
    /// cgroup permissions
    pub permissions: String,
}

impl Spec {
    /// Builds the spec of a pool.
    pub fn for_pool(pool: &ResourcePool) -> Self {
        let devices = pool
            .device_pool()
            .values()
            .map(|device| Device {
                name: device.id().to_owned(),
                container_edits: ContainerEdits {
                    device_nodes: device
                        .device_specs()
                        .into_iter()
                        .map(|spec| DeviceNode {
                            path: spec.container_path,
                            host_path: spec.host_path,
                            permissions: spec.permissions,
                        })
                        .collect(),
                },
            })
            .collect();
        Spec {
            cdi_version: CDI_VERSION.to_owned(),
            kind: pool.full_name(),
            devices,
        }
    }

    /// `sha256:<hex>` over the JSON encoding of the spec. Equal specs have equal digests.
    /// The value is only compared against specs this crate wrote. Other CDI writers hash a
    /// different encoding, so their digest of the same spec differs.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_vec(self)?;
        Ok(format!("sha256:{:x}", Sha256::digest(&data)))
    }
}

/// Path of the spec file of a pool.
pub fn spec_path(dir: &Path, pool: &ResourcePool) -> PathBuf {
    dir.join(format!(
        "{}-{}_{}.json",
        SPEC_PREFIX,
        pool.resource_prefix(),
        pool.resource_name()
    ))
}

/// Writes the spec of a pool, leaving the file alone when it already holds the same spec.
pub async fn write_spec(dir: &Path, pool: &ResourcePool) -> Result<PathBuf, CdiError> {
    let spec = Spec::for_pool(pool);
    let path = spec_path(dir, pool);
    let digest = spec.digest()?;

    if let Ok(existing) = tokio::fs::read(&path).await {
        match serde_json::from_slice::<Spec>(&existing).map(|s| s.digest()) {
            Ok(Ok(current)) if current == digest => {
                debug!(path = ?path, "CDI spec is up to date");
                return Ok(path);
            }
            _ => (),
        }
    }

    let write_err = |source| CdiError::Write {
        path: path.clone(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
    tokio::fs::write(&path, serde_json::to_vec_pretty(&spec)?)
        .await
        .map_err(write_err)?;
    info!(path = ?path, %digest, "Wrote CDI spec");
    Ok(path)
}

/// Removes every spec file written by the device plugin.
pub async fn cleanup(dir: &Path) -> io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(SPEC_PREFIX) && name.ends_with(".json") {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(_) => debug!(file = %name, "Removed stale CDI spec"),
                Err(e) => warn!(file = %name, error = %e, "Unable to remove CDI spec"),
            }
        }
    }
    Ok(())
}

/// The annotation requesting the given devices of a pool from the container runtime.
pub fn annotations(pool: &ResourcePool, ids: &[String]) -> HashMap<String, String> {
    let kind = pool.full_name();
    let key = format!(
        "{}{}_{}",
        ANNOTATION_PREFIX,
        SPEC_PREFIX,
        pool.resource_name()
    );
    let value = ids
        .iter()
        .map(|id| format!("{}={}", kind, id))
        .collect::<Vec<_>>()
        .join(",");
    let mut annotations = HashMap::new();
    annotations.insert(key, value);
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::pool::tests::{host, pool};
    use std::sync::Arc;

    fn spec() -> Spec {
        Spec {
            cdi_version: CDI_VERSION.to_owned(),
            kind: "example.com/net".to_owned(),
            devices: vec![Device {
                name: "0000:3b:02.0".to_owned(),
                container_edits: ContainerEdits {
                    device_nodes: vec![DeviceNode {
                        path: "/dev/vfio/70".to_owned(),
                        host_path: "/dev/vfio/70".to_owned(),
                        permissions: "rw".to_owned(),
                    }],
                },
            }],
        }
    }

    #[test]
    fn test_digest_is_stable() {
        let digest = spec().digest().unwrap();
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), "sha256:".len() + 64);
        assert_eq!(digest, spec().digest().unwrap());

        let mut other = spec();
        other.devices[0].name = "0000:3b:02.1".to_owned();
        assert_ne!(digest, other.digest().unwrap());
    }

    #[test]
    fn test_spec_for_pool_and_annotations() {
        let pool = pool(Arc::new(host()), r#"{"resourceName": "net", "selectors": {}}"#);
        let spec = Spec::for_pool(&pool);
        assert_eq!(spec.kind, "intel.com/net");
        assert_eq!(spec.devices.len(), 3);
        assert_eq!(spec.devices[0].container_edits.device_nodes.len(), 2);
        assert!(spec.devices[2].container_edits.device_nodes.is_empty());

        let annotations = annotations(
            &pool,
            &["0000:3b:02.0".to_owned(), "0000:3b:02.1".to_owned()],
        );
        assert_eq!(
            annotations["cdi.k8s.io/sriov-dp_net"],
            "intel.com/net=0000:3b:02.0,intel.com/net=0000:3b:02.1"
        );
    }

    #[tokio::test]
    async fn test_write_and_cleanup() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let pool = pool(Arc::new(host()), r#"{"resourceName": "net", "selectors": {}}"#);
        let path = write_spec(dir.path(), &pool).await.unwrap();
        assert_eq!(path, dir.path().join("sriov-dp-intel.com_net.json"));
        let written: Spec = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, Spec::for_pool(&pool));

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        write_spec(dir.path(), &pool).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);

        std::fs::write(dir.path().join("other-vendor.json"), b"{}").unwrap();
        cleanup(dir.path()).await.unwrap();
        assert!(!path.exists());
        assert!(dir.path().join("other-vendor.json").exists());
    }
}
