//! Preferred allocation policies.
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tracing::{debug, warn};

use crate::device_plugin_api::v1beta1::ContainerPreferredAllocationRequest;
use crate::devices::HostDevice;
use crate::resource_config::PACKED_ALLOCATE_POLICY;

/// Chooses which of the available devices the kubelet should allocate to a container.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Returns the preferred device IDs, or an empty list when the request cannot be satisfied.
    fn allocate(
        &self,
        request: &ContainerPreferredAllocationRequest,
        pool: &BTreeMap<String, HostDevice>,
    ) -> Vec<String>;
}

/// Returns the allocator implementing a configured `allocatePolicy`. An empty policy means no
/// preference, unknown policies are logged and ignored.
pub fn for_policy(policy: &str) -> Option<Box<dyn Allocator>> {
    match policy {
        "" => None,
        PACKED_ALLOCATE_POLICY => Some(Box::new(PackedAllocator)),
        other => {
            warn!(policy = other, "Unknown allocatePolicy, no preferred allocation will be offered");
            None
        }
    }
}

/// Packs allocations on the lowest device IDs: the must-include devices first, then the smallest
/// remaining available IDs in lexicographic order.
#[derive(Clone, Copy, Debug, Default)]
pub struct PackedAllocator;

impl Allocator for PackedAllocator {
    fn allocate(
        &self,
        request: &ContainerPreferredAllocationRequest,
        pool: &BTreeMap<String, HostDevice>,
    ) -> Vec<String> {
        let size = request.allocation_size;
        let available = &request.available_device_i_ds;
        let must_include = &request.must_include_device_i_ds;

        if size <= 0 {
            debug!(size, "Allocation size must be positive");
            return Vec::new();
        }
        let size = size as usize;
        if available.len() < size {
            debug!(size, available = available.len(), "Not enough available devices");
            return Vec::new();
        }
        if must_include.len() > size {
            debug!(size, must_include = must_include.len(), "More must-include devices than requested");
            return Vec::new();
        }
        if let Some(id) = must_include.iter().find(|id| !available.contains(*id)) {
            debug!(device = %id, "Must-include device is not available");
            return Vec::new();
        }
        if let Some(id) = available.iter().find(|id| !pool.contains_key(*id)) {
            debug!(device = %id, "Available device is not in the pool");
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut preferred = must_include
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        let mut rest = available
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        rest.sort();
        preferred.extend(rest);
        preferred.truncate(size);
        preferred
    }
}
