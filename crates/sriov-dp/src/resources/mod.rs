//! Resource pools and the device plugin servers advertising them to the kubelet.
pub mod allocator;
pub mod pool;
pub mod server;
pub mod util;

pub use allocator::{Allocator, PackedAllocator};
pub use pool::{PoolError, ResourcePool};
pub use server::{ResourceServer, ServerError, ServerState};
