pub mod allocator;
pub mod cache;
pub mod pool;
pub mod stats;

pub use allocator::{DeviceAllocator, DeviceMemory, HostAllocator, HostMemory, MemoryKind, ELEMENT_BYTES};
pub use cache::{CacheKey, WeightCache};
pub use pool::{DeviceMemoryPool, DevicePtr};
pub use stats::MemoryStats;
