//! Suballocating memory manager for graphics device heaps.
//!
//! Many small allocation requests are carved out of a few large native
//! memory blocks per memory type ([`memory`]). Live allocations can be
//! compacted across blocks in budgeted passes ([`defrag`]), with device-side
//! copies tracked by a background fence waiter ([`sync`]). The native device
//! is reached only through the traits in [`device`].

pub mod defrag;
pub mod device;
pub mod error;
pub mod memory;
pub mod sync;
pub mod utils;

pub use defrag::{
    DefragmentationContext, DefragmentationInfo, DefragmentationStats, MoveDescriptor, MoveKind,
    PassState,
};
pub use device::{
    CommandDevice, DeviceMemory, Fence, FenceDevice, HostDevice, MemoryDevice,
    MemoryPropertyFlags, ResourceHandle,
};
pub use error::{VmaError, VmaResult};
pub use memory::allocator::Allocator;
pub use memory::{
    Allocation, AllocationCreateFlags, AllocationCreateInfo, AllocationInfo, AllocatorCreateInfo,
    MemoryRequirements, MemoryUsage, PoolCreateInfo, PoolId, StatInfo, Stats,
};
pub use sync::{CompletionFuture, WaitScheduler};
