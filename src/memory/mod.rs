pub mod allocator;
pub mod block;
pub mod block_list;
pub mod heap;
pub mod metadata;

use crate::device::{DeviceMemory, MemoryPropertyFlags};
use metadata::{AllocationId, BlockMetadata};

/// Default preferred block size for heaps larger than [`SMALL_HEAP_MAX_SIZE`].
pub const DEFAULT_LARGE_HEAP_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Heaps up to this size use an eighth of the heap as their block size.
pub const SMALL_HEAP_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// A user-facing handle to one allocation.
///
/// The handle is a stable identifier resolved through the allocator, so it
/// stays valid when defragmentation moves the allocation to another block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Allocation(pub(crate) AllocationId);

impl Allocation {
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Handle to a custom pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub(crate) u64);

/// The block list an allocation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum PoolKey {
    Default(u32),
    Custom(PoolId),
}

/// Intended use of an allocation, mapped onto memory property flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryUsage {
    /// Only the explicit required/preferred flags apply.
    #[default]
    Unknown,
    /// Device-local memory, ideally not host-visible.
    GpuOnly,
    /// Host-visible and coherent memory, e.g. staging buffers.
    CpuOnly,
    /// Written by the CPU every frame, read by the GPU.
    CpuToGpu,
    /// Written by the GPU, read back by the CPU.
    GpuToCpu,
}

impl MemoryUsage {
    /// (required, preferred) property flags for this usage.
    #[must_use]
    pub const fn property_flags(self) -> (MemoryPropertyFlags, MemoryPropertyFlags) {
        let none = MemoryPropertyFlags::new();
        match self {
            Self::Unknown => (none, none),
            Self::GpuOnly => (none, none.device_local()),
            Self::CpuOnly => (none.host_visible().host_coherent(), none),
            Self::CpuToGpu => (none.host_visible(), none.device_local()),
            Self::GpuToCpu => (none.host_visible(), none.host_cached()),
        }
    }
}

/// Flags controlling allocation behavior (Maps to `VmaAllocationCreateFlags`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationCreateFlags {
    pub dedicated_memory: bool,
    pub never_allocate: bool,
    pub mapped: bool,
}

impl AllocationCreateFlags {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            dedicated_memory: false,
            never_allocate: false,
            mapped: false,
        }
    }

    /// Always give the allocation its own native block.
    #[must_use]
    pub const fn dedicated_memory(mut self) -> Self {
        self.dedicated_memory = true;
        self
    }

    /// Only use existing blocks; never create native memory for this request.
    #[must_use]
    pub const fn never_allocate(mut self) -> Self {
        self.never_allocate = true;
        self
    }

    /// Keep the allocation mapped for its whole lifetime.
    #[must_use]
    pub const fn mapped(mut self) -> Self {
        self.mapped = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationCreateInfo {
    pub usage: MemoryUsage,
    pub flags: AllocationCreateFlags,
    pub required_flags: MemoryPropertyFlags,
    pub preferred_flags: MemoryPropertyFlags,
    /// Bitmask of acceptable memory types; 0 means any.
    pub memory_type_bits: u32,
    pub pool: Option<PoolId>,
}

impl AllocationCreateInfo {
    #[must_use]
    pub fn new(usage: MemoryUsage) -> Self {
        Self {
            usage,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn flags(mut self, flags: AllocationCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn required_flags(mut self, flags: MemoryPropertyFlags) -> Self {
        self.required_flags = flags;
        self
    }

    #[must_use]
    pub const fn preferred_flags(mut self, flags: MemoryPropertyFlags) -> Self {
        self.preferred_flags = flags;
        self
    }

    #[must_use]
    pub const fn memory_type_bits(mut self, bits: u32) -> Self {
        self.memory_type_bits = bits;
        self
    }

    #[must_use]
    pub const fn pool(mut self, pool: PoolId) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Size and placement constraints of the resource to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Bitmask of memory types the resource can live in; 0 means any.
    pub memory_type_bits: u32,
}

impl MemoryRequirements {
    #[must_use]
    pub const fn new(size: u64, alignment: u64) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits: 0,
        }
    }
}

/// Where an allocation currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub memory_type_index: u32,
    pub device_memory: DeviceMemory,
    pub offset: u64,
    pub size: u64,
    /// CPU address of the allocation if it is mapped, null otherwise.
    pub mapped_data: *mut u8,
    pub dedicated: bool,
    pub pool: Option<PoolId>,
    pub last_use_frame: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCreateInfo {
    pub memory_type_index: u32,
    /// Size of every block in the pool; 0 picks the heap's preferred size.
    pub block_size: u64,
    pub min_block_count: usize,
    pub max_block_count: usize,
}

impl PoolCreateInfo {
    #[must_use]
    pub const fn new(memory_type_index: u32) -> Self {
        Self {
            memory_type_index,
            block_size: 0,
            min_block_count: 0,
            max_block_count: usize::MAX,
        }
    }

    #[must_use]
    pub const fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    #[must_use]
    pub const fn block_count(mut self, min: usize, max: usize) -> Self {
        self.min_block_count = min;
        self.max_block_count = max;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorCreateInfo {
    pub preferred_large_heap_block_size: u64,
    /// Frames an allocation stays "in use" after it was last touched.
    pub frame_in_use_count: u32,
    /// Optional per-heap cap on the bytes the allocator may hold.
    pub heap_size_limits: Vec<Option<u64>>,
}

impl Default for AllocatorCreateInfo {
    fn default() -> Self {
        Self {
            preferred_large_heap_block_size: DEFAULT_LARGE_HEAP_BLOCK_SIZE,
            frame_in_use_count: 0,
            heap_size_limits: Vec::new(),
        }
    }
}

impl AllocatorCreateInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn preferred_large_heap_block_size(mut self, size: u64) -> Self {
        self.preferred_large_heap_block_size = size;
        self
    }

    #[must_use]
    pub const fn frame_in_use_count(mut self, frames: u32) -> Self {
        self.frame_in_use_count = frames;
        self
    }

    #[must_use]
    pub fn heap_size_limit(mut self, heap_index: usize, limit: u64) -> Self {
        if self.heap_size_limits.len() <= heap_index {
            self.heap_size_limits.resize(heap_index + 1, None);
        }
        self.heap_size_limits[heap_index] = Some(limit);
        self
    }
}

/// Usage statistics for a set of blocks.
///
/// `used_bytes` counts requested allocation sizes; `unused_bytes` is
/// everything else inside the blocks, alignment padding included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatInfo {
    pub block_count: u32,
    pub allocation_count: u32,
    pub unused_range_count: u32,
    pub used_bytes: u64,
    pub unused_bytes: u64,
    pub allocation_size_min: u64,
    pub allocation_size_max: u64,
    pub unused_range_size_min: u64,
    pub unused_range_size_max: u64,
}

impl StatInfo {
    pub fn add_block(&mut self, metadata: &BlockMetadata) {
        self.block_count += 1;
        let mut used = 0;
        for sub in metadata.suballocations() {
            self.add_allocation(sub.size);
            used += sub.size;
        }
        for region in metadata.free_regions() {
            self.add_unused_range(region.size);
        }
        self.used_bytes += used;
        self.unused_bytes += metadata.size() - used;
    }

    pub fn add_dedicated(&mut self, size: u64) {
        self.block_count += 1;
        self.add_allocation(size);
        self.used_bytes += size;
    }

    pub fn merge(&mut self, other: &Self) {
        if other.allocation_count > 0 {
            self.allocation_size_min = if self.allocation_count == 0 {
                other.allocation_size_min
            } else {
                self.allocation_size_min.min(other.allocation_size_min)
            };
        }
        if other.unused_range_count > 0 {
            self.unused_range_size_min = if self.unused_range_count == 0 {
                other.unused_range_size_min
            } else {
                self.unused_range_size_min.min(other.unused_range_size_min)
            };
        }
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.unused_range_count += other.unused_range_count;
        self.used_bytes += other.used_bytes;
        self.unused_bytes += other.unused_bytes;
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }

    fn add_allocation(&mut self, size: u64) {
        self.allocation_size_min = if self.allocation_count == 0 {
            size
        } else {
            self.allocation_size_min.min(size)
        };
        self.allocation_size_max = self.allocation_size_max.max(size);
        self.allocation_count += 1;
    }

    fn add_unused_range(&mut self, size: u64) {
        self.unused_range_size_min = if self.unused_range_count == 0 {
            size
        } else {
            self.unused_range_size_min.min(size)
        };
        self.unused_range_size_max = self.unused_range_size_max.max(size);
        self.unused_range_count += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub total: StatInfo,
    pub memory_type: Vec<StatInfo>,
    pub memory_heap: Vec<StatInfo>,
}
