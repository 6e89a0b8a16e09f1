//! Capability interfaces the allocator consumes.
//!
//! The allocator never talks to a graphics API directly. Block creation,
//! mapping and binding go through [`MemoryDevice`], copy commands for
//! device-local defragmentation moves go through [`CommandDevice`], and the
//! completion scheduler polls [`FenceDevice`]. All three are injected as
//! trait objects so tests can run against [`host::HostDevice`].

pub mod host;

use crate::error::VmaResult;
use std::time::Duration;

pub use host::HostDevice;

/// Opaque native handle of one device memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMemory(pub u64);

/// Opaque native handle of a buffer or image that can be bound to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u64);

/// Opaque handle of a recorded command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBuffer(pub u64);

/// Completion token of a submitted command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence(pub u64);

/// Property flags of a memory type (Maps to `VkMemoryPropertyFlags`)
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryPropertyFlags {
    pub device_local: bool,
    pub host_visible: bool,
    pub host_coherent: bool,
    pub host_cached: bool,
}

impl MemoryPropertyFlags {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            device_local: false,
            host_visible: false,
            host_coherent: false,
            host_cached: false,
        }
    }

    #[must_use]
    pub const fn device_local(mut self) -> Self {
        self.device_local = true;
        self
    }

    #[must_use]
    pub const fn host_visible(mut self) -> Self {
        self.host_visible = true;
        self
    }

    #[must_use]
    pub const fn host_coherent(mut self) -> Self {
        self.host_coherent = true;
        self
    }

    #[must_use]
    pub const fn host_cached(mut self) -> Self {
        self.host_cached = true;
        self
    }

    /// True if every flag set in `other` is also set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.device_local || !other.device_local)
            && (self.host_visible || !other.host_visible)
            && (self.host_coherent || !other.host_coherent)
            && (self.host_cached || !other.host_cached)
    }

    /// Number of flags set in `wanted` that `self` lacks.
    #[must_use]
    pub const fn missing(self, wanted: Self) -> u32 {
        (wanted.device_local && !self.device_local) as u32
            + (wanted.host_visible && !self.host_visible) as u32
            + (wanted.host_coherent && !self.host_coherent) as u32
            + (wanted.host_cached && !self.host_cached) as u32
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            device_local: self.device_local || other.device_local,
            host_visible: self.host_visible || other.host_visible,
            host_coherent: self.host_coherent || other.host_coherent,
            host_cached: self.host_cached || other.host_cached,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one of the fences is signaled.
    Signaled,
    TimedOut,
}

/// Native memory operations: block creation, mapping and binding.
pub trait MemoryDevice: Send + Sync {
    fn memory_types(&self) -> &[MemoryType];

    fn memory_heaps(&self) -> &[MemoryHeap];

    /// Allocate one native block of `size` bytes in `memory_type_index`.
    ///
    /// # Errors
    /// `OutOfDeviceMemory` when the device refuses the allocation.
    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> VmaResult<DeviceMemory>;

    fn free_memory(&self, memory: DeviceMemory);

    /// Map the whole block for CPU access.
    ///
    /// # Errors
    /// `MemoryMapFailed` if the memory is not host-visible or the map fails.
    fn map_memory(&self, memory: DeviceMemory) -> VmaResult<*mut u8>;

    fn unmap_memory(&self, memory: DeviceMemory);

    /// Bind a buffer or image to `memory` at `offset`.
    ///
    /// # Errors
    /// Device-specific bind failure.
    fn bind_resource(
        &self,
        resource: ResourceHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> VmaResult<()>;
}

/// Command recording and submission, used for device-local moves.
pub trait CommandDevice: Send + Sync {
    /// Record a copy of `size` bytes between two memory blocks.
    ///
    /// # Errors
    /// Device-specific recording failure.
    fn record_copy(
        &self,
        src: DeviceMemory,
        src_offset: u64,
        dst: DeviceMemory,
        dst_offset: u64,
        size: u64,
    ) -> VmaResult<CommandBuffer>;

    /// Submit a recorded command buffer; the returned fence signals on completion.
    ///
    /// # Errors
    /// Submission failure; `DeviceLost` is fatal.
    fn submit(&self, commands: CommandBuffer) -> VmaResult<Fence>;
}

/// Fence queries used by the completion scheduler, which owns every fence
/// handed to it and destroys it once it has resolved.
pub trait FenceDevice: Send + Sync {
    /// Non-blocking status query.
    ///
    /// # Errors
    /// Device error reported for this fence.
    fn fence_status(&self, fence: Fence) -> VmaResult<FenceStatus>;

    /// Block until any of `fences` is signaled or `timeout` elapses.
    ///
    /// # Errors
    /// Device error; `DeviceLost` stops the completion scheduler.
    fn wait_for_fences(&self, fences: &[Fence], timeout: Duration) -> VmaResult<WaitOutcome>;

    /// Releases a fence whose outcome has been observed. Later queries of it
    /// report an unknown fence.
    fn destroy_fence(&self, fence: Fence);
}
